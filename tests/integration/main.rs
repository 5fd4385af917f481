//! End-to-end tests for the market feed pipeline.
//!
//! The replay tests drive [`FeedService`] directly with recorded-style
//! payloads; the live test runs the real WebSocket transport against a local
//! server.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use market_feed::api::AppState;
use market_feed::candles::CandleKey;
use market_feed::channel::{ChannelKey, ControlAction, ControlMessage, Dispatch, RegistryConfig};
use market_feed::feed::{FeedEvent, MarketFeed};
use market_feed::service::FeedService;

const BTC: &str = "0~Coinbase~BTC~USD";

fn btc() -> ChannelKey {
    ChannelKey::new("Coinbase", "BTC", "USD")
}

fn service_with(config: RegistryConfig) -> (FeedService, mpsc::UnboundedReceiver<ControlMessage>) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let service = FeedService::new(&[btc()], vec![60, 3_600], config, control_tx, AppState::new())
        .expect("valid service");
    (service, control_rx)
}

fn snapshot(bids: &[(&str, &str)], asks: &[(&str, &str)]) -> String {
    let side = |levels: &[(&str, &str)]| {
        levels
            .iter()
            .map(|(p, s)| format!(r#"{{"price":"{p}","size":"{s}"}}"#))
            .collect::<Vec<_>>()
            .join(",")
    };
    format!(
        r#"{{"channel":"{BTC}","message_id":1,"contents":{{"bids":[{}],"asks":[{}]}}}}"#,
        side(bids),
        side(asks)
    )
}

fn diff(entries: &str) -> String {
    format!(r#"{{"channel":"{BTC}","contents":[{entries}]}}"#)
}

fn trade(ts: i64, price: &str) -> String {
    format!("{BTC}~2~99~{ts}~0.25~{price}~12.5~1f")
}

#[test]
fn replay_builds_book_and_candles() {
    let (mut service, _control) = service_with(RegistryConfig::default());
    service.handle_event(FeedEvent::Connected);

    let log = [
        snapshot(
            &[("100", "5"), ("99.5", "2"), ("99", "1")],
            &[("101", "4"), ("101.5", "3")],
        ),
        diff(r#"{"bids":["100","7"]},{"asks":["101","0"]}"#),
        diff(r#"{"bids":[["99.5","0"],["100.5","1"]]}"#),
        trade(3_600, "100.25"),
        trade(3_630, "100.75"),
        trade(3_700, "100.50"),
        "20~Coinbase~BTC~USD~heartbeat".to_string(),
        "this is not a feed message".to_string(),
    ];
    for line in &log {
        service.handle_message(line);
    }

    let view = service.registry().book(&btc()).expect("book synced");
    let bids: Vec<_> = view.bids.iter().map(|l| (l.price, l.size)).collect();
    let asks: Vec<_> = view.asks.iter().map(|l| (l.price, l.size)).collect();
    assert_eq!(bids, vec![(dec!(100.5), dec!(1)), (dec!(100), dec!(7)), (dec!(99), dec!(1))]);
    assert_eq!(asks, vec![(dec!(101.5), dec!(3))]);
    assert_eq!(view.last_seq, 3);

    let candles = service.aggregator().all_candles();
    let keys: Vec<_> = candles
        .iter()
        .map(|c| (c.interval_seconds, c.open_time_seconds))
        .collect();
    assert_eq!(keys, vec![(60, 3_600), (60, 3_660), (3_600, 3_600)]);

    let hourly = service
        .aggregator()
        .candle(&CandleKey::new("BTC-USD", 3_600, 3_600))
        .expect("hourly candle");
    assert_eq!(
        (hourly.open, hourly.high, hourly.low, hourly.close),
        (dec!(100.25), dec!(100.75), dec!(100.25), dec!(100.50))
    );

    let published = service.state();
    assert_eq!(published.books.get(&btc()).map(|b| b.best_bid()), Some(Some(dec!(100.5))));
    assert_eq!(published.daily_bars.get(&btc()).map(|b| b.close), Some(dec!(100.50)));
    assert_eq!(published.stats.messages_dropped.load(std::sync::atomic::Ordering::Relaxed), 2);
}

#[test]
fn crossed_diff_is_resolved_by_sequence() {
    let (mut service, _control) = service_with(RegistryConfig::default());
    service.handle_event(FeedEvent::Connected);
    service.handle_message(&snapshot(&[("100", "5")], &[("101", "5")]));

    let outcome = service.handle_message(&diff(r#"{"bids":["101","3"]}"#));

    let Some(Dispatch::Book { report, .. }) = outcome else {
        panic!("expected book dispatch, got {outcome:?}");
    };
    assert_eq!((report.bids_removed, report.asks_removed), (0, 1));

    let view = service.registry().book(&btc()).unwrap();
    assert_eq!(view.best_bid(), Some(dec!(101)));
    assert_eq!(view.bids[0].size, dec!(3));
    assert!(view.asks.is_empty());
    assert!(!view.is_crossed());
}

#[test]
fn depth_cap_limits_retained_levels() {
    let (mut service, _control) = service_with(RegistryConfig {
        depth_cap: 3,
        view_depth: 2,
    });
    service.handle_event(FeedEvent::Connected);
    service.handle_message(&snapshot(
        &[("95", "1"), ("96", "1"), ("97", "1"), ("98", "1"), ("99", "1")],
        &[("105", "1"), ("104", "1"), ("103", "1"), ("102", "1"), ("101", "1")],
    ));

    let book = service.registry().synchronizer(&btc()).unwrap();
    assert_eq!(book.bids().len(), 3);
    assert_eq!(book.asks().len(), 3);
    assert_eq!(book.bids().iter().last().map(|l| l.price), Some(dec!(97)));
    assert_eq!(book.asks().iter().last().map(|l| l.price), Some(dec!(103)));

    let view = service.registry().book(&btc()).unwrap();
    assert_eq!(view.bids.len(), 2);
    assert_eq!(view.asks.len(), 2);
}

#[test]
fn diffs_before_snapshot_trigger_resync() {
    let (mut service, mut control) = service_with(RegistryConfig::default());
    service.handle_event(FeedEvent::Connected);
    while control.try_recv().is_ok() {}

    assert_eq!(service.handle_message(&diff(r#"{"asks":["101","1"]}"#)), None);

    let actions: Vec<_> = std::iter::from_fn(|| control.try_recv().ok())
        .map(|m| (m.action, m.subs))
        .collect();
    assert_eq!(
        actions,
        vec![
            (ControlAction::SubRemove, vec![BTC.to_string()]),
            (ControlAction::SubAdd, vec![BTC.to_string()]),
        ]
    );
    assert!(service.registry().book(&btc()).is_none());
}

#[tokio::test]
async fn live_pipeline_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (sub_tx, sub_rx) = oneshot::channel();

    let frames = vec![
        snapshot(&[("100", "5")], &[("101", "5")]),
        diff(r#"{"asks":["100.5","2"]}"#),
        trade(1_002, "100.25"),
    ];
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let subscription = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        };
        let _ = sub_tx.send(subscription);

        for frame in frames {
            ws.send(Message::Text(frame)).await.unwrap();
        }
        // Hold the connection open until the client goes away.
        while let Some(Ok(_)) = ws.next().await {}
    });

    let state = AppState::new();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let service =
        FeedService::new(&[btc()], vec![60], RegistryConfig::default(), control_tx, state.clone()).unwrap();
    let feed = Arc::new(MarketFeed::new(format!("ws://{addr}")));
    let events = feed.clone().run_with_reconnect(control_rx);
    let service_task = tokio::spawn(service.run(events));

    let subscription = tokio::time::timeout(Duration::from_secs(5), sub_rx)
        .await
        .expect("subscription sent in time")
        .unwrap();
    assert_eq!(subscription, format!(r#"{{"action":"SubAdd","subs":["{BTC}"]}}"#));

    tokio::time::timeout(Duration::from_secs(5), async {
        while state.candles.is_empty() || !state.books.contains_key(&btc()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pipeline published in time");

    assert!(state.is_ready());
    assert!(feed.is_connected());
    let view = state.books.get(&btc()).map(|b| b.clone()).unwrap();
    assert_eq!(view.best_ask(), Some(dec!(100.5)));
    assert_eq!(view.spread(), Some(dec!(0.5)));
    assert!(state.candles.contains_key(&CandleKey::new("BTC-USD", 60, 960)));

    service_task.abort();
    server.abort();
}
