//! HTTP API handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::candles::{Candle, CandleKey};
use crate::channel::ChannelKey;
use crate::orderbook::{BookView, DepthLadder};

/// Message counters published by the feed service.
#[derive(Debug, Default)]
pub struct FeedStats {
    /// Messages handed to the registry.
    pub messages_processed: AtomicU64,
    /// Malformed, ignored or untracked messages.
    pub messages_dropped: AtomicU64,
    /// Book messages rejected by a synchronizer.
    pub book_errors: AtomicU64,
    /// Channel resyncs requested.
    pub resyncs: AtomicU64,
}

/// Application state shared with handlers.
///
/// The feed service is the only writer; handlers read copies.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Whether the feed is connected and subscribed.
    pub ready: Arc<AtomicBool>,
    /// Latest book view per channel.
    pub books: Arc<DashMap<ChannelKey, BookView>>,
    /// Current daily bar per channel.
    pub daily_bars: Arc<DashMap<ChannelKey, Candle>>,
    /// Every aggregated candle.
    pub candles: Arc<DashMap<CandleKey, Candle>>,
    /// Message counters.
    pub stats: Arc<FeedStats>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics_handle: Option<PrometheusHandle>,
    /// Process start time.
    pub started_at: OffsetDateTime,
}

impl AppState {
    /// Create new app state.
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            books: Arc::new(DashMap::new()),
            daily_bars: Arc::new(DashMap::new()),
            candles: Arc::new(DashMap::new()),
            stats: Arc::new(FeedStats::default()),
            metrics_handle: None,
            started_at: OffsetDateTime::now_utc(),
        }
    }

    /// Attach a Prometheus handle for `/metrics`.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Set ready state.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Check if ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Candles for one market, optionally one interval, in key order.
    pub fn candles_for(&self, market_id: &str, interval_seconds: Option<i64>) -> Vec<Candle> {
        let mut candles: Vec<Candle> = self
            .candles
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.market_id == market_id
                    && interval_seconds.map_or(true, |i| key.interval_seconds == i)
            })
            .map(|entry| entry.value().clone())
            .collect();
        candles.sort_by_key(Candle::key);
        candles
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status: "ok".
    pub status: &'static str,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Whether the feed is connected.
    pub ready: bool,
    /// Channels with a synced book.
    pub books: usize,
}

/// Status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Service status.
    pub status: &'static str,
    /// Process start time, RFC 3339.
    pub started_at: String,
    /// Seconds since start.
    pub uptime_seconds: i64,
    /// Statistics.
    pub stats: StatsResponse,
}

/// Statistics in status response.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Messages processed.
    pub messages_processed: u64,
    /// Messages dropped.
    pub messages_dropped: u64,
    /// Book errors.
    pub book_errors: u64,
    /// Channel resyncs.
    pub resyncs: u64,
    /// Channels with a synced book.
    pub books: usize,
    /// Channels with a daily bar.
    pub daily_bars: usize,
    /// Candles held.
    pub candles: usize,
}

/// One channel's book in API responses.
#[derive(Debug, Serialize)]
pub struct BookResponse {
    /// Channel key.
    pub channel: ChannelKey,
    /// Best ask minus best bid.
    pub spread: Option<Decimal>,
    /// Midpoint of the top of book.
    pub mid_price: Option<Decimal>,
    /// Spread as a percentage of the mid price.
    pub spread_percent: Option<Decimal>,
    /// Levels and sequence.
    #[serde(flatten)]
    pub view: BookView,
}

impl BookResponse {
    fn new(channel: ChannelKey, view: BookView) -> Self {
        Self {
            channel,
            spread: view.spread(),
            mid_price: view.mid_price(),
            spread_percent: view.spread_percent(),
            view,
        }
    }
}

/// One channel's book with its depth ladder.
#[derive(Debug, Serialize)]
pub struct BookDetailResponse {
    /// Book summary and levels.
    #[serde(flatten)]
    pub book: BookResponse,
    /// Grouping tick size applied to the ladder, if any.
    pub group: Option<Decimal>,
    /// Cumulative depth per side, best level first.
    pub ladder: DepthLadder,
}

/// Query parameters for `/api/v1/books/:channel`.
#[derive(Debug, Deserialize)]
pub struct BookQuery {
    /// Merge levels into buckets of this price step.
    pub group: Option<Decimal>,
}

/// Query parameters for `/api/v1/candles`.
#[derive(Debug, Deserialize)]
pub struct CandleQuery {
    /// Market id, e.g. `BTC-USD`.
    pub market: String,
    /// Interval in seconds; all intervals when absent.
    pub interval: Option<i64>,
}

/// Error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// What went wrong.
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: error.into() })).into_response()
}

/// Health check handler - always returns 200.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Readiness check handler - returns 200 if ready, 503 otherwise.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let is_ready = state.is_ready();
    let response = ReadyResponse {
        ready: is_ready,
        books: state.books.len(),
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Status handler - returns feed status and statistics.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let status = if state.is_ready() { "running" } else { "starting" };
    let now = OffsetDateTime::now_utc();

    Json(StatusResponse {
        status,
        started_at: state.started_at.format(&Rfc3339).unwrap_or_default(),
        uptime_seconds: (now - state.started_at).whole_seconds(),
        stats: StatsResponse {
            messages_processed: state.stats.messages_processed.load(Ordering::Relaxed),
            messages_dropped: state.stats.messages_dropped.load(Ordering::Relaxed),
            book_errors: state.stats.book_errors.load(Ordering::Relaxed),
            resyncs: state.stats.resyncs.load(Ordering::Relaxed),
            books: state.books.len(),
            daily_bars: state.daily_bars.len(),
            candles: state.candles.len(),
        },
    })
}

/// All published books, sorted by channel.
pub async fn books(State(state): State<AppState>) -> impl IntoResponse {
    let mut books: Vec<BookResponse> = state
        .books
        .iter()
        .map(|entry| BookResponse::new(entry.key().clone(), entry.value().clone()))
        .collect();
    books.sort_by(|a, b| a.channel.cmp(&b.channel));
    Json(books)
}

/// One channel's book and depth ladder; 404 when the channel has none.
///
/// `?group=<step>` merges ladder levels into price buckets (bids down, asks up).
pub async fn book(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Query(query): Query<BookQuery>,
) -> Response {
    let key: ChannelKey = match channel.parse() {
        Ok(key) => key,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let Some(view) = state.books.get(&key).map(|v| v.clone()) else {
        return error_response(StatusCode::NOT_FOUND, format!("no book for {key}"));
    };

    let ladder = match query.group {
        Some(step) => match view.grouped_ladder(step) {
            Ok(ladder) => ladder,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
        },
        None => view.depth_ladder(),
    };

    Json(BookDetailResponse {
        book: BookResponse::new(key, view),
        group: query.group,
        ladder,
    })
    .into_response()
}

/// Candles for a market, sorted by interval then open time.
pub async fn candles(State(state): State<AppState>, Query(query): Query<CandleQuery>) -> Response {
    if let Some(interval) = query.interval.filter(|&i| i <= 0) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("interval must be positive, got {interval}"),
        );
    }
    Json(state.candles_for(&query.market, query.interval)).into_response()
}

/// Daily bars keyed by channel.
pub async fn daily_bars(State(state): State<AppState>) -> impl IntoResponse {
    let bars: HashMap<String, Candle> = state
        .daily_bars
        .iter()
        .map(|entry| (entry.key().to_string(), entry.value().clone()))
        .collect();
    Json(bars)
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "metrics recorder not installed"),
    }
}
