//! WebSocket transport for the market data stream.
//!
//! Features:
//! - Automatic reconnection with exponential backoff
//! - Heartbeat pings and staleness detection
//! - Subscription control messages written as JSON text frames

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::channel::ControlMessage;
use crate::error::WsError;
use crate::metrics;

const EVENT_BUFFER: usize = 1000;

/// Reconnection configuration for WebSocket.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum backoff delay in seconds.
    pub max_delay_s: u64,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_s: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_s: 30,
            backoff_multiplier: 2.0,
            heartbeat_interval_s: 30,
        }
    }
}

impl ReconnectConfig {
    /// Calculate next delay with exponential backoff.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let max_delay_ms = self.max_delay_s * 1000;
        let clamped_ms = delay_ms.min(max_delay_ms as f64) as u64;
        Duration::from_millis(clamped_ms)
    }

    fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s.max(1))
    }
}

/// Transport event, delivered in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// A connection was established; earlier subscriptions are gone.
    Connected,
    /// One text frame.
    Message(String),
    /// The connection dropped; a reconnect follows.
    Disconnected,
}

/// Streaming connection with automatic reconnection.
pub struct MarketFeed {
    /// WebSocket URL.
    ws_url: String,
    /// Reconnection configuration.
    reconnect_config: ReconnectConfig,
    /// Connection state (atomic for thread safety).
    connected: Arc<AtomicBool>,
    /// Reconnection attempt counter.
    reconnect_attempts: Arc<AtomicU64>,
    /// Last inbound frame timestamp.
    last_message_time: Arc<RwLock<Option<Instant>>>,
}

impl MarketFeed {
    /// Create a new feed client.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self::with_reconnect_config(ws_url, ReconnectConfig::default())
    }

    /// Create with custom reconnection config.
    pub fn with_reconnect_config(ws_url: impl Into<String>, config: ReconnectConfig) -> Self {
        Self {
            ws_url: ws_url.into(),
            reconnect_config: config,
            connected: Arc::new(AtomicBool::new(false)),
            reconnect_attempts: Arc::new(AtomicU64::new(0)),
            last_message_time: Arc::new(RwLock::new(None)),
        }
    }

    /// Endpoint this feed connects to.
    pub fn url(&self) -> &str {
        &self.ws_url
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Get reconnection attempt count.
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Check if connection appears stale (no frames in two heartbeat intervals).
    pub fn is_stale(&self) -> bool {
        if let Ok(time) = self.last_message_time.read() {
            if let Some(last) = *time {
                return last.elapsed() > self.reconnect_config.heartbeat() * 2;
            }
        }
        // No frames received yet - not stale
        false
    }

    fn touch(&self) {
        if let Ok(mut time) = self.last_message_time.write() {
            *time = Some(Instant::now());
        }
    }

    /// Run with automatic reconnection on disconnect.
    ///
    /// Control messages from `control_rx` are written to the live
    /// connection. Messages queued while disconnected are discarded on the
    /// next connect; the consumer is expected to resubscribe on
    /// [`FeedEvent::Connected`]. The task stops when either `control_rx`
    /// closes or the returned receiver is dropped.
    pub fn run_with_reconnect(
        self: Arc<Self>,
        mut control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    ) -> mpsc::Receiver<FeedEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            let mut attempt = 0u32;

            loop {
                info!(attempt = attempt, url = %self.ws_url, "Attempting WebSocket connection");

                match self.session(&mut control_rx, &tx).await {
                    Ok(()) => {
                        info!("Feed stopped");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, attempt = attempt, "WebSocket session ended");
                    }
                }

                if self.connected.swap(false, Ordering::SeqCst) {
                    attempt = 0;
                    if tx.send(FeedEvent::Disconnected).await.is_err() {
                        return;
                    }
                }

                // Calculate backoff delay
                let delay = self.reconnect_config.next_delay(attempt);
                self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
                metrics::inc_ws_reconnects();

                info!(delay_ms = delay.as_millis(), "Reconnecting after delay");
                tokio::time::sleep(delay).await;

                attempt = attempt.saturating_add(1);
            }
        });

        rx
    }

    /// One connection lifetime. `Ok(())` means the consumer went away.
    async fn session(
        &self,
        control_rx: &mut mpsc::UnboundedReceiver<ControlMessage>,
        tx: &mpsc::Sender<FeedEvent>,
    ) -> Result<(), WsError> {
        let (ws_stream, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;

        self.connected.store(true, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.touch();

        let (mut write, mut read) = ws_stream.split();

        let mut discarded = 0usize;
        while control_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded = discarded, "Discarded control messages queued while offline");
        }

        if tx.send(FeedEvent::Connected).await.is_err() {
            return Ok(());
        }
        info!("WebSocket connected");

        let mut heartbeat = tokio::time::interval(self.reconnect_config.heartbeat());
        heartbeat.tick().await;

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.touch();
                        if tx.send(FeedEvent::Message(text)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // Note: tungstenite auto-responds to pings
                        self.touch();
                        debug!("Received ping");
                    }
                    Some(Ok(Message::Pong(_))) => {
                        self.touch();
                        debug!("Received pong");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!(frame = ?frame, "WebSocket closed");
                        return Err(WsError::ConnectionClosed {
                            code: frame.as_ref().map(|f| u16::from(f.code)),
                            reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(WsError::ConnectionClosed {
                            code: None,
                            reason: "stream ended".to_string(),
                        });
                    }
                },
                control = control_rx.recv() => match control {
                    Some(message) => {
                        let json = message
                            .to_json()
                            .map_err(|e| WsError::SendFailed(e.to_string()))?;
                        debug!(action = %message.action, subs = message.subs.len(), "Sending control message");
                        write
                            .send(Message::Text(json))
                            .await
                            .map_err(|e| WsError::SendFailed(e.to_string()))?;
                    }
                    None => {
                        let _ = write.close().await;
                        return Ok(());
                    }
                },
                _ = heartbeat.tick() => {
                    if self.is_stale() {
                        warn!("No frames within two heartbeat intervals");
                        return Err(WsError::ConnectionClosed {
                            code: None,
                            reason: "stale connection".to_string(),
                        });
                    }
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| WsError::SendFailed(e.to_string()))?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKey;
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    #[test]
    fn backoff_grows_and_clamps() {
        let config = ReconnectConfig {
            initial_delay_ms: 100,
            max_delay_s: 1,
            backoff_multiplier: 2.0,
            heartbeat_interval_s: 30,
        };
        assert_eq!(config.next_delay(0), Duration::from_millis(100));
        assert_eq!(config.next_delay(2), Duration::from_millis(400));
        assert_eq!(config.next_delay(10), Duration::from_secs(1));
    }

    #[test]
    fn fresh_feed_is_idle() {
        let feed = MarketFeed::new("ws://127.0.0.1:1");
        assert!(!feed.is_connected());
        assert!(!feed.is_stale());
        assert_eq!(feed.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn forwards_frames_and_control_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("hello".to_string())).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return text,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
        });

        let channel = ChannelKey::new("Coinbase", "BTC", "USD");
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        // Queued before the connection exists: must not reach the server.
        control_tx.send(ControlMessage::unsubscribe([&channel])).unwrap();

        let feed = Arc::new(MarketFeed::new(format!("ws://{addr}")));
        let mut events = feed.clone().run_with_reconnect(control_rx);

        assert_eq!(events.recv().await, Some(FeedEvent::Connected));
        assert_eq!(events.recv().await, Some(FeedEvent::Message("hello".to_string())));
        assert!(feed.is_connected());

        control_tx.send(ControlMessage::subscribe([&channel])).unwrap();
        let received = server.await.unwrap();
        assert_eq!(received, r#"{"action":"SubAdd","subs":["0~Coinbase~BTC~USD"]}"#);
    }
}
