//! Prometheus metrics for the feed pipeline.
//!
//! This module provides metrics for:
//! - Inbound message volume and drops
//! - Order book updates, crossed-book resolution and depth trimming
//! - Candle aggregation
//! - WebSocket reconnects and dispatch latency

use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use tracing::debug;

// === Metric Name Constants ===

/// Dispatch latency metric name.
pub const METRIC_DISPATCH_LATENCY: &str = "feed_dispatch_latency_ms";
/// HTTP request latency metric name.
pub const METRIC_HTTP_REQUEST_LATENCY: &str = "http_request_latency_ms";
/// Inbound messages counter metric name.
pub const METRIC_MESSAGES_RECEIVED: &str = "feed_messages_received_total";
/// Dropped messages counter metric name.
pub const METRIC_MESSAGES_DROPPED: &str = "feed_messages_dropped_total";
/// Applied book messages counter metric name.
pub const METRIC_BOOK_UPDATES: &str = "book_updates_total";
/// Rejected book messages counter metric name.
pub const METRIC_BOOK_ERRORS: &str = "book_errors_total";
/// Crossed-book resolutions counter metric name.
pub const METRIC_CROSSED_RESOLUTIONS: &str = "book_crossed_resolutions_total";
/// Levels removed while uncrossing metric name.
pub const METRIC_CROSSED_LEVELS_REMOVED: &str = "book_crossed_levels_removed_total";
/// Levels trimmed by the depth cap metric name.
pub const METRIC_LEVELS_TRIMMED: &str = "book_levels_trimmed_total";
/// Channel resyncs counter metric name.
pub const METRIC_RESYNCS: &str = "book_resyncs_total";
/// Tracked channels gauge metric name.
pub const METRIC_TRACKED_CHANNELS: &str = "feed_tracked_channels";
/// Aggregated ticks counter metric name.
pub const METRIC_TICKS_AGGREGATED: &str = "candle_ticks_aggregated_total";
/// Rejected ticks counter metric name.
pub const METRIC_TICKS_REJECTED: &str = "candle_ticks_rejected_total";
/// WebSocket reconnects counter metric name.
pub const METRIC_WS_RECONNECTS: &str = "ws_reconnects_total";

/// Initialize all metric descriptions.
/// Call this once at startup to register metrics with descriptions.
pub fn init_metrics() {
    // Latency histograms
    describe_histogram!(
        METRIC_DISPATCH_LATENCY,
        "Time to route and apply one inbound message in milliseconds"
    );
    describe_histogram!(
        METRIC_HTTP_REQUEST_LATENCY,
        "HTTP request latency in milliseconds"
    );

    // Counters
    describe_counter!(
        METRIC_MESSAGES_RECEIVED,
        "Total number of inbound feed messages"
    );
    describe_counter!(
        METRIC_MESSAGES_DROPPED,
        "Total number of inbound messages dropped, by reason"
    );
    describe_counter!(METRIC_BOOK_UPDATES, "Total number of applied book messages");
    describe_counter!(METRIC_BOOK_ERRORS, "Total number of rejected book messages");
    describe_counter!(
        METRIC_CROSSED_RESOLUTIONS,
        "Total number of crossed books resolved"
    );
    describe_counter!(
        METRIC_CROSSED_LEVELS_REMOVED,
        "Total number of levels removed while uncrossing books"
    );
    describe_counter!(
        METRIC_LEVELS_TRIMMED,
        "Total number of levels dropped by the depth cap"
    );
    describe_counter!(METRIC_RESYNCS, "Total number of channel resyncs");
    describe_counter!(
        METRIC_TICKS_AGGREGATED,
        "Total number of ticks folded into candles"
    );
    describe_counter!(METRIC_TICKS_REJECTED, "Total number of invalid ticks");
    describe_counter!(
        METRIC_WS_RECONNECTS,
        "Total number of WebSocket reconnections"
    );

    // Gauges
    describe_gauge!(METRIC_TRACKED_CHANNELS, "Channels with at least one handler");

    debug!("Metrics initialized");
}

/// Record HTTP request latency.
pub fn record_http_latency(start: Instant, endpoint: &str) {
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    histogram!(METRIC_HTTP_REQUEST_LATENCY, "endpoint" => endpoint.to_string()).record(latency_ms);
}

/// Record one crossed-book resolution and the levels it removed.
pub fn record_crossed_resolution(levels_removed: usize) {
    counter!(METRIC_CROSSED_RESOLUTIONS).increment(1);
    counter!(METRIC_CROSSED_LEVELS_REMOVED).increment(levels_removed as u64);
}

/// Increment inbound messages counter.
pub fn inc_messages_received() {
    counter!(METRIC_MESSAGES_RECEIVED).increment(1);
}

/// Increment dropped messages counter.
pub fn inc_messages_dropped(reason: &'static str) {
    counter!(METRIC_MESSAGES_DROPPED, "reason" => reason).increment(1);
}

/// Increment applied book messages counter.
pub fn inc_book_updates() {
    counter!(METRIC_BOOK_UPDATES).increment(1);
}

/// Increment rejected book messages counter.
pub fn inc_book_errors() {
    counter!(METRIC_BOOK_ERRORS).increment(1);
}

/// Add levels dropped by the depth cap.
pub fn inc_levels_trimmed(levels: usize) {
    counter!(METRIC_LEVELS_TRIMMED).increment(levels as u64);
}

/// Increment channel resyncs counter.
pub fn inc_resyncs() {
    counter!(METRIC_RESYNCS).increment(1);
}

/// Set the tracked channels gauge.
pub fn set_tracked_channels(channels: usize) {
    gauge!(METRIC_TRACKED_CHANNELS).set(channels as f64);
}

/// Increment aggregated ticks counter.
pub fn inc_ticks_aggregated() {
    counter!(METRIC_TICKS_AGGREGATED).increment(1);
}

/// Increment rejected ticks counter.
pub fn inc_ticks_rejected() {
    counter!(METRIC_TICKS_REJECTED).increment(1);
}

/// Increment WebSocket reconnects counter.
pub fn inc_ws_reconnects() {
    counter!(METRIC_WS_RECONNECTS).increment(1);
}

/// RAII guard for timing operations.
/// Automatically records latency when dropped.
pub struct LatencyTimer {
    start: Instant,
    metric_name: &'static str,
}

impl LatencyTimer {
    /// Create a new latency timer for the given metric.
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }

    /// Get elapsed time in milliseconds (without recording).
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(self.metric_name).record(self.elapsed_ms());
    }
}

/// Create a latency timer for message dispatch.
pub fn timer_dispatch() -> LatencyTimer {
    LatencyTimer::new(METRIC_DISPATCH_LATENCY)
}
