//! Unified error types for the market feed.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::channel::ChannelKey;

/// Unified error type for the market feed.
#[derive(Error, Debug)]
pub enum FeedError {
    /// Configuration validation error.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Order book sequencing or invariant error on a specific channel.
    #[error("order book error on {channel}: {source}")]
    Book {
        /// Channel whose book rejected the update.
        channel: ChannelKey,
        /// Underlying book error.
        #[source]
        source: BookError,
    },

    /// Candle aggregation error.
    #[error("candle error: {0}")]
    Candle(#[from] CandleError),
}

/// Order book synchronization errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookError {
    /// A diff arrived before the snapshot.
    #[error("order book is not synced: snapshot required before diffs")]
    NotSynced,

    /// A second snapshot arrived without a reset.
    #[error("order book already initialized: reset required before a new snapshot")]
    AlreadyInitialized,

    /// Crossed-book resolution did not converge.
    #[error("crossed book resolution stalled after {iterations} iterations: best_bid={best_bid} >= best_ask={best_ask}")]
    CrossedBookResolutionStalled {
        /// Iterations executed before giving up.
        iterations: usize,
        /// Best bid when the guard tripped.
        best_bid: Decimal,
        /// Best ask when the guard tripped.
        best_ask: Decimal,
    },

    /// Negative price or size in an update.
    #[error("invalid level: price={price}, size={size}")]
    InvalidLevel {
        /// Offending price.
        price: Decimal,
        /// Offending size.
        size: Decimal,
    },

    /// Grouping tick size that is zero, negative or overflows a price.
    #[error("invalid grouping tick size: {0}")]
    InvalidTickSize(Decimal),
}

/// Candle aggregation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CandleError {
    /// Tick with a negative price or timestamp.
    #[error("invalid tick for {market_id}: price={price}, timestamp={timestamp_seconds}")]
    InvalidTick {
        /// Market the tick was for.
        market_id: String,
        /// Tick price.
        price: Decimal,
        /// Tick timestamp in seconds.
        timestamp_seconds: i64,
    },

    /// Interval length that is zero or negative.
    #[error("invalid candle interval: {0}s")]
    InvalidInterval(i64),
}

/// Inbound message decoding errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Empty payload.
    #[error("empty message")]
    Empty,

    /// Positional trade message with too few fields.
    #[error("trade message has {found} fields, expected at least {expected}")]
    MissingFields {
        /// Fields present.
        found: usize,
        /// Fields required.
        expected: usize,
    },

    /// A field could not be parsed.
    #[error("invalid {field}: {value:?}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Raw value.
        value: String,
    },

    /// Malformed channel key.
    #[error("invalid channel key: {0:?}")]
    InvalidChannel(String),

    /// JSON payload did not match any known shape.
    #[error("malformed json payload: {0}")]
    Json(String),
}

/// WebSocket connection and message errors.
#[derive(Error, Debug)]
pub enum WsError {
    /// Connection failed.
    #[error("websocket connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed unexpectedly.
    #[error("websocket connection closed: code={code:?}, reason={reason}")]
    ConnectionClosed {
        /// Close code.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },

    /// Send failed.
    #[error("failed to send websocket message: {0}")]
    SendFailed(String),

    /// Tungstenite error.
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Configuration validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Feed URL is not a websocket URL.
    #[error("FEED_WS_URL must be a ws:// or wss:// url: {0}")]
    InvalidUrl(String),

    /// No channels configured.
    #[error("FEED_CHANNELS must name at least one channel")]
    NoChannels,

    /// A configured channel key is malformed.
    #[error("FEED_CHANNELS contains an invalid channel: {0}")]
    InvalidChannel(String),

    /// No candle intervals configured.
    #[error("CANDLE_INTERVALS must name at least one interval")]
    NoIntervals,

    /// A candle interval is not positive.
    #[error("CANDLE_INTERVALS must be positive, got {0}")]
    InvalidInterval(i64),

    /// Depth settings are inconsistent.
    #[error("BOOK_VIEW_DEPTH ({view_depth}) must be between 1 and BOOK_DEPTH_CAP ({depth_cap})")]
    InvalidDepth {
        /// Retained depth cap.
        depth_cap: usize,
        /// Published view depth.
        view_depth: usize,
    },
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, FeedError>;
