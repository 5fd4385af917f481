//! Streaming market data core.
//!
//! Rebuilds per-channel order books from a snapshot plus incremental diffs,
//! and folds trade prints into OHLC candles at several resolutions at once.
//!
//! # Pipeline
//!
//! ```text
//! transport frame ──► ChannelSubscriptionRegistry ──► OrderBookSynchronizer (per channel)
//!                              │                              │
//!                              └─ trade tick ──► CandleAggregator
//!                                                             │
//!                         handlers / AppState ◄── book views, daily bars, candles
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from environment
//! - [`error`]: Unified error types
//! - [`candles`]: Multi-interval candle aggregation
//! - [`orderbook`]: Snapshot + diff book synchronization
//! - [`channel`]: Channel keys, wire messages and the subscription registry
//! - [`feed`]: WebSocket transport with reconnection
//! - [`service`]: Single-writer event loop tying it together
//! - [`api`]: HTTP API for health, books, candles and metrics
//! - [`utils`]: Utility functions

pub mod api;
pub mod candles;
pub mod channel;
pub mod config;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod orderbook;
pub mod service;
pub mod utils;

pub use config::Config;
pub use error::{FeedError, Result};
