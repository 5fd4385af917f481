//! Streaming transport.
//!
//! The feed owns the socket: it forwards inbound text frames in arrival
//! order and writes subscription control messages back out.

pub mod websocket;

pub use websocket::{FeedEvent, MarketFeed, ReconnectConfig};
