//! Order book module for reconstructing per-channel books.
//!
//! This module handles:
//! - Order book types and read-only views
//! - Snapshot + diff synchronization with crossed-book resolution
//! - Depth capping of retained levels
//! - Cumulative depth and price grouping of views

pub mod depth;
pub mod synchronizer;
pub mod types;

pub use depth::{DepthLadder, DepthLevel};
pub use synchronizer::{BookSide, OrderBookSynchronizer, DEFAULT_DEPTH_CAP};
pub use types::{BookView, LevelUpdate, PriceLevel, ResolutionReport, Side, SyncState};
