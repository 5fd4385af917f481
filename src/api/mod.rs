//! HTTP API module for health, metrics, and market data endpoints.

pub mod handlers;
pub mod routes;

pub use handlers::{AppState, FeedStats};
pub use routes::create_router;
