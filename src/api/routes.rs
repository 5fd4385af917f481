//! HTTP API route definitions.

use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers::{book, books, candles, daily_bars, health, metrics, ready, status, AppState};

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health))
        .route("/ready", get(ready))
        // Status endpoint
        .route("/api/v1/status", get(status))
        // Market data
        .route("/api/v1/books", get(books))
        .route("/api/v1/books/:channel", get(book))
        .route("/api/v1/bars", get(daily_bars))
        .route("/api/v1/candles", get(candles))
        .route("/metrics", get(metrics))
        .route_layer(middleware::from_fn(track_latency))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn track_latency(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_default();

    let response = next.run(request).await;
    crate::metrics::record_http_latency(start, &endpoint);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    use crate::candles::Candle;
    use crate::channel::ChannelKey;
    use crate::orderbook::{BookView, PriceLevel};

    async fn get(state: AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = create_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn state_with_book() -> AppState {
        let state = AppState::new();
        state.books.insert(
            ChannelKey::new("Coinbase", "BTC", "USD"),
            BookView {
                bids: vec![PriceLevel::new(dec!(100), dec!(5), 1)],
                asks: vec![PriceLevel::new(dec!(101), dec!(2), 1)],
                last_seq: 1,
            },
        );
        state
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let (status, _) = get(AppState::new(), "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_endpoint_returns_503_when_not_ready() {
        let (status, _) = get(AppState::new(), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ready_endpoint_returns_200_when_ready() {
        let state = AppState::new();
        state.set_ready(true);
        let (status, body) = get(state, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn book_endpoint_returns_known_channel() {
        let (status, body) = get(state_with_book(), "/api/v1/books/0~Coinbase~BTC~USD").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["channel"], "0~Coinbase~BTC~USD");
        assert_eq!(body["spread"], "1");
        assert_eq!(body["bids"][0]["price"], "100");
    }

    #[tokio::test]
    async fn book_endpoint_includes_depth_ladder() {
        let state = state_with_book();
        state.books.insert(
            ChannelKey::new("Coinbase", "ETH", "USD"),
            BookView {
                bids: vec![
                    PriceLevel::new(dec!(3150.75), dec!(2), 4),
                    PriceLevel::new(dec!(3150.25), dec!(1), 3),
                ],
                asks: vec![PriceLevel::new(dec!(3151.25), dec!(4), 4)],
                last_seq: 4,
            },
        );

        let (status, body) = get(state.clone(), "/api/v1/books/0~Coinbase~ETH~USD").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["spread_percent"].is_string());
        assert_eq!(body["ladder"]["bids"][1]["depth"], "3");
        assert_eq!(body["ladder"]["bids"][1]["depth_cost"], "9451.75");

        let (status, body) = get(state.clone(), "/api/v1/books/0~Coinbase~ETH~USD?group=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ladder"]["bids"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["ladder"]["bids"][0]["price"], "3150");
        assert_eq!(body["ladder"]["asks"][0]["price"], "3152");

        let (status, _) = get(state, "/api/v1/books/0~Coinbase~ETH~USD?group=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn book_endpoint_returns_404_for_unknown_channel() {
        let (status, _) = get(state_with_book(), "/api/v1/books/0~Kraken~ETH~EUR").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get(state_with_book(), "/api/v1/books/garbage").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn books_endpoint_lists_all() {
        let (status, body) = get(state_with_book(), "/api/v1/books").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn candles_endpoint_filters_by_market_and_interval() {
        let state = AppState::new();
        let candle = Candle {
            market_id: "BTC-USD".to_string(),
            interval_seconds: 60,
            open_time_seconds: 960,
            open: dec!(100),
            high: dec!(100),
            low: dec!(100),
            close: dec!(100),
        };
        state.candles.insert(candle.key(), candle);

        let (status, body) = get(state.clone(), "/api/v1/candles?market=BTC-USD&interval=60").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["open_time_seconds"], 960);

        let (_, body) = get(state.clone(), "/api/v1/candles?market=BTC-USD&interval=300").await;
        assert_eq!(body, serde_json::json!([]));

        let (status, _) = get(state, "/api/v1/candles?market=BTC-USD&interval=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_endpoint_without_recorder_is_404() {
        let (status, _) = get(AppState::new(), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
