//! Multi-resolution candle aggregation.
//!
//! This module handles:
//! - Tick and candle types keyed by market, interval and bucket
//! - Bucketing of tick timestamps into interval-aligned open times
//! - Folding ticks into OHLC candles independent of arrival order

pub mod aggregator;
pub mod types;

pub use aggregator::{open_time, CandleAggregator, DAY_SECONDS};
pub use types::{Candle, CandleKey, PriceTick};
