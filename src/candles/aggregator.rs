//! Tick-to-candle aggregation across several intervals.

use std::collections::BTreeMap;

use tracing::{instrument, trace};

use super::types::{Candle, CandleKey, PriceTick};
use crate::error::CandleError;
use crate::metrics;

/// Seconds in one day, the resolution of per-channel daily bars.
pub const DAY_SECONDS: i64 = 86_400;

/// Open time of the bucket containing `timestamp_seconds`.
///
/// `floor(ts / interval) * interval`, with a true floor for negative inputs.
/// `interval_seconds` must be positive.
pub fn open_time(timestamp_seconds: i64, interval_seconds: i64) -> i64 {
    timestamp_seconds.div_euclid(interval_seconds) * interval_seconds
}

/// Folds price ticks into OHLC candles keyed by market, interval and bucket.
///
/// Candles live in a `BTreeMap` so iteration is already in
/// `(market_id, interval_seconds, open_time_seconds)` order.
#[derive(Debug, Clone, Default)]
pub struct CandleAggregator {
    candles: BTreeMap<CandleKey, Candle>,
}

impl CandleAggregator {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one tick to every interval, in the order given.
    ///
    /// The tick and all intervals are validated before anything is written.
    /// `open` is fixed by the first tick processed for a bucket and `close`
    /// by the last one, regardless of tick timestamps.
    #[instrument(skip(self, tick), fields(market = %tick.market_id, ts = tick.timestamp_seconds))]
    pub fn on_tick(&mut self, tick: &PriceTick, intervals: &[i64]) -> Result<(), CandleError> {
        if let Err(e) = tick.validate() {
            metrics::inc_ticks_rejected();
            return Err(e);
        }
        if let Some(&bad) = intervals.iter().find(|&&i| i <= 0) {
            metrics::inc_ticks_rejected();
            return Err(CandleError::InvalidInterval(bad));
        }

        for &interval in intervals {
            let bucket = open_time(tick.timestamp_seconds, interval);
            let key = CandleKey::new(tick.market_id.clone(), interval, bucket);

            match self.candles.get_mut(&key) {
                Some(candle) => candle.update(tick.price),
                None => {
                    trace!(interval, bucket, "Opening candle");
                    self.candles
                        .insert(key, Candle::open_with(tick, interval, bucket));
                }
            }
        }

        metrics::inc_ticks_aggregated();
        Ok(())
    }

    /// Every candle, sorted by market, interval, then open time.
    pub fn all_candles(&self) -> Vec<Candle> {
        self.candles.values().cloned().collect()
    }

    /// Look up one candle.
    pub fn candle(&self, key: &CandleKey) -> Option<&Candle> {
        self.candles.get(key)
    }

    /// Candles of one market and interval in open-time order.
    pub fn series(&self, market_id: &str, interval_seconds: i64) -> Vec<Candle> {
        let start = CandleKey::new(market_id, interval_seconds, i64::MIN);
        let end = CandleKey::new(market_id, interval_seconds, i64::MAX);
        self.candles
            .range(start..=end)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Most recent bucket of one market and interval.
    pub fn latest(&self, market_id: &str, interval_seconds: i64) -> Option<&Candle> {
        let start = CandleKey::new(market_id, interval_seconds, i64::MIN);
        let end = CandleKey::new(market_id, interval_seconds, i64::MAX);
        self.candles.range(start..=end).next_back().map(|(_, c)| c)
    }

    /// Distinct market ids with at least one candle, sorted.
    pub fn markets(&self) -> Vec<String> {
        let mut markets: Vec<String> = Vec::new();
        for key in self.candles.keys() {
            if markets.last() != Some(&key.market_id) {
                markets.push(key.market_id.clone());
            }
        }
        markets
    }

    /// Number of candles held.
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    /// Whether no candle has been created yet.
    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}
