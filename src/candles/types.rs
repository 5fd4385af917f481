//! Candle types and data structures.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::CandleError;

/// A single price observation for one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    /// Market identifier, e.g. `BTC-USD`.
    pub market_id: String,
    /// Observed price.
    pub price: Decimal,
    /// Event time in Unix seconds.
    pub timestamp_seconds: i64,
}

impl PriceTick {
    /// Create a new tick.
    pub fn new(market_id: impl Into<String>, price: Decimal, timestamp_seconds: i64) -> Self {
        Self {
            market_id: market_id.into(),
            price,
            timestamp_seconds,
        }
    }

    /// Reject negative prices and pre-epoch timestamps.
    pub fn validate(&self) -> Result<(), CandleError> {
        if self.price < Decimal::ZERO || self.timestamp_seconds < 0 {
            return Err(CandleError::InvalidTick {
                market_id: self.market_id.clone(),
                price: self.price,
                timestamp_seconds: self.timestamp_seconds,
            });
        }
        Ok(())
    }
}

/// Unique key of a candle.
///
/// Field order matters: the derived `Ord` sorts by market id (byte-wise),
/// then interval, then open time, which is the order `all_candles` returns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandleKey {
    /// Market identifier.
    pub market_id: String,
    /// Interval length in seconds.
    pub interval_seconds: i64,
    /// Bucket open time in Unix seconds.
    pub open_time_seconds: i64,
}

impl CandleKey {
    /// Create a new key.
    pub fn new(market_id: impl Into<String>, interval_seconds: i64, open_time_seconds: i64) -> Self {
        Self {
            market_id: market_id.into(),
            interval_seconds,
            open_time_seconds,
        }
    }
}

/// OHLC summary of one market over one interval-aligned bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Market identifier.
    pub market_id: String,
    /// Interval length in seconds.
    pub interval_seconds: i64,
    /// Bucket open time in Unix seconds.
    pub open_time_seconds: i64,
    /// First processed price in the bucket.
    pub open: Decimal,
    /// Highest price in the bucket.
    pub high: Decimal,
    /// Lowest price in the bucket.
    pub low: Decimal,
    /// Last processed price in the bucket.
    pub close: Decimal,
}

impl Candle {
    /// Create a candle from the first tick in its bucket.
    pub(crate) fn open_with(tick: &PriceTick, interval_seconds: i64, open_time_seconds: i64) -> Self {
        Self {
            market_id: tick.market_id.clone(),
            interval_seconds,
            open_time_seconds,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
        }
    }

    /// Fold a later-processed price into the candle. `open` is left untouched.
    pub(crate) fn update(&mut self, price: Decimal) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
    }

    /// Key of this candle.
    pub fn key(&self) -> CandleKey {
        CandleKey::new(self.market_id.clone(), self.interval_seconds, self.open_time_seconds)
    }

    /// Last second covered by this candle's bucket.
    pub fn close_time_seconds(&self) -> i64 {
        self.open_time_seconds + self.interval_seconds - 1
    }

    /// Check the OHLC envelope: high and low bound open and close.
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.interval_seconds > 0
    }
}
