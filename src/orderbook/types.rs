//! Order book types and data structures.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Resting buy interest, best = highest price.
    #[strum(to_string = "bid", serialize = "bids", serialize = "buy", serialize = "BUY")]
    Bid,
    /// Resting sell interest, best = lowest price.
    #[strum(to_string = "ask", serialize = "asks", serialize = "sell", serialize = "SELL")]
    Ask,
}

impl Side {
    /// The opposite side.
    pub fn opposite(self) -> Self {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }
}

/// Single price level in an order book.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriceLevel {
    /// Price at this level.
    pub price: Decimal,
    /// Total size available at this price.
    pub size: Decimal,
    /// Sequence of the message that last touched this level.
    pub last_update_seq: u64,
}

impl PriceLevel {
    /// Create a new price level.
    pub fn new(price: Decimal, size: Decimal, last_update_seq: u64) -> Self {
        Self {
            price,
            size,
            last_update_seq,
        }
    }
}

/// A price/size pair as delivered by the feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LevelUpdate {
    /// Level price.
    pub price: Decimal,
    /// New size at the price; zero removes the level.
    pub size: Decimal,
}

impl LevelUpdate {
    /// Create a new level update.
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Synchronizer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum SyncState {
    /// Waiting for a snapshot.
    Uninitialized,
    /// Snapshot applied, diffs accepted.
    Synced,
}

/// Outcome of one crossed-book resolution pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    /// Loop iterations executed.
    pub iterations: usize,
    /// Bid levels removed.
    pub bids_removed: usize,
    /// Ask levels removed.
    pub asks_removed: usize,
}

impl ResolutionReport {
    /// Whether the book was crossed at all.
    pub fn was_crossed(&self) -> bool {
        self.iterations > 0
    }
}

/// Read-only, depth-limited copy of a book.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookView {
    /// Bid levels sorted by price descending.
    pub bids: Vec<PriceLevel>,
    /// Ask levels sorted by price ascending.
    pub asks: Vec<PriceLevel>,
    /// Highest sequence applied to the book.
    pub last_seq: u64,
}

impl BookView {
    /// Get the best bid price.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Get the best ask price.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Get the spread between best bid and ask.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Calculate the mid price from best bid and ask.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Check if the book is crossed (best_bid >= best_ask).
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Get total size on the bid side of the view.
    pub fn total_bid_size(&self) -> Decimal {
        self.bids.iter().map(|l| l.size).sum()
    }

    /// Get total size on the ask side of the view.
    pub fn total_ask_size(&self) -> Decimal {
        self.asks.iter().map(|l| l.size).sum()
    }
}
