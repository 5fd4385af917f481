//! Snapshot-plus-diff order book reconstruction.
//!
//! A synchronizer starts `Uninitialized`, accepts exactly one snapshot, then
//! applies incremental level updates. After every message it resolves a
//! crossed top of book and trims each side to the retained depth cap.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use super::types::{BookView, LevelUpdate, PriceLevel, ResolutionReport, Side, SyncState};
use crate::error::BookError;
use crate::metrics;

/// Default number of levels retained per side.
pub const DEFAULT_DEPTH_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LevelState {
    size: Decimal,
    last_update_seq: u64,
}

fn to_level((&price, state): (&Decimal, &LevelState)) -> PriceLevel {
    PriceLevel::new(price, state.size, state.last_update_seq)
}

/// One side of the book, unique by price.
///
/// Prices are kept in a `BTreeMap` (ascending); the bid side reads it from
/// the back so that both sides iterate best-first.
#[derive(Debug, Clone)]
pub struct BookSide {
    side: Side,
    levels: BTreeMap<Decimal, LevelState>,
}

impl BookSide {
    fn new(side: Side) -> Self {
        Self {
            side,
            levels: BTreeMap::new(),
        }
    }

    /// Which side this is.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Number of levels.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Whether the side has no levels.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Best level: highest bid or lowest ask.
    pub fn top(&self) -> Option<PriceLevel> {
        let entry = match self.side {
            Side::Bid => self.levels.iter().next_back(),
            Side::Ask => self.levels.iter().next(),
        };
        entry.map(to_level)
    }

    /// Levels in best-first order.
    pub fn iter(&self) -> Box<dyn Iterator<Item = PriceLevel> + '_> {
        match self.side {
            Side::Bid => Box::new(self.levels.iter().rev().map(to_level)),
            Side::Ask => Box::new(self.levels.iter().map(to_level)),
        }
    }

    /// Size resting at `price`, if any.
    pub fn size_at(&self, price: Decimal) -> Option<Decimal> {
        self.levels.get(&price).map(|s| s.size)
    }

    /// Sum of sizes across the side.
    pub fn total_size(&self) -> Decimal {
        self.levels.values().map(|s| s.size).sum()
    }

    fn upsert(&mut self, price: Decimal, size: Decimal, seq: u64) {
        if size.is_zero() {
            self.levels.remove(&price);
        } else {
            self.levels.insert(
                price,
                LevelState {
                    size,
                    last_update_seq: seq,
                },
            );
        }
    }

    fn remove_top(&mut self) {
        let best = match self.side {
            Side::Bid => self.levels.keys().next_back().copied(),
            Side::Ask => self.levels.keys().next().copied(),
        };
        if let Some(price) = best {
            self.levels.remove(&price);
        }
    }

    fn set_top_size(&mut self, size: Decimal) {
        let best = match self.side {
            Side::Bid => self.levels.values_mut().next_back(),
            Side::Ask => self.levels.values_mut().next(),
        };
        if let Some(state) = best {
            state.size = size;
        }
    }

    /// Drop the worst levels until at most `cap` remain. Returns levels dropped.
    fn truncate(&mut self, cap: usize) -> usize {
        let mut dropped = 0;
        while self.levels.len() > cap {
            match self.side {
                Side::Bid => self.levels.pop_first(),
                Side::Ask => self.levels.pop_last(),
            };
            dropped += 1;
        }
        dropped
    }

    fn clear(&mut self) {
        self.levels.clear();
    }
}

/// Rebuilds one channel's book from a snapshot and a stream of diffs.
#[derive(Debug, Clone)]
pub struct OrderBookSynchronizer {
    bids: BookSide,
    asks: BookSide,
    state: SyncState,
    last_seq: u64,
    depth_cap: usize,
}

impl Default for OrderBookSynchronizer {
    fn default() -> Self {
        Self::new(DEFAULT_DEPTH_CAP)
    }
}

impl OrderBookSynchronizer {
    /// Create an uninitialized book retaining at most `depth_cap` levels per side.
    pub fn new(depth_cap: usize) -> Self {
        Self {
            bids: BookSide::new(Side::Bid),
            asks: BookSide::new(Side::Ask),
            state: SyncState::Uninitialized,
            last_seq: 0,
            depth_cap,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Whether a snapshot has been applied.
    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    /// Highest sequence applied.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Retained depth per side.
    pub fn depth_cap(&self) -> usize {
        self.depth_cap
    }

    /// Bid side.
    pub fn bids(&self) -> &BookSide {
        &self.bids
    }

    /// Ask side.
    pub fn asks(&self) -> &BookSide {
        &self.asks
    }

    /// Get the best bid level.
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.top()
    }

    /// Get the best ask level.
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.top()
    }

    /// Check if best_bid >= best_ask.
    pub fn is_crossed(&self) -> bool {
        match (self.bids.top(), self.asks.top()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    /// Discard all levels and wait for a fresh snapshot.
    pub fn reset(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.state = SyncState::Uninitialized;
        self.last_seq = 0;
    }

    /// Apply the initial snapshot.
    ///
    /// Zero-size levels are skipped and a repeated price keeps its last entry.
    /// A crossed snapshot is resolved and both sides are trimmed afterwards.
    #[instrument(skip(self, bids, asks), fields(bids = bids.len(), asks = asks.len()))]
    pub fn apply_snapshot(
        &mut self,
        bids: &[LevelUpdate],
        asks: &[LevelUpdate],
        seq: u64,
    ) -> Result<ResolutionReport, BookError> {
        if self.state != SyncState::Uninitialized {
            return Err(BookError::AlreadyInitialized);
        }
        for level in bids.iter().chain(asks) {
            validate_level(level)?;
        }

        for level in bids {
            self.bids.upsert(level.price, level.size, seq);
        }
        for level in asks {
            self.asks.upsert(level.price, level.size, seq);
        }

        self.state = SyncState::Synced;
        self.last_seq = self.last_seq.max(seq);
        debug!(seq, bids = self.bids.len(), asks = self.asks.len(), "Snapshot applied");

        self.settle()
    }

    /// Apply one level update to one side.
    ///
    /// Does not resolve or trim; see [`Self::apply_batch`] for the
    /// message-level entry point.
    pub fn apply_diff(
        &mut self,
        side: Side,
        price: Decimal,
        size: Decimal,
        seq: u64,
    ) -> Result<(), BookError> {
        if self.state != SyncState::Synced {
            return Err(BookError::NotSynced);
        }
        validate_level(&LevelUpdate::new(price, size))?;

        let book = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        book.upsert(price, size, seq);
        self.last_seq = self.last_seq.max(seq);
        Ok(())
    }

    /// Apply every diff of one message in order, then resolve and trim once.
    #[instrument(skip(self, updates), fields(updates = updates.len()))]
    pub fn apply_batch(
        &mut self,
        updates: &[(Side, LevelUpdate)],
        seq: u64,
    ) -> Result<ResolutionReport, BookError> {
        if self.state != SyncState::Synced {
            return Err(BookError::NotSynced);
        }
        for (_, level) in updates {
            validate_level(level)?;
        }
        for (side, level) in updates {
            self.apply_diff(*side, level.price, level.size, seq)?;
        }
        self.settle()
    }

    /// Uncross the top of book.
    ///
    /// While best bid >= best ask: the level with the older sequence is
    /// dropped; on equal sequences the smaller size is netted off the larger
    /// one, and equal sizes drop both. Every iteration removes at least one
    /// level, so the loop is bounded by the combined level count.
    pub fn resolve_crossed_book(&mut self) -> Result<ResolutionReport, BookError> {
        let mut report = ResolutionReport::default();
        let limit = self.bids.len() + self.asks.len() + 1;

        while let (Some(bid), Some(ask)) = (self.bids.top(), self.asks.top()) {
            if bid.price < ask.price {
                break;
            }
            if report.iterations >= limit {
                warn!(
                    iterations = report.iterations,
                    best_bid = %bid.price,
                    best_ask = %ask.price,
                    "Crossed book resolution did not converge"
                );
                return Err(BookError::CrossedBookResolutionStalled {
                    iterations: report.iterations,
                    best_bid: bid.price,
                    best_ask: ask.price,
                });
            }
            report.iterations += 1;

            if bid.last_update_seq < ask.last_update_seq {
                self.bids.remove_top();
                report.bids_removed += 1;
            } else if bid.last_update_seq > ask.last_update_seq {
                self.asks.remove_top();
                report.asks_removed += 1;
            } else if bid.size > ask.size {
                self.bids.set_top_size(bid.size - ask.size);
                self.asks.remove_top();
                report.asks_removed += 1;
            } else if bid.size < ask.size {
                self.asks.set_top_size(ask.size - bid.size);
                self.bids.remove_top();
                report.bids_removed += 1;
            } else {
                self.bids.remove_top();
                self.asks.remove_top();
                report.bids_removed += 1;
                report.asks_removed += 1;
            }
        }

        if report.was_crossed() {
            debug!(
                iterations = report.iterations,
                bids_removed = report.bids_removed,
                asks_removed = report.asks_removed,
                "Resolved crossed book"
            );
            metrics::record_crossed_resolution(report.bids_removed + report.asks_removed);
        }
        Ok(report)
    }

    /// Drop levels beyond the depth cap on both sides. Returns levels dropped.
    pub fn trim_to_depth_cap(&mut self) -> usize {
        let dropped = self.bids.truncate(self.depth_cap) + self.asks.truncate(self.depth_cap);
        if dropped > 0 {
            metrics::inc_levels_trimmed(dropped);
        }
        dropped
    }

    /// Up to `depth` levels per side, best first.
    pub fn top_of_book(&self, depth: usize) -> BookView {
        BookView {
            bids: self.bids.iter().take(depth).collect(),
            asks: self.asks.iter().take(depth).collect(),
            last_seq: self.last_seq,
        }
    }

    fn settle(&mut self) -> Result<ResolutionReport, BookError> {
        let report = self.resolve_crossed_book()?;
        self.trim_to_depth_cap();
        Ok(report)
    }
}

fn validate_level(level: &LevelUpdate) -> Result<(), BookError> {
    if level.price < Decimal::ZERO || level.size < Decimal::ZERO {
        return Err(BookError::InvalidLevel {
            price: level.price,
            size: level.size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn lvl(price: Decimal, size: Decimal) -> LevelUpdate {
        LevelUpdate::new(price, size)
    }

    fn synced(bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)], seq: u64) -> OrderBookSynchronizer {
        let mut book = OrderBookSynchronizer::default();
        let bids: Vec<_> = bids.iter().map(|&(p, s)| lvl(p, s)).collect();
        let asks: Vec<_> = asks.iter().map(|&(p, s)| lvl(p, s)).collect();
        book.apply_snapshot(&bids, &asks, seq).unwrap();
        book
    }

    fn prices(side: &BookSide) -> Vec<Decimal> {
        side.iter().map(|l| l.price).collect()
    }

    #[test]
    fn snapshot_sorts_sides_and_syncs() {
        let book = synced(
            &[(dec!(99), dec!(1)), (dec!(100), dec!(5)), (dec!(98), dec!(0))],
            &[(dec!(103), dec!(1)), (dec!(101), dec!(5))],
            1,
        );

        assert_eq!(book.state(), SyncState::Synced);
        assert_eq!(prices(book.bids()), vec![dec!(100), dec!(99)]);
        assert_eq!(prices(book.asks()), vec![dec!(101), dec!(103)]);
        assert!(book.bids().iter().all(|l| l.last_update_seq == 1));
        assert!(!book.is_crossed());
    }

    #[test]
    fn second_snapshot_requires_reset() {
        let mut book = synced(&[(dec!(100), dec!(5))], &[(dec!(101), dec!(5))], 1);
        assert_eq!(book.apply_snapshot(&[], &[], 2), Err(BookError::AlreadyInitialized));

        book.reset();
        assert_eq!(book.state(), SyncState::Uninitialized);
        assert!(book.bids().is_empty());
        assert!(book.apply_snapshot(&[lvl(dec!(90), dec!(1))], &[], 3).is_ok());
    }

    #[test]
    fn diff_before_snapshot_is_rejected() {
        let mut book = OrderBookSynchronizer::default();
        assert_eq!(
            book.apply_diff(Side::Bid, dec!(100), dec!(1), 1),
            Err(BookError::NotSynced)
        );
        assert_eq!(
            book.apply_batch(&[(Side::Ask, lvl(dec!(100), dec!(1)))], 1),
            Err(BookError::NotSynced)
        );
    }

    #[test]
    fn diff_overwrites_removes_and_reinserts() {
        let mut book = synced(
            &[(dec!(100), dec!(5)), (dec!(99), dec!(2))],
            &[(dec!(101), dec!(5))],
            1,
        );

        book.apply_diff(Side::Bid, dec!(99), dec!(7), 2).unwrap();
        assert_eq!(book.bids().size_at(dec!(99)), Some(dec!(7)));

        book.apply_diff(Side::Bid, dec!(99), dec!(0), 3).unwrap();
        assert_eq!(book.bids().size_at(dec!(99)), None);

        // Removing an absent level is a no-op.
        book.apply_diff(Side::Bid, dec!(42), dec!(0), 4).unwrap();

        book.apply_diff(Side::Bid, dec!(99), dec!(3), 5).unwrap();
        book.apply_diff(Side::Bid, dec!(99.5), dec!(1), 5).unwrap();
        assert_eq!(prices(book.bids()), vec![dec!(100), dec!(99.5), dec!(99)]);
        assert_eq!(book.last_seq(), 5);
    }

    #[test]
    fn negative_size_is_rejected() {
        let mut book = synced(&[(dec!(100), dec!(5))], &[], 1);
        assert!(matches!(
            book.apply_diff(Side::Bid, dec!(100), dec!(-1), 2),
            Err(BookError::InvalidLevel { .. })
        ));
        assert_eq!(book.bids().size_at(dec!(100)), Some(dec!(5)));
    }

    #[test]
    fn newer_bid_removes_stale_ask() {
        let mut book = synced(&[(dec!(100), dec!(5))], &[(dec!(101), dec!(5))], 1);

        let report = book.apply_batch(&[(Side::Bid, lvl(dec!(101), dec!(3)))], 2).unwrap();

        assert_eq!(report.asks_removed, 1);
        assert_eq!(report.bids_removed, 0);
        assert_eq!(book.best_bid().unwrap().price, dec!(101));
        assert_eq!(book.best_bid().unwrap().size, dec!(3));
        assert!(book.asks().is_empty());
        assert!(!book.is_crossed());
    }

    #[test]
    fn newer_ask_removes_stale_bid() {
        let mut book = synced(
            &[(dec!(100), dec!(5)), (dec!(98), dec!(1))],
            &[(dec!(102), dec!(5))],
            1,
        );

        book.apply_batch(&[(Side::Ask, lvl(dec!(99), dec!(2)))], 2).unwrap();

        assert_eq!(prices(book.bids()), vec![dec!(98)]);
        assert_eq!(prices(book.asks()), vec![dec!(99), dec!(102)]);
    }

    #[test]
    fn same_message_nets_sizes() {
        let mut book = synced(&[(dec!(100), dec!(5))], &[(dec!(102), dec!(5))], 1);

        book.apply_batch(
            &[
                (Side::Bid, lvl(dec!(101), dec!(4))),
                (Side::Ask, lvl(dec!(101), dec!(1))),
            ],
            2,
        )
        .unwrap();

        assert_eq!(book.best_bid().unwrap().price, dec!(101));
        assert_eq!(book.best_bid().unwrap().size, dec!(3));
        assert_eq!(book.best_ask().unwrap().price, dec!(102));

        book.apply_batch(
            &[
                (Side::Bid, lvl(dec!(101.5), dec!(1))),
                (Side::Ask, lvl(dec!(101.5), dec!(6))),
            ],
            3,
        )
        .unwrap();

        assert_eq!(book.best_bid().unwrap().price, dec!(101));
        assert_eq!(book.best_ask().unwrap().price, dec!(101.5));
        assert_eq!(book.best_ask().unwrap().size, dec!(5));
    }

    #[test]
    fn same_message_equal_sizes_drop_both() {
        let mut book = synced(&[(dec!(100), dec!(5))], &[(dec!(102), dec!(5))], 1);

        book.apply_batch(
            &[
                (Side::Bid, lvl(dec!(101), dec!(2))),
                (Side::Ask, lvl(dec!(101), dec!(2))),
            ],
            2,
        )
        .unwrap();

        assert_eq!(book.best_bid().unwrap().price, dec!(100));
        assert_eq!(book.best_ask().unwrap().price, dec!(102));
    }

    #[test]
    fn alternating_staleness_terminates() {
        let mut book = synced(&[], &[], 0);
        book.apply_diff(Side::Bid, dec!(110), dec!(1), 1).unwrap();
        book.apply_diff(Side::Ask, dec!(100), dec!(1), 2).unwrap();
        book.apply_diff(Side::Bid, dec!(109), dec!(1), 3).unwrap();
        book.apply_diff(Side::Ask, dec!(101), dec!(1), 4).unwrap();
        book.apply_diff(Side::Bid, dec!(108), dec!(1), 5).unwrap();
        book.apply_diff(Side::Ask, dec!(102), dec!(1), 6).unwrap();

        let report = book.resolve_crossed_book().unwrap();

        assert_eq!(report.iterations, 5);
        assert!(!book.is_crossed());
        assert_eq!(prices(book.asks()), vec![dec!(102)]);
        assert!(book.bids().is_empty());
    }

    #[test]
    fn crossed_snapshot_is_resolved() {
        let book = synced(&[(dec!(101), dec!(2))], &[(dec!(100), dec!(5))], 1);

        assert!(book.bids().is_empty());
        assert_eq!(book.best_ask().unwrap().size, dec!(3));
    }

    #[test]
    fn sides_are_trimmed_to_depth_cap() {
        let mut book = OrderBookSynchronizer::new(3);
        let bids: Vec<_> = (1..=5).map(|p| lvl(Decimal::from(p), dec!(1))).collect();
        let asks: Vec<_> = (10..=15).map(|p| lvl(Decimal::from(p), dec!(1))).collect();
        book.apply_snapshot(&bids, &asks, 1).unwrap();

        assert_eq!(prices(book.bids()), vec![dec!(5), dec!(4), dec!(3)]);
        assert_eq!(prices(book.asks()), vec![dec!(10), dec!(11), dec!(12)]);

        book.apply_batch(&[(Side::Bid, lvl(dec!(6), dec!(1)))], 2).unwrap();
        assert_eq!(book.bids().len(), 3);
        assert_eq!(prices(book.bids()), vec![dec!(6), dec!(5), dec!(4)]);
    }

    #[test]
    fn top_of_book_limits_depth() {
        let book = synced(
            &[(dec!(100), dec!(1)), (dec!(99), dec!(1)), (dec!(98), dec!(1))],
            &[(dec!(101), dec!(1)), (dec!(102), dec!(1))],
            7,
        );

        let view = book.top_of_book(2);
        assert_eq!(view.bids.len(), 2);
        assert_eq!(view.asks.len(), 2);
        assert_eq!(view.best_bid(), Some(dec!(100)));
        assert_eq!(view.last_seq, 7);
        assert_eq!(book.bids().len(), 3);
    }
}
