//! Cumulative depth and price grouping over a book view.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::types::{BookView, PriceLevel, Side};
use crate::error::BookError;

/// One level with running totals from the top of its side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Level price (the bucket price when grouped).
    pub price: Decimal,
    /// Size at this level.
    pub size: Decimal,
    /// `price * size`, summed over merged levels when grouped.
    pub size_cost: Decimal,
    /// Running size from the best level down to this one.
    pub depth: Decimal,
    /// Running `size_cost` from the best level down to this one.
    pub depth_cost: Decimal,
}

/// Both sides of a view with cumulative depth, best level first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLadder {
    /// Bid levels, price descending.
    pub bids: Vec<DepthLevel>,
    /// Ask levels, price ascending.
    pub asks: Vec<DepthLevel>,
}

/// Running size and cost over levels ordered best first.
pub fn cumulative_depth(levels: &[PriceLevel]) -> Vec<DepthLevel> {
    let mut depth = Decimal::ZERO;
    let mut depth_cost = Decimal::ZERO;

    levels
        .iter()
        .map(|level| {
            let size_cost = level.price * level.size;
            depth += level.size;
            depth_cost += size_cost;
            DepthLevel {
                price: level.price,
                size: level.size,
                size_cost,
                depth,
                depth_cost,
            }
        })
        .collect()
}

/// Round `price` onto a multiple of `tick_size`.
///
/// Bids round down and asks round up, so the two sides never share a bucket
/// in an uncrossed book.
pub fn bucket_price(price: Decimal, tick_size: Decimal, side: Side) -> Result<Decimal, BookError> {
    let invalid = || BookError::InvalidTickSize(tick_size);
    if tick_size <= Decimal::ZERO {
        return Err(invalid());
    }

    let ticks = price.checked_div(tick_size).ok_or_else(invalid)?;
    let whole = match side {
        Side::Bid => ticks.floor(),
        Side::Ask => ticks.ceil(),
    };
    whole
        .checked_mul(tick_size)
        .map(|p| p.normalize())
        .ok_or_else(invalid)
}

/// Merge a cumulative side into `tick_size` buckets.
///
/// Sizes and costs add up; a bucket's depth is the depth of the last level
/// merged into it. Input order is preserved.
pub fn group_levels(levels: &[DepthLevel], tick_size: Decimal, side: Side) -> Result<Vec<DepthLevel>, BookError> {
    let mut grouped: Vec<DepthLevel> = Vec::new();

    for level in levels {
        let price = bucket_price(level.price, tick_size, side)?;
        match grouped.last_mut() {
            Some(bucket) if bucket.price == price => {
                bucket.size += level.size;
                bucket.size_cost += level.size_cost;
                bucket.depth = level.depth;
                bucket.depth_cost = level.depth_cost;
            }
            _ => grouped.push(DepthLevel { price, ..*level }),
        }
    }

    Ok(grouped)
}

impl BookView {
    /// Spread as a percentage of the mid price.
    pub fn spread_percent(&self) -> Option<Decimal> {
        let spread = self.spread()?;
        let mid = self.mid_price()?;
        spread.checked_div(mid).map(|ratio| ratio * Decimal::ONE_HUNDRED)
    }

    /// Both sides with cumulative depth.
    pub fn depth_ladder(&self) -> DepthLadder {
        DepthLadder {
            bids: cumulative_depth(&self.bids),
            asks: cumulative_depth(&self.asks),
        }
    }

    /// Depth ladder with levels merged into `tick_size` buckets.
    pub fn grouped_ladder(&self, tick_size: Decimal) -> Result<DepthLadder, BookError> {
        let ladder = self.depth_ladder();
        Ok(DepthLadder {
            bids: group_levels(&ladder.bids, tick_size, Side::Bid)?,
            asks: group_levels(&ladder.asks, tick_size, Side::Ask)?,
        })
    }
}
