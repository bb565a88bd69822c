//! Threshold kinds and the direction-aware trigger predicate.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Direction;

/// Which threshold a watcher guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    TakeProfit,
    StopLoss,
}

impl WatchKind {
    pub const ALL: [WatchKind; 2] = [WatchKind::TakeProfit, WatchKind::StopLoss];

    /// Whether a tick at `selling_price` crosses `threshold`.
    ///
    /// | kind        | long                 | short                |
    /// |-------------|----------------------|----------------------|
    /// | take-profit | price >= threshold   | price <= threshold   |
    /// | stop-loss   | price <= threshold   | price >= threshold   |
    #[must_use]
    pub fn fires(self, direction: Direction, threshold: Decimal, selling_price: Decimal) -> bool {
        match (self, direction) {
            (Self::TakeProfit, Direction::Long) | (Self::StopLoss, Direction::Short) => {
                selling_price >= threshold
            }
            (Self::TakeProfit, Direction::Short) | (Self::StopLoss, Direction::Long) => {
                selling_price <= threshold
            }
        }
    }
}

impl fmt::Display for WatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TakeProfit => f.write_str("take-profit"),
            Self::StopLoss => f.write_str("stop-loss"),
        }
    }
}
