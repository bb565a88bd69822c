//! Position record and direction.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Instrument, PositionId, UserId, WatchKind};

/// Side of a position.
///
/// A short profits when the price falls, so thresholds are mirrored for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    #[must_use]
    pub const fn is_short(self) -> bool {
        matches!(self, Self::Short)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => f.write_str("long"),
            Self::Short => f.write_str("short"),
        }
    }
}

/// A position row.
///
/// Mutable only while `closed` is `None`; the store allows exactly one close
/// transition per id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub user: UserId,
    pub instrument: Instrument,
    /// Quantity, always positive.
    pub amount: Decimal,
    pub direction: Direction,
    /// Market price at open.
    pub purchase_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub opened: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub closed: Option<DateTime<Utc>>,
    /// Selling price observed at settlement.
    pub closing_price: Option<Decimal>,
}

impl Position {
    /// Create an open position with a fresh id and no thresholds.
    pub fn open(
        user: UserId,
        instrument: Instrument,
        amount: Decimal,
        direction: Direction,
        purchase_price: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PositionId::generate(),
            user,
            instrument,
            amount,
            direction,
            purchase_price,
            stop_loss: None,
            take_profit: None,
            opened: now,
            updated: now,
            closed: None,
            closing_price: None,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.closed.is_none()
    }

    /// The threshold configured for the given watch kind, if any.
    #[must_use]
    pub fn threshold(&self, kind: WatchKind) -> Option<Decimal> {
        match kind {
            WatchKind::TakeProfit => self.take_profit,
            WatchKind::StopLoss => self.stop_loss,
        }
    }

    /// Set or clear the threshold for the given watch kind.
    pub fn set_threshold(&mut self, kind: WatchKind, value: Option<Decimal>) {
        match kind {
            WatchKind::TakeProfit => self.take_profit = value,
            WatchKind::StopLoss => self.stop_loss = value,
        }
    }

    /// Amount debited from the owner at open: principal for a long,
    /// collateral for a short. `None` when it does not fit a `Decimal`.
    #[must_use]
    pub fn entry_cost(&self) -> Option<Decimal> {
        self.amount.checked_mul(self.purchase_price)
    }

    /// Value returned to the owner if the position closed at `selling_price`.
    ///
    /// Negative for a short whose price more than doubled. `None` on overflow.
    #[must_use]
    pub fn exit_value(&self, selling_price: Decimal) -> Option<Decimal> {
        match self.direction {
            Direction::Long => self.amount.checked_mul(selling_price),
            Direction::Short => Decimal::TWO
                .checked_mul(self.purchase_price)?
                .checked_sub(selling_price)
                .and_then(|per_unit| self.amount.checked_mul(per_unit)),
        }
    }
}
