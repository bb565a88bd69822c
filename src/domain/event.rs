//! Lifecycle notifications from the store and closure requests from watchers.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Position, WatchKind};

/// Position lifecycle transition reported by the store's change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    StopLossSet,
    TakeProfitSet,
    Closed,
}

/// A change-feed notification with a snapshot of the position at emission.
///
/// Drives watcher lifecycle only; settlement always re-reads the position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub position: Position,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, position: Position) -> Self {
        Self { kind, position }
    }
}

/// Why a position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    /// Forced liquidation: the owner's aggregate short P&L went negative.
    MarginCall,
    /// Requested by the owner.
    Manual,
}

impl From<WatchKind> for CloseReason {
    fn from(kind: WatchKind) -> Self {
        match kind {
            WatchKind::TakeProfit => Self::TakeProfit,
            WatchKind::StopLoss => Self::StopLoss,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TakeProfit => "take_profit",
            Self::StopLoss => "stop_loss",
            Self::MarginCall => "margin_call",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Request to close a position, emitted in-process by a watcher or the
/// margin aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosureEvent {
    /// Snapshot the trigger decided on. Not authoritative for settlement.
    pub position: Position,
    /// Selling price that triggered the closure.
    pub price: Decimal,
    pub reason: CloseReason,
    pub at: DateTime<Utc>,
}

impl ClosureEvent {
    pub fn new(position: Position, price: Decimal, reason: CloseReason) -> Self {
        Self {
            position,
            price,
            reason,
            at: Utc::now(),
        }
    }
}
