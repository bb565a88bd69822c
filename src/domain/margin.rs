//! Aggregate unrealized P&L over one user's short positions.
//!
//! A short returns `amount × (2 × purchase − last)` when closed at `last`:
//! the collateral `amount × purchase` plus the price drop. The book's
//! aggregate is the sum over all tracked shorts; while it is negative the
//! position with the largest single loss is liquidated first, ties broken by
//! position id.
//!
//! Valuation saturates at the `Decimal` bounds instead of overflowing. A loss
//! too large to represent values at `Decimal::MIN` and is liquidated first.

use std::collections::{BTreeMap, HashMap, HashSet};

use rust_decimal::Decimal;

use super::{Instrument, Position, PositionId, PriceTick};

/// Per-user margin state: tracked short positions plus the last seen price
/// for each instrument they reference.
#[derive(Debug, Default, Clone)]
pub struct ShortBook {
    positions: BTreeMap<PositionId, Position>,
    last_prices: HashMap<Instrument, Decimal>,
}

/// A position chosen for forced liquidation and the price it was valued at.
#[derive(Debug, Clone, PartialEq)]
pub struct Liquidation {
    pub position: Position,
    pub price: Decimal,
}

impl ShortBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a short position. Long or closed positions are ignored.
    ///
    /// `price` seeds the instrument's last price when none is known yet;
    /// without either the purchase price is used.
    pub fn insert(&mut self, position: Position, price: Option<Decimal>) -> bool {
        if !position.direction.is_short() || !position.is_open() {
            return false;
        }
        let seed = price.unwrap_or(position.purchase_price);
        self.last_prices
            .entry(position.instrument.clone())
            .or_insert(seed);
        self.positions.insert(position.id.clone(), position);
        true
    }

    pub fn remove(&mut self, id: &PositionId) -> Option<Position> {
        let removed = self.positions.remove(id)?;
        if !self
            .positions
            .values()
            .any(|p| p.instrument == removed.instrument)
        {
            self.last_prices.remove(&removed.instrument);
        }
        Some(removed)
    }

    /// Record a tick. Returns false when no tracked position uses the instrument.
    pub fn update_price(&mut self, tick: &PriceTick) -> bool {
        match self.last_prices.get_mut(&tick.instrument) {
            Some(last) => {
                *last = tick.selling_price;
                true
            }
            None => false,
        }
    }

    fn last_price(&self, position: &Position) -> Decimal {
        self.last_prices
            .get(&position.instrument)
            .copied()
            .unwrap_or(position.purchase_price)
    }

    /// Value of one position at the last known price, saturating.
    #[must_use]
    pub fn value_of(&self, position: &Position) -> Decimal {
        let last = self.last_price(position);
        position.exit_value(last).unwrap_or_else(|| {
            let per_unit = Decimal::TWO
                .saturating_mul(position.purchase_price)
                .saturating_sub(last);
            position.amount.saturating_mul(per_unit)
        })
    }

    /// Sum of all tracked position values, saturating.
    #[must_use]
    pub fn aggregate(&self) -> Decimal {
        self.positions
            .values()
            .fold(Decimal::ZERO, |sum, p| sum.saturating_add(self.value_of(p)))
    }

    /// Remove positions, largest loss first, until the aggregate is
    /// non-negative or the book is empty.
    pub fn liquidate(&mut self) -> Vec<Liquidation> {
        let mut out = Vec::new();
        while self.aggregate() < Decimal::ZERO {
            let Some(worst) = self.worst_position() else {
                break;
            };
            let price = self
                .positions
                .get(&worst)
                .map(|p| self.last_price(p))
                .unwrap_or_default();
            if let Some(position) = self.remove(&worst) {
                out.push(Liquidation { position, price });
            }
        }
        out
    }

    fn worst_position(&self) -> Option<PositionId> {
        let mut worst: Option<(&PositionId, Decimal)> = None;
        for (id, position) in &self.positions {
            let value = self.value_of(position);
            match worst {
                Some((_, v)) if value >= v => {}
                _ => worst = Some((id, value)),
            }
        }
        worst.map(|(id, _)| id.clone())
    }

    #[must_use]
    pub fn contains(&self, id: &PositionId) -> bool {
        self.positions.contains_key(id)
    }

    #[must_use]
    pub fn instruments(&self) -> HashSet<Instrument> {
        self.positions.values().map(|p| p.instrument.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
