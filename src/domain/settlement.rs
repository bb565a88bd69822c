//! Money movement for a closing position.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Position;

/// One payment call against the owner's account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Leg {
    Credit(Decimal),
    Debit(Decimal),
}

impl Leg {
    /// Signed effect on the account balance.
    #[must_use]
    pub fn signed(self) -> Decimal {
        match self {
            Self::Credit(amount) => amount,
            Self::Debit(amount) => -amount,
        }
    }

    /// The leg that undoes this one.
    #[must_use]
    pub fn reversed(self) -> Self {
        match self {
            Self::Credit(amount) => Self::Debit(amount),
            Self::Debit(amount) => Self::Credit(amount),
        }
    }
}

/// Transfer plan for closing a position at a given selling price.
///
/// - long: credit `amount × selling`.
/// - short: `net = amount × (2 × purchase − selling)`. A non-negative net is a
///   single credit; otherwise the collateral `amount × purchase` is credited
///   and the excess loss `amount × (selling − purchase)` is debited, so the
///   legs still sum to `net`.
///
/// Planning fails with `None` when any amount leaves the `Decimal` range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    legs: Vec<Leg>,
}

impl Transfer {
    #[must_use]
    pub fn plan(position: &Position, selling_price: Decimal) -> Option<Self> {
        let net = position.exit_value(selling_price)?;
        let legs = if position.direction.is_short() && net < Decimal::ZERO {
            let excess = selling_price.checked_sub(position.purchase_price)?;
            vec![
                Leg::Credit(position.entry_cost()?),
                Leg::Debit(position.amount.checked_mul(excess)?),
            ]
        } else {
            vec![Leg::Credit(net)]
        };
        Some(Self {
            legs: legs
                .into_iter()
                .filter(|leg| leg.signed() != Decimal::ZERO)
                .collect(),
        })
    }

    /// Payment calls to issue, in order. Zero-amount legs are omitted.
    #[must_use]
    pub fn legs(&self) -> &[Leg] {
        &self.legs
    }

    /// Net effect on the owner's balance.
    #[must_use]
    pub fn net(&self) -> Decimal {
        self.legs.iter().map(|leg| leg.signed()).sum()
    }
}
