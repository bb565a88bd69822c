//! Price ticks from the price service.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Instrument;

/// One quote for an instrument. Ticks carry no identity beyond instrument
/// name and arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub instrument: Instrument,
    /// Bid. Values an exit.
    pub selling_price: Decimal,
    /// Ask. Values an entry.
    pub purchase_price: Decimal,
}

impl PriceTick {
    pub fn new(instrument: impl Into<Instrument>, selling_price: Decimal, purchase_price: Decimal) -> Self {
        Self {
            instrument: instrument.into(),
            selling_price,
            purchase_price,
        }
    }
}
