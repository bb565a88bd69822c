//! Builders for domain primitives used across tests.

use chrono::Utc;
use rust_decimal::Decimal;

use crate::domain::{Direction, Instrument, Position, PriceTick, UserId};

/// An open long position with no thresholds.
pub fn long(user: &str, instrument: &str, amount: Decimal, purchase: Decimal) -> Position {
    position(user, instrument, amount, Direction::Long, purchase)
}

/// An open short position with no thresholds.
pub fn short(user: &str, instrument: &str, amount: Decimal, purchase: Decimal) -> Position {
    position(user, instrument, amount, Direction::Short, purchase)
}

pub fn position(
    user: &str,
    instrument: &str,
    amount: Decimal,
    direction: Direction,
    purchase: Decimal,
) -> Position {
    Position::open(
        UserId::from(user),
        Instrument::from(instrument),
        amount,
        direction,
        purchase,
        Utc::now(),
    )
}

/// A tick with a zero spread.
pub fn tick(instrument: &str, price: Decimal) -> PriceTick {
    PriceTick::new(instrument, price, price)
}

/// A tick with distinct bid and ask.
pub fn quote(instrument: &str, bid: Decimal, ask: Decimal) -> PriceTick {
    PriceTick::new(instrument, bid, ask)
}
