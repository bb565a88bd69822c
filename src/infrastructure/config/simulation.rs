//! Simulated market and seed positions for `tripwire run`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::Direction;

/// Random-walk feed and ledger settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Instruments quoted by the feed, with their starting mid price.
    #[serde(default)]
    pub instruments: Vec<InstrumentSeed>,
    /// Milliseconds between price batches.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Largest relative mid-price move per tick.
    #[serde(default = "default_volatility")]
    pub volatility: f64,
    /// Absolute ask minus bid.
    #[serde(default = "default_spread")]
    pub spread: Decimal,
    /// Deposit credited to every seed user.
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    /// Fixed RNG seed for reproducible runs.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Positions opened at startup.
    #[serde(default)]
    pub positions: Vec<SeedPosition>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstrumentSeed {
    pub name: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SeedPosition {
    pub user: String,
    pub instrument: String,
    pub amount: Decimal,
    pub direction: Direction,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
}

fn default_tick_interval_ms() -> u64 {
    500
}

fn default_volatility() -> f64 {
    0.01
}

fn default_spread() -> Decimal {
    Decimal::new(1, 2)
}

fn default_initial_balance() -> Decimal {
    Decimal::new(100_000, 0)
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            instruments: Vec::new(),
            tick_interval_ms: default_tick_interval_ms(),
            volatility: default_volatility(),
            spread: default_spread(),
            initial_balance: default_initial_balance(),
            seed: None,
            positions: Vec::new(),
        }
    }
}
