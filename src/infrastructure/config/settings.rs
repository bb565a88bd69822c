//! Application configuration loading and validation.
//!
//! [`Config`] aggregates every section of the TOML file. All sections are
//! optional. A few values can be overridden from the environment:
//!
//! - `TRIPWIRE_LOG_LEVEL`
//! - `TRIPWIRE_LOG_FORMAT`
//! - `TRIPWIRE_CALL_TIMEOUT_MS`
//!
//! # Example
//!
//! ```no_run
//! use tripwire::infrastructure::config::Config;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("tripwire.toml")?;
//!     config.init_logging();
//!     Ok(())
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::logging::LoggingConfig;
use super::simulation::SimulationConfig;
use crate::application::{BackoffConfig, EngineConfig};
use crate::error::{ConfigError, Result};

const ENV_LOG_LEVEL: &str = "TRIPWIRE_LOG_LEVEL";
const ENV_LOG_FORMAT: &str = "TRIPWIRE_LOG_FORMAT";
const ENV_CALL_TIMEOUT_MS: &str = "TRIPWIRE_CALL_TIMEOUT_MS";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Channel sizes, settlement parallelism and call timeout.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Retry delays for the price and change-feed pumps.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Simulated market used by `tripwire run`.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn parse_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    #[allow(clippy::result_large_err)]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse_toml(&content)
    }

    /// Install the tracing subscriber described by `[logging]`.
    pub fn init_logging(&self) -> bool {
        self.logging.init()
    }

    /// Apply environment overrides through `lookup`.
    #[allow(clippy::result_large_err)]
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
        if let Some(format) = lookup(ENV_LOG_FORMAT) {
            self.logging.format = format;
        }
        if let Some(raw) = lookup(ENV_CALL_TIMEOUT_MS) {
            self.engine.call_timeout_ms =
                raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    field: ENV_CALL_TIMEOUT_MS,
                    reason: format!("expected milliseconds, got {raw:?}"),
                })?;
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(invalid("logging.format", "must be \"pretty\" or \"json\""));
        }

        let engine = &self.engine;
        if engine.closure_buffer == 0 {
            return Err(invalid("engine.closure_buffer", "must be greater than 0"));
        }
        if engine.control_buffer == 0 {
            return Err(invalid("engine.control_buffer", "must be greater than 0"));
        }
        if engine.settlement_concurrency == 0 {
            return Err(invalid("engine.settlement_concurrency", "must be greater than 0"));
        }
        if engine.call_timeout_ms == 0 {
            return Err(invalid("engine.call_timeout_ms", "must be greater than 0"));
        }

        let backoff = &self.backoff;
        if backoff.initial_delay_ms == 0 {
            return Err(invalid("backoff.initial_delay_ms", "must be greater than 0"));
        }
        if backoff.max_delay_ms < backoff.initial_delay_ms {
            return Err(invalid("backoff.max_delay_ms", "must be >= initial_delay_ms"));
        }
        if backoff.multiplier < 1.0 {
            return Err(invalid("backoff.multiplier", "must be >= 1.0"));
        }

        self.validate_simulation()
    }

    #[allow(clippy::result_large_err)]
    fn validate_simulation(&self) -> Result<()> {
        let sim = &self.simulation;
        if sim.tick_interval_ms == 0 {
            return Err(invalid("simulation.tick_interval_ms", "must be greater than 0"));
        }
        if !(0.0..1.0).contains(&sim.volatility) {
            return Err(invalid("simulation.volatility", "must be in [0, 1)"));
        }
        if sim.spread < Decimal::ZERO {
            return Err(invalid("simulation.spread", "must be 0 or greater"));
        }
        if sim.initial_balance < Decimal::ZERO {
            return Err(invalid("simulation.initial_balance", "must be 0 or greater"));
        }

        let mut names = HashSet::new();
        for instrument in &sim.instruments {
            if instrument.name.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    field: "simulation.instruments.name",
                }
                .into());
            }
            if instrument.price <= Decimal::ZERO {
                return Err(invalid("simulation.instruments.price", "must be greater than 0"));
            }
            if !names.insert(instrument.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "simulation.instruments",
                    reason: format!("duplicate instrument {:?}", instrument.name),
                }
                .into());
            }
        }

        for seed in &sim.positions {
            if seed.amount <= Decimal::ZERO {
                return Err(invalid("simulation.positions.amount", "must be greater than 0"));
            }
            if !names.contains(seed.instrument.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "simulation.positions.instrument",
                    reason: format!("{:?} is not a simulated instrument", seed.instrument),
                }
                .into());
            }
            let thresholds = [seed.stop_loss, seed.take_profit];
            if thresholds.iter().flatten().any(|v| *v <= Decimal::ZERO) {
                return Err(invalid("simulation.positions", "thresholds must be greater than 0"));
            }
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> crate::error::Error {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
    .into()
}
