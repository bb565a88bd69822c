//! Engine tuning knobs, deserialized from the `[engine]` and `[backoff]`
//! sections of the configuration file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Channel sizes, settlement parallelism and external call timeout.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Capacity of each closure channel (threshold and margin).
    #[serde(default = "default_closure_buffer")]
    pub closure_buffer: usize,
    /// Capacity of each margin task's add and remove inboxes.
    #[serde(default = "default_control_buffer")]
    pub control_buffer: usize,
    /// Settlements allowed in flight at once.
    #[serde(default = "default_settlement_concurrency")]
    pub settlement_concurrency: usize,
    /// Upper bound on any single price, payment or storage call made while
    /// opening or settling a position (milliseconds).
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_closure_buffer() -> usize {
    64
}

fn default_control_buffer() -> usize {
    16
}

fn default_settlement_concurrency() -> usize {
    8
}

fn default_call_timeout_ms() -> u64 {
    5000
}

impl EngineConfig {
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            closure_buffer: default_closure_buffer(),
            control_buffer: default_control_buffer(),
            settlement_concurrency: default_settlement_concurrency(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

/// Retry delays for the price and change-feed pumps.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackoffConfig {
    /// Delay before the first retry (milliseconds).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Ceiling for the delay (milliseconds).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor applied after each failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}
