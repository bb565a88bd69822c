//! Canonical test configurations.

use crate::application::{BackoffConfig, EngineConfig};

/// Small buffers and a short call timeout.
pub fn engine() -> EngineConfig {
    EngineConfig {
        closure_buffer: 16,
        control_buffer: 4,
        settlement_concurrency: 4,
        call_timeout_ms: 1_000,
    }
}

/// Millisecond-scale retry delays.
pub fn backoff() -> BackoffConfig {
    BackoffConfig {
        initial_delay_ms: 5,
        max_delay_ms: 50,
        multiplier: 2.0,
    }
}
