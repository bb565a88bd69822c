//! Exponential retry delay for the long-lived pumps.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::config::BackoffConfig;

/// Exponential backoff with up to 20% random jitter.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current_delay_ms: u64,
    attempts: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        let current_delay_ms = config.initial_delay_ms;
        Self {
            config,
            current_delay_ms,
            attempts: 0,
        }
    }

    /// Consecutive failures since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget past failures after a successful call.
    pub fn reset(&mut self) {
        self.current_delay_ms = self.config.initial_delay_ms;
        self.attempts = 0;
    }

    /// Return the current delay and advance the state for the next call.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_delay_ms;
        let delay = Duration::from_millis(base + jitter_ms(base));

        let next = (base as f64 * self.config.multiplier) as u64;
        self.current_delay_ms = next.clamp(self.config.initial_delay_ms, self.config.max_delay_ms);
        self.attempts = self.attempts.saturating_add(1);

        delay
    }

    /// Sleep for the next delay. Returns `false` if `cancel` fired first.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

fn jitter_ms(base_ms: u64) -> u64 {
    let range = base_ms / 5;
    if range == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=range)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 350,
            multiplier: 2.0,
        }
    }

    #[test]
    fn delays_grow_then_cap() {
        let mut backoff = Backoff::new(config());
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(120));
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(240));
        let third = backoff.next_delay();
        assert!(third >= Duration::from_millis(350) && third <= Duration::from_millis(420));
        let fourth = backoff.next_delay();
        assert!(fourth <= Duration::from_millis(420));
        assert_eq!(backoff.attempts(), 4);
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut backoff = Backoff::new(config());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn wait_yields_to_cancellation() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            multiplier: 1.0,
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!backoff.wait(&cancel).await);
    }
}
