//! Price fan-out: relays each tick batch to the threshold watchers and the
//! margin tasks interested in its instruments.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::trace;

use super::margin::MarginAggregator;
use super::watcher::{DeliveryStats, ThresholdRegistry};
use crate::domain::{Instrument, PriceTick};

/// Per-destination delivery counts for one published batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutStats {
    pub watchers: DeliveryStats,
    pub margin: DeliveryStats,
}

/// Stateless relay over both registries.
#[derive(Clone)]
pub struct PriceFanout {
    thresholds: Arc<ThresholdRegistry>,
    margin: Arc<MarginAggregator>,
}

impl PriceFanout {
    #[must_use]
    pub const fn new(thresholds: Arc<ThresholdRegistry>, margin: Arc<MarginAggregator>) -> Self {
        Self { thresholds, margin }
    }

    /// Deliver a batch in feed order. Never blocks on a slow destination.
    pub fn publish(&self, ticks: &[PriceTick]) -> FanoutStats {
        if ticks.is_empty() {
            return FanoutStats::default();
        }
        let stats = FanoutStats {
            watchers: self.thresholds.deliver(ticks),
            margin: self.margin.send_prices(ticks),
        };
        trace!(
            ticks = ticks.len(),
            watchers = stats.watchers.delivered,
            margin = stats.margin.delivered,
            "Published price batch"
        );
        stats
    }

    /// Union of instruments either registry needs prices for, sorted.
    #[must_use]
    pub fn instruments(&self) -> Vec<Instrument> {
        let mut all: HashSet<Instrument> = self.thresholds.instruments();
        all.extend(self.margin.instruments());
        let mut all: Vec<_> = all.into_iter().collect();
        all.sort();
        all
    }
}
