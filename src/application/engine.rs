//! Engine: wires the registries, the settler and the trading service to the
//! collaborators, and runs the three long-lived pumps.
//!
//! - price pump: price feed → fan-out
//! - change pump: change feed → lifecycle (watch, unwatch, subscription)
//! - closure pump: both closure sources → settlement, bounded parallelism
//!
//! Every pump stops when the root cancellation token fires. Upstream failures
//! are retried with backoff; nothing short of cancellation ends a pump.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::config::{BackoffConfig, EngineConfig};
use super::fanout::PriceFanout;
use super::lifecycle::Lifecycle;
use super::margin::MarginAggregator;
use super::settlement::{SettlementOutcome, Settler};
use super::trading::TradingService;
use super::watcher::ThresholdRegistry;
use crate::domain::{CloseReason, ClosureEvent, PositionId, UserId};
use crate::error::{Error, Result};
use crate::port::{PaymentService, PositionStore, PriceService, Transactor};

/// External services the engine consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn PositionStore>,
    pub prices: Arc<dyn PriceService>,
    pub payments: Arc<dyn PaymentService>,
    pub transactor: Arc<dyn Transactor>,
}

/// How a closure event ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReportOutcome {
    Settled { price: Decimal, net: Decimal },
    AlreadyClosed,
    Failed { message: String },
}

/// One settlement attempt, published to report subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementReport {
    pub position: PositionId,
    pub user: UserId,
    pub reason: CloseReason,
    #[serde(flatten)]
    pub outcome: ReportOutcome,
}

pub struct Engine {
    store: Arc<dyn PositionStore>,
    prices: Arc<dyn PriceService>,
    thresholds: Arc<ThresholdRegistry>,
    margin: Arc<MarginAggregator>,
    fanout: PriceFanout,
    lifecycle: Lifecycle,
    settler: Arc<Settler>,
    trading: TradingService,
    config: EngineConfig,
    backoff: BackoffConfig,
    reports: broadcast::Sender<SettlementReport>,
}

impl Engine {
    pub fn new(collaborators: Collaborators, config: EngineConfig, backoff: BackoffConfig) -> Self {
        let Collaborators {
            store,
            prices,
            payments,
            transactor,
        } = collaborators;
        let call_timeout = config.call_timeout();

        let thresholds = Arc::new(ThresholdRegistry::new(config.closure_buffer));
        let margin = Arc::new(MarginAggregator::new(
            config.closure_buffer,
            config.control_buffer,
        ));
        let fanout = PriceFanout::new(Arc::clone(&thresholds), Arc::clone(&margin));
        let lifecycle = Lifecycle::new(
            Arc::clone(&thresholds),
            Arc::clone(&margin),
            Arc::clone(&prices),
            call_timeout,
        );
        let settler = Arc::new(Settler::new(
            Arc::clone(&prices),
            Arc::clone(&payments),
            Arc::clone(&transactor),
            call_timeout,
        ));
        let trading = TradingService::new(
            Arc::clone(&store),
            Arc::clone(&prices),
            payments,
            transactor,
            Arc::clone(&settler),
            call_timeout,
        );
        let (reports, _) = broadcast::channel(config.closure_buffer.max(1));

        Self {
            store,
            prices,
            thresholds,
            margin,
            fanout,
            lifecycle,
            settler,
            trading,
            config,
            backoff,
            reports,
        }
    }

    /// Subscribe to settlement reports. Slow subscribers lag and skip.
    #[must_use]
    pub fn reports(&self) -> broadcast::Receiver<SettlementReport> {
        self.reports.subscribe()
    }

    #[must_use]
    pub const fn trading(&self) -> &TradingService {
        &self.trading
    }

    #[must_use]
    pub const fn thresholds(&self) -> &Arc<ThresholdRegistry> {
        &self.thresholds
    }

    #[must_use]
    pub const fn margin(&self) -> &Arc<MarginAggregator> {
        &self.margin
    }

    /// Run until `cancel` fires, then wait for in-flight settlements.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!(
            closure_buffer = self.config.closure_buffer,
            settlement_concurrency = self.config.settlement_concurrency,
            "Engine starting"
        );
        let prices = tokio::spawn(Arc::clone(&self).price_pump(cancel.clone()));
        let changes = tokio::spawn(Arc::clone(&self).change_pump(cancel.clone()));
        let closures = tokio::spawn(Arc::clone(&self).closure_pump(cancel.clone()));

        let (prices, changes, closures) = tokio::join!(prices, changes, closures);
        for (pump, joined) in [("price", prices), ("change", changes), ("closure", closures)] {
            if let Err(e) = joined {
                error!(pump, error = %e, "Pump task failed");
            }
        }
        info!("Engine stopped");
        Ok(())
    }

    async fn price_pump(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.backoff.clone());
        loop {
            match self.prices.next_batch(&cancel).await {
                Ok(batch) => {
                    backoff.reset();
                    self.fanout.publish(&batch);
                }
                Err(e) if e.is_canceled() || cancel.is_cancelled() => break,
                Err(e) => {
                    warn!(error = %e, attempt = backoff.attempts() + 1, "Price feed failed, backing off");
                    if !backoff.wait(&cancel).await {
                        break;
                    }
                }
            }
        }
        debug!("Price pump stopped");
    }

    async fn change_pump(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.backoff.clone());
        loop {
            let event = match self.store.next_change_event(&cancel).await {
                Ok(event) => event,
                Err(e) if e.is_canceled() || cancel.is_cancelled() => break,
                Err(e) => {
                    warn!(error = %e, attempt = backoff.attempts() + 1, "Change feed failed, backing off");
                    if !backoff.wait(&cancel).await {
                        break;
                    }
                    continue;
                }
            };
            match self.lifecycle.apply(&cancel, &event).await {
                Ok(()) => backoff.reset(),
                Err(e) if e.is_canceled() || cancel.is_cancelled() => break,
                Err(e) => {
                    warn!(position = %event.position.id, error = %e, "Change event applied partially");
                    if !self.resync(&cancel, &mut backoff).await {
                        break;
                    }
                }
            }
        }
        debug!("Change pump stopped");
    }

    /// Retry the subscription update until it goes through. Returns `false`
    /// on cancellation.
    async fn resync(&self, cancel: &CancellationToken, backoff: &mut Backoff) -> bool {
        loop {
            if !backoff.wait(cancel).await {
                return false;
            }
            match self.lifecycle.sync_subscription().await {
                Ok(_) => {
                    backoff.reset();
                    return true;
                }
                Err(e) => {
                    warn!(error = %e, attempt = backoff.attempts(), "Subscription update failed");
                }
            }
        }
    }

    async fn closure_pump(self: Arc<Self>, cancel: CancellationToken) {
        let slots = self.config.settlement_concurrency.max(1);
        let permits = Arc::new(Semaphore::new(slots));
        loop {
            let event = match next_closure(&self.thresholds, &self.margin, &cancel).await {
                Ok(event) => event,
                Err(e) if e.is_canceled() => break,
                Err(e) => {
                    warn!(error = %e, "Closure source failed");
                    continue;
                }
            };
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                engine.settle_and_report(event).await;
                drop(permit);
            });
        }

        let slots = u32::try_from(slots).unwrap_or(u32::MAX);
        if permits.acquire_many(slots).await.is_ok() {
            debug!("In-flight settlements drained");
        }
        debug!("Closure pump stopped");
    }

    async fn settle_and_report(&self, event: ClosureEvent) {
        let outcome = match self.settler.settle(&event).await {
            Ok(SettlementOutcome::Settled { price, transfer, .. }) => ReportOutcome::Settled {
                price,
                net: transfer.net(),
            },
            Ok(SettlementOutcome::AlreadyClosed) => ReportOutcome::AlreadyClosed,
            Err(e) => {
                error!(
                    position = %event.position.id,
                    reason = %event.reason,
                    error = %e,
                    "Settlement failed"
                );
                ReportOutcome::Failed {
                    message: e.to_string(),
                }
            }
        };
        // No subscribers is fine.
        let _ = self.reports.send(SettlementReport {
            position: event.position.id,
            user: event.position.user,
            reason: event.reason,
            outcome,
        });
    }
}

/// Next closure from either source. Cancellation wins; otherwise the two
/// sources are polled in random order so neither starves the other.
async fn next_closure(
    thresholds: &ThresholdRegistry,
    margin: &MarginAggregator,
    cancel: &CancellationToken,
) -> Result<ClosureEvent> {
    if cancel.is_cancelled() {
        return Err(Error::Canceled);
    }
    tokio::select! {
        event = thresholds.closures(cancel) => event,
        event = margin.closures(cancel) => event,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::PriceTick;
    use crate::testkit::domain::{long, short};

    #[tokio::test]
    async fn margin_calls_are_not_starved_by_threshold_triggers() {
        let thresholds = ThresholdRegistry::new(64);
        let margin = MarginAggregator::new(8, 8);
        let ctx = CancellationToken::new();
        for i in 0..24 {
            let mut p = long(&format!("u{i}"), "A", dec!(1), dec!(100));
            p.take_profit = Some(dec!(110));
            thresholds.watch(&ctx, &p).unwrap();
        }
        thresholds.deliver(&[PriceTick::new("A", dec!(111), dec!(111))]);

        let s = short("m", "B", dec!(100), dec!(30));
        let seed: HashMap<_, _> = [(s.instrument.clone(), PriceTick::new("B", dec!(70), dec!(70)))]
            .into_iter()
            .collect();
        margin.add_positions(&ctx, vec![s.clone()], &seed).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut seen = Vec::new();
        for _ in 0..24 {
            let event = next_closure(&thresholds, &margin, &ctx).await.unwrap();
            seen.push(event.reason);
            if event.reason == CloseReason::MarginCall {
                break;
            }
        }
        assert_eq!(seen.last(), Some(&CloseReason::MarginCall));
    }

    #[tokio::test]
    async fn canceled_token_ends_the_merge() {
        let thresholds = ThresholdRegistry::new(8);
        let margin = MarginAggregator::new(8, 8);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = next_closure(&thresholds, &margin, &ctx).await.unwrap_err();
        assert!(err.is_canceled());
    }
}
