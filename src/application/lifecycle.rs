//! Change-feed handling: keeps watchers, margin tasks and the price
//! subscription in step with committed position changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fanout::PriceFanout;
use super::margin::MarginAggregator;
use super::settlement::bounded;
use super::watcher::ThresholdRegistry;
use crate::domain::{ChangeEvent, ChangeKind, Instrument, Position, WatchKind};
use crate::error::{Result, WatchError};
use crate::port::PriceService;

pub struct Lifecycle {
    thresholds: Arc<ThresholdRegistry>,
    margin: Arc<MarginAggregator>,
    fanout: PriceFanout,
    prices: Arc<dyn PriceService>,
    call_timeout: Duration,
    subscribed: Mutex<Vec<Instrument>>,
}

impl Lifecycle {
    pub fn new(
        thresholds: Arc<ThresholdRegistry>,
        margin: Arc<MarginAggregator>,
        prices: Arc<dyn PriceService>,
        call_timeout: Duration,
    ) -> Self {
        let fanout = PriceFanout::new(Arc::clone(&thresholds), Arc::clone(&margin));
        Self {
            thresholds,
            margin,
            fanout,
            prices,
            call_timeout,
            subscribed: Mutex::new(Vec::new()),
        }
    }

    /// Apply one change-feed event, then resync the price subscription.
    ///
    /// Registry misuse is logged and skipped. Only cancellation and upstream
    /// failures surface.
    pub async fn apply(&self, ctx: &CancellationToken, event: &ChangeEvent) -> Result<()> {
        let position = &event.position;
        debug!(position = %position.id, kind = ?event.kind, "Change event");
        match event.kind {
            ChangeKind::Created => self.track(ctx, position).await?,
            ChangeKind::StopLossSet => self.rearm(ctx, position, WatchKind::StopLoss),
            ChangeKind::TakeProfitSet => self.rearm(ctx, position, WatchKind::TakeProfit),
            ChangeKind::Closed => self.release(position).await,
        }
        self.sync_subscription().await?;
        Ok(())
    }

    async fn track(&self, ctx: &CancellationToken, position: &Position) -> Result<()> {
        if !position.is_open() {
            return Ok(());
        }
        match self.thresholds.watch(ctx, position) {
            Ok(0) => {}
            Ok(started) => debug!(position = %position.id, started, "Thresholds armed"),
            Err(e) => warn!(error = %e, "Watch skipped"),
        }
        if position.direction.is_short() {
            let instruments = std::slice::from_ref(&position.instrument);
            let quotes = match bounded(
                self.call_timeout,
                "current_prices",
                self.prices.current_prices(instruments),
            )
            .await
            {
                Ok(quotes) => quotes,
                Err(e) => {
                    warn!(position = %position.id, error = %e, "No seed price for margin tracking");
                    HashMap::new()
                }
            };
            self.margin
                .add_positions(ctx, vec![position.clone()], &quotes)
                .await?;
        }
        Ok(())
    }

    fn rearm(&self, ctx: &CancellationToken, position: &Position, kind: WatchKind) {
        if let Err(e) = self.thresholds.unwatch(position, kind) {
            debug!(error = %e, "Nothing to replace");
        }
        match self.thresholds.watch_kind(ctx, position, kind) {
            Ok(true) => info!(position = %position.id, %kind, "Threshold updated"),
            Ok(false) => info!(position = %position.id, %kind, "Threshold cleared"),
            Err(e) => warn!(error = %e, "Rearm skipped"),
        }
    }

    async fn release(&self, position: &Position) {
        for kind in WatchKind::ALL {
            if let Err(WatchError::NotWatching { .. }) = self.thresholds.unwatch(position, kind) {
                continue;
            }
            debug!(position = %position.id, %kind, "Watcher released on close");
        }
        if position.direction.is_short() {
            if let Err(e) = self.margin.remove_position(&position.id).await {
                debug!(error = %e, "Margin release skipped");
            }
        }
    }

    /// Push the union of watched instruments to the price service when it
    /// changed. Returns whether an update was sent.
    pub async fn sync_subscription(&self) -> Result<bool> {
        let wanted = self.fanout.instruments();
        let mut current = self.subscribed.lock().await;
        if *current == wanted {
            return Ok(false);
        }
        bounded(
            self.call_timeout,
            "update_subscription",
            self.prices.update_subscription(&wanted),
        )
        .await?;
        info!(instruments = wanted.len(), "Price subscription updated");
        *current = wanted;
        Ok(true)
    }
}
