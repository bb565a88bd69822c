//! Channel-backed [`PriceService`] for on-demand tick delivery.
//!
//! [`ChannelPriceFeed`] is handed to the engine; the paired
//! [`PriceFeedHandle`] stays with the test to push batches, move quotes,
//! inject failures and inspect subscription updates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{Instrument, PriceTick};
use crate::error::{Error, Result};
use crate::port::PriceService;

#[derive(Default)]
struct Shared {
    quotes: Mutex<HashMap<Instrument, PriceTick>>,
    subscriptions: Mutex<Vec<Vec<Instrument>>>,
    quotes_down: AtomicBool,
}

pub struct ChannelPriceFeed {
    batches: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Vec<PriceTick>>>>,
    shared: Arc<Shared>,
}

#[derive(Clone)]
pub struct PriceFeedHandle {
    batches: mpsc::UnboundedSender<Result<Vec<PriceTick>>>,
    shared: Arc<Shared>,
}

/// Create a connected feed and handle pair.
pub fn channel_feed() -> (ChannelPriceFeed, PriceFeedHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());
    (
        ChannelPriceFeed {
            batches: tokio::sync::Mutex::new(rx),
            shared: Arc::clone(&shared),
        },
        PriceFeedHandle { batches: tx, shared },
    )
}

impl PriceFeedHandle {
    /// Update the quotes, then deliver the ticks as one batch.
    pub fn send(&self, ticks: Vec<PriceTick>) {
        self.set_quotes(&ticks);
        let _ = self.batches.send(Ok(ticks));
    }

    /// Move point-in-time quotes without streaming anything.
    pub fn set_quotes(&self, ticks: &[PriceTick]) {
        let mut quotes = self.shared.quotes.lock();
        for tick in ticks {
            quotes.insert(tick.instrument.clone(), tick.clone());
        }
    }

    /// Make the next `next_batch` call fail with an upstream error.
    pub fn fail_batch(&self, reason: &str) {
        let _ = self
            .batches
            .send(Err(Error::upstream("prices", reason.to_string())));
    }

    /// Make `current_prices` fail until called again with `false`.
    pub fn set_quotes_down(&self, down: bool) {
        self.shared.quotes_down.store(down, Ordering::SeqCst);
    }

    /// Every subscription set pushed so far, oldest first.
    pub fn subscriptions(&self) -> Vec<Vec<Instrument>> {
        self.shared.subscriptions.lock().clone()
    }

    pub fn last_subscription(&self) -> Option<Vec<Instrument>> {
        self.shared.subscriptions.lock().last().cloned()
    }
}

#[async_trait]
impl PriceService for ChannelPriceFeed {
    async fn next_batch(&self, cancel: &CancellationToken) -> Result<Vec<PriceTick>> {
        let mut batches = self.batches.lock().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Canceled),
            batch = batches.recv() => batch.unwrap_or(Err(Error::Canceled)),
        }
    }

    async fn update_subscription(&self, instruments: &[Instrument]) -> Result<()> {
        self.shared.subscriptions.lock().push(instruments.to_vec());
        Ok(())
    }

    async fn current_prices(
        &self,
        instruments: &[Instrument],
    ) -> Result<HashMap<Instrument, PriceTick>> {
        if self.shared.quotes_down.load(Ordering::SeqCst) {
            return Err(Error::upstream("prices", "quotes unavailable"));
        }
        let quotes = self.shared.quotes.lock();
        Ok(instruments
            .iter()
            .filter_map(|i| quotes.get(i).map(|t| (i.clone(), t.clone())))
            .collect())
    }
}
