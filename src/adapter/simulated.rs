//! Random-walk price feed for running the engine without a market.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::{Instrument, PriceTick};
use crate::error::{Error, Result};
use crate::port::PriceService;

/// Smallest mid price the walk can reach.
const FLOOR: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Each tick moves every subscribed mid price by a uniform relative step in
/// `[-volatility, volatility]` and quotes it with a fixed spread.
pub struct RandomWalkFeed {
    mids: Mutex<HashMap<Instrument, Decimal>>,
    subscribed: RwLock<HashSet<Instrument>>,
    ticker: tokio::sync::Mutex<Interval>,
    volatility: f64,
    spread: Decimal,
    rng: Mutex<StdRng>,
}

impl RandomWalkFeed {
    /// Must be called inside a tokio runtime.
    pub fn new(
        starting: HashMap<Instrument, Decimal>,
        tick_interval: Duration,
        volatility: f64,
        spread: Decimal,
        seed: Option<u64>,
    ) -> Self {
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self {
            mids: Mutex::new(starting),
            subscribed: RwLock::new(HashSet::new()),
            ticker: tokio::sync::Mutex::new(ticker),
            volatility: volatility.abs(),
            spread,
            rng: Mutex::new(rng),
        }
    }

    fn quote(&self, instrument: &Instrument, mid: Decimal) -> PriceTick {
        let half = self.spread / Decimal::TWO;
        let bid = (mid - half).max(FLOOR).round_dp(4);
        let ask = (mid + half).round_dp(4);
        PriceTick::new(instrument.clone(), bid, ask)
    }

    fn step(&self) -> Vec<PriceTick> {
        let subscribed = self.subscribed.read();
        let mut mids = self.mids.lock();
        let mut rng = self.rng.lock();
        let mut ticks = Vec::with_capacity(subscribed.len());
        for instrument in subscribed.iter() {
            let Some(mid) = mids.get_mut(instrument) else {
                continue;
            };
            let change = if self.volatility > 0.0 {
                rng.gen_range(-self.volatility..=self.volatility)
            } else {
                0.0
            };
            let factor = Decimal::ONE + Decimal::try_from(change).unwrap_or_default();
            *mid = (*mid * factor).max(FLOOR);
            ticks.push(self.quote(instrument, *mid));
        }
        ticks.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        ticks
    }
}

#[async_trait]
impl PriceService for RandomWalkFeed {
    async fn next_batch(&self, cancel: &CancellationToken) -> Result<Vec<PriceTick>> {
        let mut ticker = self.ticker.lock().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Canceled),
            _ = ticker.tick() => {}
        }
        Ok(self.step())
    }

    async fn update_subscription(&self, instruments: &[Instrument]) -> Result<()> {
        let known = self.mids.lock();
        let unknown: Vec<_> = instruments.iter().filter(|i| !known.contains_key(*i)).collect();
        if !unknown.is_empty() {
            debug!(?unknown, "Subscribed to instruments without a starting price");
        }
        drop(known);
        *self.subscribed.write() = instruments.iter().cloned().collect();
        info!(instruments = instruments.len(), "Simulated feed subscription replaced");
        Ok(())
    }

    async fn current_prices(
        &self,
        instruments: &[Instrument],
    ) -> Result<HashMap<Instrument, PriceTick>> {
        let mids = self.mids.lock();
        Ok(instruments
            .iter()
            .filter_map(|instrument| {
                mids.get(instrument)
                    .map(|mid| (instrument.clone(), self.quote(instrument, *mid)))
            })
            .collect())
    }
}
