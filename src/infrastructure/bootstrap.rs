//! Composition root for the simulated runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapter::memory::{MemoryLedger, MemoryPositionStore};
use crate::adapter::simulated::RandomWalkFeed;
use crate::application::{Collaborators, Engine, ReportOutcome};
use crate::domain::{Instrument, Position, UserId};
use crate::error::Result;
use crate::infrastructure::config::{Config, SeedPosition};

/// An engine wired to in-memory collaborators.
pub struct Simulation {
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryPositionStore>,
    pub ledger: Arc<MemoryLedger>,
    pub feed: Arc<RandomWalkFeed>,
}

impl Simulation {
    /// Build the engine and its collaborators. Must run inside a tokio
    /// runtime.
    pub fn build(config: &Config) -> Self {
        let sim = &config.simulation;
        let starting: HashMap<Instrument, _> = sim
            .instruments
            .iter()
            .map(|seed| (Instrument::from(seed.name.as_str()), seed.price))
            .collect();
        let feed = Arc::new(RandomWalkFeed::new(
            starting,
            Duration::from_millis(sim.tick_interval_ms),
            sim.volatility,
            sim.spread,
            sim.seed,
        ));
        let store = Arc::new(MemoryPositionStore::new());
        let ledger = Arc::new(MemoryLedger::new());

        let engine = Arc::new(Engine::new(
            Collaborators {
                store: store.clone(),
                prices: feed.clone(),
                payments: ledger.clone(),
                transactor: store.clone(),
            },
            config.engine.clone(),
            config.backoff.clone(),
        ));

        Self {
            engine,
            store,
            ledger,
            feed,
        }
    }

    /// Fund the seed users and open the configured positions.
    ///
    /// A seed that fails to open is logged and skipped.
    pub async fn open_seed_positions(&self, config: &Config) -> Vec<Position> {
        let sim = &config.simulation;
        let mut opened = Vec::with_capacity(sim.positions.len());
        for seed in &sim.positions {
            let user = UserId::from(seed.user.as_str());
            if self.ledger.balance(&user).is_none() {
                self.ledger.open_account(&user, sim.initial_balance);
            }
            match self.open_seed(user, seed).await {
                Ok(position) => opened.push(position),
                Err(e) => warn!(user = %seed.user, instrument = %seed.instrument, error = %e, "Seed position skipped"),
            }
        }
        opened
    }

    async fn open_seed(
        &self,
        user: UserId,
        seed: &SeedPosition,
    ) -> Result<Position> {
        let trading = self.engine.trading();
        let mut position = trading
            .open_position(
                user,
                Instrument::from(seed.instrument.as_str()),
                seed.amount,
                seed.direction,
            )
            .await?;
        if let Some(value) = seed.stop_loss {
            position = trading.set_stop_loss(&position.id, value).await?;
        }
        if let Some(value) = seed.take_profit {
            position = trading.set_take_profit(&position.id, value).await?;
        }
        Ok(position)
    }
}

/// Run the simulated engine until `cancel` fires.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let simulation = Simulation::build(&config);
    info!(
        instruments = config.simulation.instruments.len(),
        seeds = config.simulation.positions.len(),
        "Simulation starting"
    );

    let engine = tokio::spawn(Arc::clone(&simulation.engine).run(cancel.clone()));
    let reporter = tokio::spawn(log_reports(Arc::clone(&simulation.engine), cancel.clone()));

    let opened = simulation.open_seed_positions(&config).await;
    info!(opened = opened.len(), "Seed positions opened");

    let result = match engine.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Engine task failed");
            Ok(())
        }
    };
    cancel.cancel();
    let _ = reporter.await;
    result
}

async fn log_reports(engine: Arc<Engine>, cancel: CancellationToken) {
    let mut reports = engine.reports();
    loop {
        let report = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            report = reports.recv() => report,
        };
        match report {
            Ok(report) => match &report.outcome {
                ReportOutcome::Settled { price, net } => info!(
                    position = %report.position,
                    user = %report.user,
                    reason = %report.reason,
                    %price,
                    %net,
                    "Closed"
                ),
                ReportOutcome::AlreadyClosed => info!(
                    position = %report.position,
                    reason = %report.reason,
                    "Closure skipped, already closed"
                ),
                ReportOutcome::Failed { message } => warn!(
                    position = %report.position,
                    reason = %report.reason,
                    error = %message,
                    "Closure failed"
                ),
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Settlement reports dropped"),
            Err(RecvError::Closed) => break,
        }
    }
}
