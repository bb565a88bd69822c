//! Engine wired to in-memory collaborators and a channel-driven price feed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tripwire::adapter::memory::{MemoryLedger, MemoryPositionStore};
use tripwire::application::{Collaborators, Engine, SettlementReport};
use tripwire::domain::{PositionId, UserId};
use tripwire::error::Result;
use tripwire::testkit::{self, PriceFeedHandle};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryPositionStore>,
    pub ledger: Arc<MemoryLedger>,
    pub feed: PriceFeedHandle,
    pub reports: broadcast::Receiver<SettlementReport>,
    pub cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl Harness {
    pub fn start() -> Self {
        let (prices, feed) = testkit::channel_feed();
        let store = Arc::new(MemoryPositionStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let engine = Arc::new(Engine::new(
            Collaborators {
                store: store.clone(),
                prices: Arc::new(prices),
                payments: ledger.clone(),
                transactor: store.clone(),
            },
            testkit::config::engine(),
            testkit::config::backoff(),
        ));
        let reports = engine.reports();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&engine).run(cancel.clone()));
        Self {
            engine,
            store,
            ledger,
            feed,
            reports,
            cancel,
            task,
        }
    }

    pub fn fund(&self, user: &str, amount: Decimal) -> UserId {
        let user = UserId::from(user);
        self.ledger.open_account(&user, amount);
        user
    }

    /// Next report for `position`, skipping others.
    pub async fn report_for(&mut self, position: &PositionId) -> SettlementReport {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let report = timeout(left, self.reports.recv())
                .await
                .expect("timed out waiting for a settlement report")
                .expect("report channel closed");
            if &report.position == position {
                return report;
            }
        }
    }

    /// Any report for `position` arriving within `window`.
    pub async fn maybe_report_for(
        &mut self,
        position: &PositionId,
        window: Duration,
    ) -> Option<SettlementReport> {
        let deadline = Instant::now() + window;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match timeout(left, self.reports.recv()).await {
                Ok(Ok(report)) if &report.position == position => return Some(report),
                Ok(Ok(_)) => continue,
                _ => return None,
            }
        }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        timeout(WAIT, self.task)
            .await
            .expect("engine did not stop")
            .expect("engine task panicked")
            .expect("engine returned an error");
    }
}

/// Poll `condition` until it holds or [`WAIT`] passes.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}

/// Async variant of [`eventually`].
pub async fn eventually_async<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT;
    while !condition().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}
