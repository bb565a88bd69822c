//! Settlement orchestrator.
//!
//! Each closure event walks Received → Repriced → Persisted → Settled, or
//! stops at Failed. The storage close and every payment leg run inside one
//! transaction; legs already issued when a later step fails are reversed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::domain::{CloseReason, ClosureEvent, Leg, Position, Transfer};
use crate::error::{Error, Result, StoreError};
use crate::port::{within_transaction, PaymentService, PriceService, Transactor};

/// Result of a settlement attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Settled {
        position: Position,
        price: Decimal,
        transfer: Transfer,
    },
    /// Another path closed the position first.
    AlreadyClosed,
}

/// Await `fut` for at most `limit`.
pub(crate) async fn bounded<T, F>(limit: Duration, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout { operation })?
}

/// Payment legs issued so far inside one transaction.
#[derive(Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<(String, Leg)>>>);

impl Journal {
    pub(crate) fn record(&self, account: &str, leg: Leg) {
        self.0.lock().push((account.to_string(), leg));
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Reverse every recorded leg, newest first. Failures are logged.
    pub(crate) async fn compensate(&self, payments: &dyn PaymentService, limit: Duration) {
        let legs = std::mem::take(&mut *self.0.lock());
        for (account, leg) in legs.into_iter().rev() {
            let undo = leg.reversed();
            match bounded(limit, "compensation", payments.apply(&account, undo)).await {
                Ok(()) => debug!(account = %account, leg = ?undo, "Payment leg reversed"),
                Err(e) => error!(account = %account, leg = ?undo, error = %e, "Compensation failed"),
            }
        }
    }
}

/// Closes positions against storage and the payment service.
pub struct Settler {
    prices: Arc<dyn PriceService>,
    payments: Arc<dyn PaymentService>,
    transactor: Arc<dyn Transactor>,
    call_timeout: Duration,
}

impl Settler {
    pub fn new(
        prices: Arc<dyn PriceService>,
        payments: Arc<dyn PaymentService>,
        transactor: Arc<dyn Transactor>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            prices,
            payments,
            transactor,
            call_timeout,
        }
    }

    /// Settle one closure event.
    ///
    /// The event's position snapshot only names the row: state is re-read
    /// inside the transaction. Losing the close race is
    /// [`SettlementOutcome::AlreadyClosed`], not an error.
    pub async fn settle(&self, event: &ClosureEvent) -> Result<SettlementOutcome> {
        debug!(
            position = %event.position.id,
            reason = %event.reason,
            trigger_price = %event.price,
            "Settling"
        );
        self.close(&event.position, event.reason).await
    }

    /// Reprice, then close and pay out `position` in one transaction.
    pub async fn close(&self, position: &Position, reason: CloseReason) -> Result<SettlementOutcome> {
        let instrument = position.instrument.clone();
        let quotes = bounded(
            self.call_timeout,
            "current_prices",
            self.prices.current_prices(std::slice::from_ref(&instrument)),
        )
        .await?;
        let price = quotes
            .get(&instrument)
            .map(|tick| tick.selling_price)
            .ok_or(Error::MissingPrice(instrument))?;

        let id = position.id.clone();
        let payments = Arc::clone(&self.payments);
        let journal = Journal::default();
        let recorder = journal.clone();
        let limit = self.call_timeout;

        let result = within_transaction(self.transactor.as_ref(), move |tx| {
            Box::pin(async move {
                let current = bounded(limit, "get_by_id", tx.get_by_id(&id)).await?;
                if !current.is_open() {
                    return Err(Error::from(StoreError::AlreadyClosed(id)));
                }
                let now = Utc::now();
                let closed =
                    bounded(limit, "close_if_open", tx.close_if_open(&id, now, price, now)).await?;

                let transfer =
                    Transfer::plan(&closed, price).ok_or(Error::Overflow("settlement transfer"))?;
                if !transfer.legs().is_empty() {
                    let account =
                        bounded(limit, "account_id", payments.account_id(&closed.user)).await?;
                    for &leg in transfer.legs() {
                        bounded(limit, "payment", payments.apply(&account, leg)).await?;
                        recorder.record(&account, leg);
                    }
                }
                Ok::<_, Error>((closed, transfer))
            })
        })
        .await;

        match result {
            Ok((position, transfer)) => {
                info!(
                    position = %position.id,
                    user = %position.user,
                    direction = %position.direction,
                    %reason,
                    price = %price,
                    net = %transfer.net(),
                    "Position settled"
                );
                Ok(SettlementOutcome::Settled {
                    position,
                    price,
                    transfer,
                })
            }
            Err(e) => {
                if journal.len() > 0 {
                    journal.compensate(self.payments.as_ref(), self.call_timeout).await;
                }
                if e.is_already_closed() {
                    debug!(position = %position.id, "Already closed by a concurrent path");
                    Ok(SettlementOutcome::AlreadyClosed)
                } else {
                    Err(e)
                }
            }
        }
    }
}
