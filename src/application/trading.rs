//! User-facing position operations.
//!
//! Opening debits the entry cost in the same transaction that creates the
//! row. Threshold edits and manual closes go through the store and the
//! settler; the engine picks the resulting change events up from the feed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;

use super::settlement::{bounded, Journal, SettlementOutcome, Settler};
use crate::domain::{CloseReason, Direction, Instrument, Leg, Position, PositionId, UserId};
use crate::error::{Error, Result, StoreError};
use crate::port::{within_transaction, PaymentService, PositionStore, PriceService, Transactor};

pub struct TradingService {
    store: Arc<dyn PositionStore>,
    prices: Arc<dyn PriceService>,
    payments: Arc<dyn PaymentService>,
    transactor: Arc<dyn Transactor>,
    settler: Arc<Settler>,
    call_timeout: Duration,
}

impl TradingService {
    pub fn new(
        store: Arc<dyn PositionStore>,
        prices: Arc<dyn PriceService>,
        payments: Arc<dyn PaymentService>,
        transactor: Arc<dyn Transactor>,
        settler: Arc<Settler>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            prices,
            payments,
            transactor,
            settler,
            call_timeout,
        }
    }

    /// Open a position at the current ask and debit `amount × ask` from the
    /// owner: principal for a long, collateral for a short.
    pub async fn open_position(
        &self,
        user: UserId,
        instrument: Instrument,
        amount: Decimal,
        direction: Direction,
    ) -> Result<Position> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(amount));
        }
        let quotes = bounded(
            self.call_timeout,
            "current_prices",
            self.prices.current_prices(std::slice::from_ref(&instrument)),
        )
        .await?;
        let ask = quotes
            .get(&instrument)
            .map(|tick| tick.purchase_price)
            .ok_or_else(|| Error::MissingPrice(instrument.clone()))?;

        let position = Position::open(user, instrument, amount, direction, ask, Utc::now());
        let cost = position.entry_cost().ok_or(Error::Overflow("entry cost"))?;
        let payments = Arc::clone(&self.payments);
        let journal = Journal::default();
        let recorder = journal.clone();
        let limit = self.call_timeout;

        let result = within_transaction(self.transactor.as_ref(), move |tx| {
            Box::pin(async move {
                let created = bounded(limit, "create", tx.create(position)).await?;
                if cost > Decimal::ZERO {
                    let account =
                        bounded(limit, "account_id", payments.account_id(&created.user)).await?;
                    bounded(limit, "payment", payments.decrease(&account, cost)).await?;
                    recorder.record(&account, Leg::Debit(cost));
                }
                Ok::<_, Error>(created)
            })
        })
        .await;

        match result {
            Ok(position) => {
                info!(
                    position = %position.id,
                    user = %position.user,
                    instrument = %position.instrument,
                    direction = %position.direction,
                    amount = %position.amount,
                    price = %position.purchase_price,
                    "Position opened"
                );
                Ok(position)
            }
            Err(e) => {
                journal.compensate(self.payments.as_ref(), self.call_timeout).await;
                Err(e)
            }
        }
    }

    pub async fn set_stop_loss(&self, id: &PositionId, value: Decimal) -> Result<Position> {
        if value <= Decimal::ZERO {
            return Err(Error::InvalidThreshold(value));
        }
        self.store.set_stop_loss(id, Some(value), Utc::now()).await
    }

    pub async fn set_take_profit(&self, id: &PositionId, value: Decimal) -> Result<Position> {
        if value <= Decimal::ZERO {
            return Err(Error::InvalidThreshold(value));
        }
        self.store.set_take_profit(id, Some(value), Utc::now()).await
    }

    /// Close at the current bid. Fails with `AlreadyClosed` if any other
    /// path got there first.
    pub async fn close_position(&self, id: &PositionId) -> Result<Position> {
        let position = self.store.get_by_id(id).await?;
        if !position.is_open() {
            return Err(StoreError::AlreadyClosed(id.clone()).into());
        }
        match self.settler.close(&position, CloseReason::Manual).await? {
            SettlementOutcome::Settled { position, .. } => Ok(position),
            SettlementOutcome::AlreadyClosed => Err(StoreError::AlreadyClosed(id.clone()).into()),
        }
    }

    pub async fn get_position(&self, id: &PositionId) -> Result<Position> {
        self.store.get_by_id(id).await
    }

    pub async fn get_user_positions(&self, user: &UserId) -> Result<Vec<Position>> {
        self.store.get_by_user(user).await
    }
}
