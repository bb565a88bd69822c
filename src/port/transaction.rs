//! Storage transaction boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use rust_decimal::Decimal;
use tracing::warn;

use crate::domain::{Position, PositionId};
use crate::error::Result;

/// Opens storage transactions.
#[async_trait]
pub trait Transactor: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// Position operations scoped to one open transaction.
///
/// Nothing is visible to other readers, nor published on the change feed,
/// until [`commit`](StoreTransaction::commit).
#[async_trait]
pub trait StoreTransaction: Send {
    async fn create(&mut self, position: Position) -> Result<Position>;

    async fn get_by_id(&mut self, id: &PositionId) -> Result<Position>;

    async fn close_if_open(
        &mut self,
        id: &PositionId,
        closed: DateTime<Utc>,
        selling_price: Decimal,
        updated: DateTime<Utc>,
    ) -> Result<Position>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
///
/// The closure must own everything it captures besides the transaction.
pub async fn within_transaction<T, F>(transactor: &dyn Transactor, f: F) -> Result<T>
where
    T: Send + 'static,
    F: for<'t> FnOnce(&'t mut dyn StoreTransaction) -> BoxFuture<'t, Result<T>> + Send,
{
    let mut tx = transactor.begin().await?;
    let outcome = f(tx.as_mut()).await;
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}
