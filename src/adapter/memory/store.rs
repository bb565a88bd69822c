//! In-memory position store.
//!
//! Rows live in one map behind an async mutex. A transaction holds that
//! mutex from `begin` until commit or rollback, so transactions are
//! serializable against each other and against the plain store calls.
//! Change events are published in commit order, only after commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{ChangeEvent, ChangeKind, Position, PositionId, UserId, WatchKind};
use crate::error::{Error, Result, StoreError};
use crate::port::{PositionStore, StoreTransaction, Transactor};

type Rows = HashMap<PositionId, Position>;

pub struct MemoryPositionStore {
    rows: Arc<Mutex<Rows>>,
    events_tx: mpsc::UnboundedSender<ChangeEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<ChangeEvent>>,
    fail_commit: AtomicBool,
}

impl MemoryPositionStore {
    #[must_use]
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            rows: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            events_rx: Mutex::new(events_rx),
            fail_commit: AtomicBool::new(false),
        }
    }

    /// Make the next transaction commit fail. Used to exercise rollback.
    pub fn fail_next_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    /// Number of rows, open or closed.
    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    fn publish(&self, kind: ChangeKind, position: &Position) {
        // The receiver lives as long as the store.
        let _ = self.events_tx.send(ChangeEvent::new(kind, position.clone()));
    }

    async fn set_threshold(
        &self,
        id: &PositionId,
        kind: WatchKind,
        value: Option<Decimal>,
        updated: DateTime<Utc>,
    ) -> Result<Position> {
        let mut rows = self.rows.lock().await;
        let position = rows
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if !position.is_open() {
            return Err(StoreError::AlreadyClosed(id.clone()).into());
        }
        position.set_threshold(kind, value);
        position.updated = updated;
        let position = position.clone();
        let change = match kind {
            WatchKind::StopLoss => ChangeKind::StopLossSet,
            WatchKind::TakeProfit => ChangeKind::TakeProfitSet,
        };
        self.publish(change, &position);
        Ok(position)
    }
}

impl Default for MemoryPositionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn close_row(
    row: &Position,
    closed: DateTime<Utc>,
    selling_price: Decimal,
    updated: DateTime<Utc>,
) -> Result<Position> {
    if !row.is_open() {
        return Err(StoreError::AlreadyClosed(row.id.clone()).into());
    }
    let mut row = row.clone();
    row.closed = Some(closed);
    row.closing_price = Some(selling_price);
    row.updated = updated;
    Ok(row)
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn create(&self, position: Position) -> Result<Position> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&position.id) {
            return Err(StoreError::DuplicateId(position.id).into());
        }
        rows.insert(position.id.clone(), position.clone());
        self.publish(ChangeKind::Created, &position);
        Ok(position)
    }

    async fn get_by_id(&self, id: &PositionId) -> Result<Position> {
        let rows = self.rows.lock().await;
        rows.get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()).into())
    }

    async fn get_by_user(&self, user: &UserId) -> Result<Vec<Position>> {
        let rows = self.rows.lock().await;
        let mut positions: Vec<Position> = rows
            .values()
            .filter(|p| &p.user == user)
            .cloned()
            .collect();
        positions.sort_by(|a, b| b.opened.cmp(&a.opened).then_with(|| a.id.cmp(&b.id)));
        Ok(positions)
    }

    async fn set_stop_loss(
        &self,
        id: &PositionId,
        value: Option<Decimal>,
        updated: DateTime<Utc>,
    ) -> Result<Position> {
        self.set_threshold(id, WatchKind::StopLoss, value, updated).await
    }

    async fn set_take_profit(
        &self,
        id: &PositionId,
        value: Option<Decimal>,
        updated: DateTime<Utc>,
    ) -> Result<Position> {
        self.set_threshold(id, WatchKind::TakeProfit, value, updated).await
    }

    async fn close_if_open(
        &self,
        id: &PositionId,
        closed: DateTime<Utc>,
        selling_price: Decimal,
        updated: DateTime<Utc>,
    ) -> Result<Position> {
        let mut rows = self.rows.lock().await;
        let row = rows.get(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let row = close_row(row, closed, selling_price, updated)?;
        rows.insert(id.clone(), row.clone());
        self.publish(ChangeKind::Closed, &row);
        Ok(row)
    }

    async fn next_change_event(&self, cancel: &CancellationToken) -> Result<ChangeEvent> {
        let mut events = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Canceled),
            events = self.events_rx.lock() => events,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Canceled),
            event = events.recv() => event.ok_or_else(|| Error::upstream("store", "change feed closed")),
        }
    }
}

#[async_trait]
impl Transactor for MemoryPositionStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let rows = Arc::clone(&self.rows).lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            rows,
            staged: HashMap::new(),
            events: Vec::new(),
            events_tx: self.events_tx.clone(),
            fail_commit: self.fail_commit.swap(false, Ordering::SeqCst),
        }))
    }
}

struct MemoryTransaction {
    rows: OwnedMutexGuard<Rows>,
    staged: Rows,
    events: Vec<ChangeEvent>,
    events_tx: mpsc::UnboundedSender<ChangeEvent>,
    fail_commit: bool,
}

impl MemoryTransaction {
    fn current(&self, id: &PositionId) -> Result<&Position> {
        self.staged
            .get(id)
            .or_else(|| self.rows.get(id))
            .ok_or_else(|| StoreError::NotFound(id.clone()).into())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn create(&mut self, position: Position) -> Result<Position> {
        if self.current(&position.id).is_ok() {
            return Err(StoreError::DuplicateId(position.id).into());
        }
        self.staged.insert(position.id.clone(), position.clone());
        self.events
            .push(ChangeEvent::new(ChangeKind::Created, position.clone()));
        Ok(position)
    }

    async fn get_by_id(&mut self, id: &PositionId) -> Result<Position> {
        self.current(id).cloned()
    }

    async fn close_if_open(
        &mut self,
        id: &PositionId,
        closed: DateTime<Utc>,
        selling_price: Decimal,
        updated: DateTime<Utc>,
    ) -> Result<Position> {
        let row = close_row(self.current(id)?, closed, selling_price, updated)?;
        self.staged.insert(id.clone(), row.clone());
        self.events.push(ChangeEvent::new(ChangeKind::Closed, row.clone()));
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        if this.fail_commit {
            debug!(staged = this.staged.len(), "Commit rejected");
            return Err(Error::upstream("store", "commit rejected"));
        }
        this.rows.extend(this.staged.drain());
        for event in this.events.drain(..) {
            let _ = this.events_tx.send(event);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!(staged = self.staged.len(), "Transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::{Direction, Instrument};
    use crate::port::within_transaction;

    fn position() -> Position {
        Position::open(
            UserId::from("u1"),
            Instrument::from("BTC"),
            dec!(1),
            Direction::Long,
            dec!(100),
            Utc::now(),
        )
    }

    async fn next(store: &MemoryPositionStore) -> ChangeEvent {
        store.next_change_event(&CancellationToken::new()).await.unwrap()
    }

    #[tokio::test]
    async fn create_publishes_and_rejects_duplicates() {
        let store = MemoryPositionStore::new();
        let p = store.create(position()).await.unwrap();
        assert_eq!(next(&store).await.kind, ChangeKind::Created);
        let err = store.create(p.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::DuplicateId(_))));
    }

    #[tokio::test]
    async fn close_if_open_is_at_most_once() {
        let store = MemoryPositionStore::new();
        let p = store.create(position()).await.unwrap();
        let now = Utc::now();
        let closed = store.close_if_open(&p.id, now, dec!(110), now).await.unwrap();
        assert_eq!(closed.closing_price, Some(dec!(110)));
        let again = store.close_if_open(&p.id, now, dec!(120), now).await.unwrap_err();
        assert!(again.is_already_closed());
        let err = store.set_stop_loss(&p.id, Some(dec!(1)), now).await.unwrap_err();
        assert!(err.is_already_closed());
    }

    #[tokio::test]
    async fn missing_rows_are_not_found() {
        let store = MemoryPositionStore::new();
        let id = PositionId::from("nope");
        let err = store.set_take_profit(&id, Some(dec!(1)), Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn transaction_publishes_only_on_commit() {
        let store = MemoryPositionStore::new();
        let p = position();

        let staged = p.clone();
        let failed: Result<()> = within_transaction(&store, move |tx| {
            Box::pin(async move {
                tx.create(staged).await?;
                Err::<(), _>(Error::upstream("payments", "down"))
            })
        })
        .await;
        assert!(failed.is_err());
        assert!(store.is_empty().await);

        let staged = p.clone();
        let created = within_transaction(&store, move |tx| Box::pin(async move { tx.create(staged).await }))
            .await
            .unwrap();
        assert_eq!(created.id, p.id);
        assert_eq!(next(&store).await.kind, ChangeKind::Created);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn injected_commit_failure_leaves_rows_untouched() {
        let store = MemoryPositionStore::new();
        let p = store.create(position()).await.unwrap();
        let _ = next(&store).await;
        store.fail_next_commit();

        let id = p.id.clone();
        let result = within_transaction(&store, move |tx| {
            Box::pin(async move {
                let now = Utc::now();
                tx.close_if_open(&id, now, dec!(1), now).await
            })
        })
        .await;
        assert!(result.is_err());
        assert!(store.get_by_id(&p.id).await.unwrap().is_open());
    }

    #[tokio::test]
    async fn change_feed_wait_is_cancellable() {
        let store = MemoryPositionStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = store.next_change_event(&cancel).await.unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn user_positions_newest_first() {
        let store = MemoryPositionStore::new();
        let mut older = position();
        older.opened = Utc::now() - chrono::Duration::seconds(10);
        let newer = position();
        store.create(older.clone()).await.unwrap();
        store.create(newer.clone()).await.unwrap();
        let listed = store.get_by_user(&UserId::from("u1")).await.unwrap();
        assert_eq!(listed.iter().map(|p| p.id.clone()).collect::<Vec<_>>(), vec![newer.id, older.id]);
    }
}
