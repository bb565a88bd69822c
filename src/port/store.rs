//! Position store port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use crate::domain::{ChangeEvent, Position, PositionId, UserId};
use crate::error::Result;

/// Storage for position rows.
///
/// # Implementation Notes
///
/// - Threshold setters and `close_if_open` only touch open rows.
/// - `close_if_open` is the at-most-once close guard: it fails with
///   `StoreError::AlreadyClosed` when the row already has a close timestamp.
/// - Every committed create, threshold change and close is published on the
///   change feed, in commit order.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Insert a new row. Fails with `DuplicateId` if the id exists.
    async fn create(&self, position: Position) -> Result<Position>;

    async fn get_by_id(&self, id: &PositionId) -> Result<Position>;

    /// All positions of a user, open and closed, newest first.
    async fn get_by_user(&self, user: &UserId) -> Result<Vec<Position>>;

    async fn set_stop_loss(
        &self,
        id: &PositionId,
        value: Option<Decimal>,
        updated: DateTime<Utc>,
    ) -> Result<Position>;

    async fn set_take_profit(
        &self,
        id: &PositionId,
        value: Option<Decimal>,
        updated: DateTime<Utc>,
    ) -> Result<Position>;

    /// Mark a row closed unless it already is.
    async fn close_if_open(
        &self,
        id: &PositionId,
        closed: DateTime<Utc>,
        selling_price: Decimal,
        updated: DateTime<Utc>,
    ) -> Result<Position>;

    /// Block until the next change-feed notification or cancellation.
    async fn next_change_event(&self, cancel: &CancellationToken) -> Result<ChangeEvent>;
}
