//! Per-user margin task.
//!
//! Single-threaded loop over three inboxes (price batches, adds, removes).
//! All mutation of the user's [`ShortBook`] happens here.

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{
    CloseReason, ClosureEvent, Position, PositionId, PriceTick, ShortBook, UserId,
};

/// Forced-closure event tagged with the task that produced it.
#[derive(Debug)]
pub(super) struct Forced {
    pub task: u64,
    pub event: ClosureEvent,
}

pub(super) struct Inboxes {
    pub prices: mpsc::Receiver<Vec<PriceTick>>,
    pub adds: mpsc::Receiver<(Position, Option<Decimal>)>,
    pub removes: mpsc::Receiver<PositionId>,
}

pub(super) struct UserTask {
    pub id: u64,
    pub user: UserId,
    pub book: ShortBook,
    pub out: mpsc::Sender<Forced>,
    pub cancel: CancellationToken,
}

impl UserTask {
    pub(super) async fn run(mut self, mut inboxes: Inboxes) {
        debug!(user = %self.user, task = self.id, positions = self.book.len(), "Margin task started");
        if !self.rebalance().await {
            return;
        }
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                // The handle owns all three senders; any closed inbox means
                // the registry dropped this user.
                added = inboxes.adds.recv() => {
                    let Some((position, price)) = added else { break };
                    self.book.insert(position, price);
                    if !self.rebalance().await {
                        break;
                    }
                }
                id = inboxes.removes.recv() => {
                    let Some(id) = id else { break };
                    if self.book.remove(&id).is_some() {
                        debug!(user = %self.user, position = %id, "Position dropped from margin book");
                    }
                }
                batch = inboxes.prices.recv() => {
                    let Some(batch) = batch else { break };
                    let mut touched = false;
                    for tick in &batch {
                        touched |= self.book.update_price(tick);
                    }
                    if touched && !self.rebalance().await {
                        break;
                    }
                }
            }
        }
        debug!(user = %self.user, task = self.id, "Margin task stopped");
    }

    /// Liquidate until the aggregate is non-negative. Returns false when the
    /// task must stop (canceled or nobody is listening).
    async fn rebalance(&mut self) -> bool {
        let before = self.book.aggregate();
        for liquidation in self.book.liquidate() {
            warn!(
                user = %self.user,
                position = %liquidation.position.id,
                instrument = %liquidation.position.instrument,
                price = %liquidation.price,
                aggregate = %before,
                "Margin call"
            );
            let forced = Forced {
                task: self.id,
                event: ClosureEvent::new(liquidation.position, liquidation.price, CloseReason::MarginCall),
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                sent = self.out.send(forced) => {
                    if sent.is_err() {
                        return false;
                    }
                }
            }
        }
        if before < Decimal::ZERO {
            info!(user = %self.user, aggregate = %self.book.aggregate(), "Margin restored");
        }
        true
    }
}
