//! Margin (aggregate short P&L) aggregator.
//!
//! One task per user holding open short positions. The aggregator's index
//! (per-user handles, tracked positions, instrument interest) sits behind one
//! reader-writer lock: reads for fan-out, writes for add and remove. Each
//! user's [`ShortBook`] lives only inside that user's task.

mod task;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use self::task::{Forced, Inboxes, UserTask};
use super::watcher::DeliveryStats;
use crate::domain::{
    ClosureEvent, Instrument, Position, PositionId, PriceTick, ShortBook, UserId,
};
use crate::error::{Error, Result, WatchError};

struct UserHandle {
    id: u64,
    open: usize,
    prices: mpsc::Sender<Vec<PriceTick>>,
    adds: mpsc::Sender<(Position, Option<Decimal>)>,
    removes: mpsc::Sender<PositionId>,
    cancel: CancellationToken,
}

impl Drop for UserHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct Index {
    users: HashMap<UserId, UserHandle>,
    positions: HashMap<PositionId, (UserId, Instrument)>,
    by_instrument: HashMap<Instrument, HashMap<UserId, usize>>,
}

impl Index {
    fn track(&mut self, position: &Position) {
        self.positions.insert(
            position.id.clone(),
            (position.user.clone(), position.instrument.clone()),
        );
        *self
            .by_instrument
            .entry(position.instrument.clone())
            .or_default()
            .entry(position.user.clone())
            .or_default() += 1;
        if let Some(handle) = self.users.get_mut(&position.user) {
            handle.open += 1;
        }
    }

    /// Forget a position. When it was the user's last one the handle is
    /// removed and returned so the caller can let it drop.
    fn untrack(&mut self, id: &PositionId) -> Option<(UserId, Option<UserHandle>)> {
        let (user, instrument) = self.positions.remove(id)?;
        if let Some(users) = self.by_instrument.get_mut(&instrument) {
            if let Some(count) = users.get_mut(&user) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    users.remove(&user);
                }
            }
            if users.is_empty() {
                self.by_instrument.remove(&instrument);
            }
        }
        let last = match self.users.get_mut(&user) {
            Some(handle) => {
                handle.open = handle.open.saturating_sub(1);
                handle.open == 0
            }
            None => false,
        };
        let dropped = if last { self.users.remove(&user) } else { None };
        Some((user, dropped))
    }
}

/// Per-user aggregate P&L tracking and forced liquidation.
pub struct MarginAggregator {
    index: RwLock<Index>,
    forced_tx: mpsc::Sender<Forced>,
    forced_rx: Mutex<mpsc::Receiver<Forced>>,
    control_buffer: usize,
    next_id: AtomicU64,
}

impl MarginAggregator {
    /// `closure_buffer` bounds pending forced closures; `control_buffer`
    /// bounds each user's add and remove inboxes.
    #[must_use]
    pub fn new(closure_buffer: usize, control_buffer: usize) -> Self {
        let (forced_tx, forced_rx) = mpsc::channel(closure_buffer.max(1));
        Self {
            index: RwLock::new(Index::default()),
            forced_tx,
            forced_rx: Mutex::new(forced_rx),
            control_buffer: control_buffer.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start tracking open short positions.
    ///
    /// Users without a task get one seeded with their positions; existing
    /// tasks receive each position as an add. `prices` seeds the last price
    /// per instrument. Longs, closed and already tracked positions are
    /// skipped. Returns the number of positions accepted.
    pub async fn add_positions(
        &self,
        ctx: &CancellationToken,
        positions: Vec<Position>,
        prices: &HashMap<Instrument, PriceTick>,
    ) -> Result<usize> {
        let mut sends = Vec::new();
        let accepted = {
            let mut index = self.index.write();
            let mut fresh: HashMap<UserId, ShortBook> = HashMap::new();
            let mut seen = HashSet::new();
            let mut tracked = Vec::new();

            for position in positions {
                if !position.direction.is_short()
                    || !position.is_open()
                    || index.positions.contains_key(&position.id)
                    || !seen.insert(position.id.clone())
                {
                    continue;
                }
                let price = prices.get(&position.instrument).map(|t| t.selling_price);
                match index.users.get(&position.user) {
                    Some(handle) => {
                        sends.push((handle.id, handle.adds.clone(), position.clone(), price));
                    }
                    None => {
                        fresh
                            .entry(position.user.clone())
                            .or_default()
                            .insert(position.clone(), price);
                    }
                }
                tracked.push(position);
            }

            for (user, book) in fresh {
                let handle = self.spawn(ctx, user.clone(), book);
                index.users.insert(user, handle);
            }
            for position in &tracked {
                index.track(position);
            }
            tracked.len()
        };

        for (task, adds, position, price) in sends {
            let user = position.user.clone();
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(Error::Canceled),
                sent = adds.send((position, price)) => {
                    if sent.is_err() {
                        self.evict(&user, task);
                        let reason = format!("task for {user} stopped");
                        return Err(Error::upstream("margin", reason));
                    }
                }
            }
        }
        Ok(accepted)
    }

    /// Forget a user whose task exited on its own, along with every position
    /// it held, so the next add spawns a fresh task.
    fn evict(&self, user: &UserId, task: u64) {
        let mut index = self.index.write();
        if !index.users.get(user).is_some_and(|h| h.id == task) {
            return;
        }
        let held: Vec<PositionId> = index
            .positions
            .iter()
            .filter(|(_, (owner, _))| owner == user)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &held {
            index.untrack(id);
        }
        index.users.remove(user);
        warn!(user = %user, dropped = held.len(), "Margin task stopped, positions untracked");
    }

    fn spawn(&self, ctx: &CancellationToken, user: UserId, book: ShortBook) -> UserHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (prices_tx, prices_rx) = mpsc::channel(1);
        let (adds_tx, adds_rx) = mpsc::channel(self.control_buffer);
        let (removes_tx, removes_rx) = mpsc::channel(self.control_buffer);
        let cancel = ctx.child_token();
        let task = UserTask {
            id,
            user,
            book,
            out: self.forced_tx.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run(Inboxes {
            prices: prices_rx,
            adds: adds_rx,
            removes: removes_rx,
        }));
        UserHandle {
            id,
            open: 0,
            prices: prices_tx,
            adds: adds_tx,
            removes: removes_tx,
            cancel,
        }
    }

    /// Stop tracking a position. The user's task is torn down with its last
    /// position.
    pub async fn remove_position(&self, id: &PositionId) -> std::result::Result<(), WatchError> {
        let removes = {
            let mut index = self.index.write();
            let Some((user, dropped)) = index.untrack(id) else {
                return Err(WatchError::NotTracked {
                    position: id.clone(),
                });
            };
            if dropped.is_some() {
                debug!(user = %user, "Last short closed, margin task released");
                return Ok(());
            }
            index.users.get(&user).map(|h| h.removes.clone())
        };
        if let Some(removes) = removes {
            if removes.send(id.clone()).await.is_err() {
                debug!(position = %id, "Margin task gone before remove");
            }
        }
        Ok(())
    }

    /// Forward ticks to every user task holding a position in the tick's
    /// instrument, one batch per user. Never waits on a busy task.
    pub fn send_prices(&self, ticks: &[PriceTick]) -> DeliveryStats {
        let mut stats = DeliveryStats::default();
        let index = self.index.read();
        let mut batches: HashMap<&UserId, Vec<PriceTick>> = HashMap::new();
        for tick in ticks {
            if let Some(users) = index.by_instrument.get(&tick.instrument) {
                for user in users.keys() {
                    batches.entry(user).or_default().push(tick.clone());
                }
            }
        }
        for (user, batch) in batches {
            let Some(handle) = index.users.get(user) else {
                continue;
            };
            match handle.prices.try_send(batch) {
                Ok(()) => stats.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => stats.dropped += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        if stats.dropped > 0 {
            trace!(dropped = stats.dropped, "Margin tasks busy, batches dropped");
        }
        stats
    }

    /// Wait for the next forced liquidation.
    pub async fn closures(&self, ctx: &CancellationToken) -> Result<ClosureEvent> {
        loop {
            let forced = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(Error::Canceled),
                forced = async { self.forced_rx.lock().await.recv().await } => forced,
            };
            let forced = forced.ok_or(Error::Canceled)?;
            if self.retire(&forced) {
                return Ok(forced.event);
            }
            debug!(
                position = %forced.event.position.id,
                task = forced.task,
                "Stale margin call dropped"
            );
        }
    }

    /// Untrack the liquidated position. False when it was removed, or its
    /// task replaced, after the liquidation was queued.
    fn retire(&self, forced: &Forced) -> bool {
        let id = &forced.event.position.id;
        let mut index = self.index.write();
        let owned = index
            .positions
            .get(id)
            .and_then(|(user, _)| index.users.get(user))
            .is_some_and(|handle| handle.id == forced.task);
        if owned {
            index.untrack(id);
        }
        owned
    }

    #[must_use]
    pub fn is_tracking(&self, id: &PositionId) -> bool {
        self.index.read().positions.contains_key(id)
    }

    /// Instruments held by at least one tracked short.
    #[must_use]
    pub fn instruments(&self) -> HashSet<Instrument> {
        self.index.read().by_instrument.keys().cloned().collect()
    }

    /// Number of live user tasks.
    #[must_use]
    pub fn users(&self) -> usize {
        self.index.read().users.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::time::timeout;

    use super::*;
    use crate::domain::{CloseReason, Direction};

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(100);

    fn short(user: &str, instrument: &str, amount: Decimal, purchase: Decimal) -> Position {
        Position::open(
            UserId::from(user),
            Instrument::from(instrument),
            amount,
            Direction::Short,
            purchase,
            Utc::now(),
        )
    }

    fn quotes(ticks: &[PriceTick]) -> HashMap<Instrument, PriceTick> {
        ticks.iter().map(|t| (t.instrument.clone(), t.clone())).collect()
    }

    #[tokio::test]
    async fn price_spike_forces_exactly_one_closure() {
        let margin = MarginAggregator::new(8, 8);
        let ctx = CancellationToken::new();
        let a = short("u1", "A", dec!(100), dec!(30));
        let seed = quotes(&[PriceTick::new("A", dec!(30), dec!(30))]);
        assert_eq!(margin.add_positions(&ctx, vec![a.clone()], &seed).await.unwrap(), 1);
        assert_eq!(margin.users(), 1);

        margin.send_prices(&[PriceTick::new("A", dec!(65), dec!(66))]);
        let event = timeout(WAIT, margin.closures(&ctx)).await.unwrap().unwrap();
        assert_eq!(event.position.id, a.id);
        assert_eq!(event.reason, CloseReason::MarginCall);
        assert_eq!(event.price, dec!(65));

        assert!(!margin.is_tracking(&a.id));
        assert_eq!(margin.users(), 0);
        assert!(timeout(QUIET, margin.closures(&ctx)).await.is_err());
    }

    #[tokio::test]
    async fn longs_are_ignored() {
        let margin = MarginAggregator::new(8, 8);
        let ctx = CancellationToken::new();
        let mut long = short("u1", "A", dec!(1), dec!(1));
        long.direction = Direction::Long;
        assert_eq!(margin.add_positions(&ctx, vec![long], &HashMap::new()).await.unwrap(), 0);
        assert_eq!(margin.users(), 0);
    }

    #[tokio::test]
    async fn second_position_goes_to_existing_task() {
        let margin = MarginAggregator::new(8, 8);
        let ctx = CancellationToken::new();
        let a = short("u1", "A", dec!(10), dec!(10));
        let b = short("u1", "B", dec!(10), dec!(10));
        margin.add_positions(&ctx, vec![a.clone()], &HashMap::new()).await.unwrap();
        margin.add_positions(&ctx, vec![b.clone()], &HashMap::new()).await.unwrap();
        assert_eq!(margin.users(), 1);
        assert_eq!(margin.instruments().len(), 2);

        // A alone at 25 is -50, B at 12 is +80: covered.
        margin.send_prices(&[PriceTick::new("A", dec!(25), dec!(25)), PriceTick::new("B", dec!(12), dec!(12))]);
        assert!(timeout(QUIET, margin.closures(&ctx)).await.is_err());

        // B at 30 is -100, the larger loss.
        margin.send_prices(&[PriceTick::new("B", dec!(30), dec!(30))]);
        let first = timeout(WAIT, margin.closures(&ctx)).await.unwrap().unwrap();
        assert_eq!(first.position.id, b.id);
        // A alone is still -50.
        let second = timeout(WAIT, margin.closures(&ctx)).await.unwrap().unwrap();
        assert_eq!(second.position.id, a.id);
        assert_eq!(margin.users(), 0);
    }

    #[tokio::test]
    async fn removed_positions_are_not_liquidated() {
        let margin = MarginAggregator::new(8, 8);
        let ctx = CancellationToken::new();
        let a = short("u1", "A", dec!(10), dec!(10));
        let b = short("u1", "B", dec!(10), dec!(10));
        margin.add_positions(&ctx, vec![a.clone(), b.clone()], &HashMap::new()).await.unwrap();

        margin.remove_position(&a.id).await.unwrap();
        assert!(matches!(
            margin.remove_position(&a.id).await,
            Err(WatchError::NotTracked { .. })
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;

        margin.send_prices(&[PriceTick::new("A", dec!(100), dec!(100))]);
        assert!(timeout(QUIET, margin.closures(&ctx)).await.is_err());

        margin.remove_position(&b.id).await.unwrap();
        assert_eq!(margin.users(), 0);
        assert!(margin.instruments().is_empty());
    }

    #[tokio::test]
    async fn queued_margin_call_for_removed_position_is_dropped() {
        let margin = MarginAggregator::new(8, 8);
        let ctx = CancellationToken::new();
        let a = short("u1", "A", dec!(100), dec!(30));
        margin.add_positions(&ctx, vec![a.clone()], &HashMap::new()).await.unwrap();

        margin.send_prices(&[PriceTick::new("A", dec!(65), dec!(65))]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        margin.remove_position(&a.id).await.unwrap();

        assert!(timeout(QUIET, margin.closures(&ctx)).await.is_err());
        assert_eq!(margin.users(), 0);
    }

    #[tokio::test]
    async fn add_to_stopped_task_is_not_a_cancellation() {
        let margin = MarginAggregator::new(8, 8);
        let first = CancellationToken::new();
        let a = short("u1", "A", dec!(10), dec!(10));
        let b = short("u1", "B", dec!(10), dec!(10));
        margin.add_positions(&first, vec![a.clone()], &HashMap::new()).await.unwrap();
        first.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ctx = CancellationToken::new();
        let err = margin
            .add_positions(&ctx, vec![b.clone()], &HashMap::new())
            .await
            .unwrap_err();
        assert!(!err.is_canceled());
        assert!(err.is_upstream());
        assert!(!margin.is_tracking(&a.id));
        assert!(!margin.is_tracking(&b.id));
        assert_eq!(margin.users(), 0);

        assert_eq!(margin.add_positions(&ctx, vec![b.clone()], &HashMap::new()).await.unwrap(), 1);
        assert_eq!(margin.users(), 1);
        margin.send_prices(&[PriceTick::new("B", dec!(25), dec!(25))]);
        let event = timeout(WAIT, margin.closures(&ctx)).await.unwrap().unwrap();
        assert_eq!(event.position.id, b.id);
    }

    #[tokio::test]
    async fn seeded_loss_liquidates_on_add() {
        let margin = MarginAggregator::new(8, 8);
        let ctx = CancellationToken::new();
        let a = short("u1", "A", dec!(100), dec!(30));
        let seed = quotes(&[PriceTick::new("A", dec!(70), dec!(71))]);
        margin.add_positions(&ctx, vec![a.clone()], &seed).await.unwrap();

        let event = timeout(WAIT, margin.closures(&ctx)).await.unwrap().unwrap();
        assert_eq!(event.position.id, a.id);
        assert_eq!(event.price, dec!(70));
    }

    #[tokio::test]
    async fn cancellation_stops_closures() {
        let margin = MarginAggregator::new(8, 8);
        let ctx = CancellationToken::new();
        let a = short("u1", "A", dec!(100), dec!(30));
        margin.add_positions(&ctx, vec![a], &HashMap::new()).await.unwrap();
        ctx.cancel();
        let result = timeout(WAIT, margin.closures(&ctx)).await.unwrap();
        assert!(matches!(result, Err(Error::Canceled)));
    }
}
