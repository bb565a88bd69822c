//! Threshold watcher registry.
//!
//! One task per `(instrument, position, kind)` guards a stop-loss or
//! take-profit. The registry owns the only map of live watchers; callers
//! never see it. Each entry is a [`WatcherHandle`]: the task's tick channel
//! (capacity 1) plus its cancellation token. Dropping the handle closes the
//! channel and cancels the task.
//!
//! A watcher that fires pushes one trigger onto the shared closure channel
//! and exits. [`ThresholdRegistry::closures`] pulls triggers and retires the
//! matching handle, so a watcher is removed exactly once: by `unwatch` or by
//! its own trigger.

mod task;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use self::task::{Trigger, Watcher};
use crate::domain::{ClosureEvent, Instrument, Position, PositionId, PriceTick, WatchKind};
use crate::error::{Error, Result, WatchError};

type WatchKey = (PositionId, WatchKind);

struct WatcherHandle {
    id: u64,
    ticks: mpsc::Sender<PriceTick>,
    cancel: CancellationToken,
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Outcome of one fan-out pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: usize,
    /// Ticks skipped because the destination still held an unread tick.
    pub dropped: usize,
}

/// Registry of stop-loss and take-profit watchers.
pub struct ThresholdRegistry {
    watchers: RwLock<HashMap<Instrument, HashMap<WatchKey, WatcherHandle>>>,
    triggers_tx: mpsc::Sender<Trigger>,
    triggers_rx: Mutex<mpsc::Receiver<Trigger>>,
    next_id: AtomicU64,
}

impl ThresholdRegistry {
    /// Create a registry whose closure channel holds `closure_buffer` events.
    #[must_use]
    pub fn new(closure_buffer: usize) -> Self {
        let (triggers_tx, triggers_rx) = mpsc::channel(closure_buffer.max(1));
        Self {
            watchers: RwLock::new(HashMap::new()),
            triggers_tx,
            triggers_rx: Mutex::new(triggers_rx),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a watcher for every threshold set on `position`.
    ///
    /// All-or-nothing: if any kind is already watched nothing is registered.
    /// Returns the number of watchers started.
    pub fn watch(
        &self,
        ctx: &CancellationToken,
        position: &Position,
    ) -> std::result::Result<usize, WatchError> {
        if !position.is_open() {
            return Ok(0);
        }
        let kinds: Vec<WatchKind> = WatchKind::ALL
            .into_iter()
            .filter(|kind| position.threshold(*kind).is_some())
            .collect();

        let mut watchers = self.watchers.write();
        let slot = watchers.entry(position.instrument.clone()).or_default();
        if let Some(kind) = kinds
            .iter()
            .find(|kind| slot.contains_key(&(position.id.clone(), **kind)))
        {
            return Err(WatchError::AlreadyWatching {
                instrument: position.instrument.clone(),
                position: position.id.clone(),
                kind: *kind,
            });
        }
        for kind in &kinds {
            if let Some(handle) = self.spawn(ctx, position, *kind) {
                slot.insert((position.id.clone(), *kind), handle);
            }
        }
        if slot.is_empty() {
            watchers.remove(&position.instrument);
        }
        Ok(kinds.len())
    }

    /// Register a single watcher of `kind`. A position without that threshold
    /// is not watched and `Ok(false)` is returned.
    pub fn watch_kind(
        &self,
        ctx: &CancellationToken,
        position: &Position,
        kind: WatchKind,
    ) -> std::result::Result<bool, WatchError> {
        if !position.is_open() || position.threshold(kind).is_none() {
            return Ok(false);
        }
        let mut watchers = self.watchers.write();
        let slot = watchers.entry(position.instrument.clone()).or_default();
        let key = (position.id.clone(), kind);
        if slot.contains_key(&key) {
            return Err(WatchError::AlreadyWatching {
                instrument: position.instrument.clone(),
                position: position.id.clone(),
                kind,
            });
        }
        match self.spawn(ctx, position, kind) {
            Some(handle) => {
                slot.insert(key, handle);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn spawn(
        &self,
        ctx: &CancellationToken,
        position: &Position,
        kind: WatchKind,
    ) -> Option<WatcherHandle> {
        let threshold = position.threshold(kind)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (ticks_tx, ticks_rx) = mpsc::channel(1);
        let cancel = ctx.child_token();
        let watcher = Watcher {
            id,
            kind,
            threshold,
            position: position.clone(),
        };
        tokio::spawn(task::run(
            watcher,
            ticks_rx,
            self.triggers_tx.clone(),
            cancel.clone(),
        ));
        debug!(
            watcher = id,
            position = %position.id,
            instrument = %position.instrument,
            %kind,
            %threshold,
            "Watcher armed"
        );
        Some(WatcherHandle {
            id,
            ticks: ticks_tx,
            cancel,
        })
    }

    /// Remove and terminate the watcher of `kind` for `position`.
    pub fn unwatch(
        &self,
        position: &Position,
        kind: WatchKind,
    ) -> std::result::Result<(), WatchError> {
        let removed = {
            let mut watchers = self.watchers.write();
            let removed = watchers
                .get_mut(&position.instrument)
                .and_then(|slot| slot.remove(&(position.id.clone(), kind)));
            if watchers
                .get(&position.instrument)
                .is_some_and(HashMap::is_empty)
            {
                watchers.remove(&position.instrument);
            }
            removed
        };
        match removed {
            Some(handle) => {
                debug!(watcher = handle.id, position = %position.id, %kind, "Watcher removed");
                Ok(())
            }
            None => Err(WatchError::NotWatching {
                instrument: position.instrument.clone(),
                position: position.id.clone(),
                kind,
            }),
        }
    }

    /// Forward each tick to every watcher of its instrument.
    ///
    /// Never waits: a watcher that has not consumed its previous tick misses
    /// this one.
    pub fn deliver(&self, ticks: &[PriceTick]) -> DeliveryStats {
        let mut stats = DeliveryStats::default();
        let watchers = self.watchers.read();
        for tick in ticks {
            let Some(slot) = watchers.get(&tick.instrument) else {
                continue;
            };
            for handle in slot.values() {
                match handle.ticks.try_send(tick.clone()) {
                    Ok(()) => stats.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => stats.dropped += 1,
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
        if stats.dropped > 0 {
            trace!(dropped = stats.dropped, "Watchers busy, ticks dropped");
        }
        stats
    }

    /// Wait for the next watcher trigger.
    ///
    /// Triggers from watchers that were unwatched or replaced after firing
    /// are dropped. Returns `Error::Canceled` as soon as `ctx` is canceled,
    /// including on every call after that.
    pub async fn closures(&self, ctx: &CancellationToken) -> Result<ClosureEvent> {
        loop {
            let trigger = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(Error::Canceled),
                trigger = async { self.triggers_rx.lock().await.recv().await } => trigger,
            };
            let trigger = trigger.ok_or(Error::Canceled)?;
            if self.retire(&trigger) {
                return Ok(trigger.event);
            }
            debug!(
                position = %trigger.event.position.id,
                kind = %trigger.kind,
                watcher = trigger.watcher,
                "Stale trigger dropped"
            );
        }
    }

    /// Remove the watcher that produced `trigger`. False when it was already
    /// unwatched or replaced.
    fn retire(&self, trigger: &Trigger) -> bool {
        let position = &trigger.event.position;
        let mut watchers = self.watchers.write();
        let Some(slot) = watchers.get_mut(&position.instrument) else {
            return false;
        };
        let key = (position.id.clone(), trigger.kind);
        let owned = slot.get(&key).is_some_and(|h| h.id == trigger.watcher);
        if owned {
            slot.remove(&key);
        }
        if slot.is_empty() {
            watchers.remove(&position.instrument);
        }
        owned
    }

    #[must_use]
    pub fn is_watching(&self, position: &Position, kind: WatchKind) -> bool {
        self.watchers
            .read()
            .get(&position.instrument)
            .is_some_and(|slot| slot.contains_key(&(position.id.clone(), kind)))
    }

    /// Instruments with at least one live watcher.
    #[must_use]
    pub fn instruments(&self) -> HashSet<Instrument> {
        self.watchers.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.watchers.read().values().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
