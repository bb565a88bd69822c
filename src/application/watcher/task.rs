//! Per-watcher task.

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::{ClosureEvent, Position, PriceTick, WatchKind};

/// Closure event tagged with the watcher that produced it.
#[derive(Debug)]
pub(super) struct Trigger {
    pub watcher: u64,
    pub kind: WatchKind,
    pub event: ClosureEvent,
}

pub(super) struct Watcher {
    pub id: u64,
    pub kind: WatchKind,
    pub threshold: Decimal,
    pub position: Position,
}

enum State {
    Armed,
    Triggered(PriceTick),
}

/// Read ticks until one crosses the threshold, push exactly one trigger,
/// then exit. Exits silently on cancellation or when the tick channel closes.
pub(super) async fn run(
    watcher: Watcher,
    mut ticks: mpsc::Receiver<PriceTick>,
    triggers: mpsc::Sender<Trigger>,
    cancel: CancellationToken,
) {
    let mut state = State::Armed;
    while let State::Armed = state {
        let tick = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            tick = ticks.recv() => match tick {
                Some(tick) => tick,
                None => return,
            },
        };
        if watcher
            .kind
            .fires(watcher.position.direction, watcher.threshold, tick.selling_price)
        {
            state = State::Triggered(tick);
        }
    }

    let State::Triggered(tick) = state else {
        return;
    };
    // Further ticks are never read; the channel is closed when the registry
    // retires this watcher.
    drop(ticks);

    info!(
        position = %watcher.position.id,
        instrument = %watcher.position.instrument,
        kind = %watcher.kind,
        threshold = %watcher.threshold,
        price = %tick.selling_price,
        "Threshold crossed"
    );
    let trigger = Trigger {
        watcher: watcher.id,
        kind: watcher.kind,
        event: ClosureEvent::new(watcher.position, tick.selling_price, watcher.kind.into()),
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(watcher = watcher.id, "Canceled before trigger was delivered");
        }
        sent = triggers.send(trigger) => {
            if sent.is_err() {
                debug!(watcher = watcher.id, "Trigger channel closed");
            }
        }
    }
}
