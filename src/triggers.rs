//! Out-of-band pass requests from RPC handlers.
//!
//! Handlers never run a pass themselves; they submit a [`Trigger`] and return.
//! Each trigger kind has one pending slot, so a burst of one kind folds into a
//! single pass and can never crowd out another kind. A single drain task runs
//! the pending passes one at a time on the blocking pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Reconcile,
    RouteMessages,
}

impl Trigger {
    /// Drain order within one wake-up.
    pub const ALL: [Trigger; 2] = [Trigger::Reconcile, Trigger::RouteMessages];

    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Reconcile => "reconcile",
            Trigger::RouteMessages => "route_messages",
        }
    }

    fn slot(self) -> usize {
        match self {
            Trigger::Reconcile => 0,
            Trigger::RouteMessages => 1,
        }
    }
}

/// Runs one pass for a trigger. Called from a blocking thread.
pub trait PassRunner: Send + Sync + 'static {
    fn run(&self, trigger: Trigger);
}

#[derive(Debug, Default)]
struct Shared {
    pending: [AtomicBool; 2],
    wake: Notify,
    senders: AtomicUsize,
    closed: AtomicBool,
}

#[derive(Debug)]
pub struct TriggerQueue {
    shared: Arc<Shared>,
}

/// The drain side of a [`TriggerQueue`].
#[derive(Debug)]
pub struct TriggerReceiver {
    shared: Arc<Shared>,
}

impl TriggerQueue {
    pub fn new() -> (Self, TriggerReceiver) {
        let shared = Arc::new(Shared::default());
        shared.senders.store(1, Ordering::SeqCst);
        (
            Self {
                shared: shared.clone(),
            },
            TriggerReceiver { shared },
        )
    }

    /// Never blocks. Returns false only when the drain side is gone; a kind
    /// that is already pending is folded into the queued pass.
    pub fn submit(&self, trigger: Trigger) -> bool {
        if self.shared.closed.load(Ordering::SeqCst) {
            debug!(target = "fleetd::triggers", trigger = trigger.as_str(), "trigger queue closed");
            return false;
        }
        if self.shared.pending[trigger.slot()].swap(true, Ordering::SeqCst) {
            debug!(target = "fleetd::triggers", trigger = trigger.as_str(), "pass already pending; coalesced");
        } else {
            self.shared.wake.notify_one();
        }
        true
    }
}

impl Clone for TriggerQueue {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for TriggerQueue {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.wake.notify_one();
        }
    }
}

impl TriggerReceiver {
    /// Clear and return every pending kind, in [`Trigger::ALL`] order.
    pub fn take_pending(&self) -> Vec<Trigger> {
        Trigger::ALL
            .into_iter()
            .filter(|t| self.shared.pending[t.slot()].swap(false, Ordering::SeqCst))
            .collect()
    }

    fn has_senders(&self) -> bool {
        self.shared.senders.load(Ordering::SeqCst) > 0
    }
}

impl Drop for TriggerReceiver {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

/// Drain until shutdown, or until every queue handle is gone and nothing is pending.
pub async fn drain(
    rx: TriggerReceiver,
    runner: Arc<dyn PassRunner>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let batch = rx.take_pending();
        if batch.is_empty() {
            if !rx.has_senders() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = rx.shared.wake.notified() => {}
            }
            continue;
        }

        for trigger in batch {
            debug!(target = "fleetd::triggers", trigger = trigger.as_str(), "running triggered pass");
            let runner = runner.clone();
            if let Err(error) = tokio::task::spawn_blocking(move || runner.run(trigger)).await {
                warn!(target = "fleetd::triggers", trigger = trigger.as_str(), error = %error, "triggered pass panicked");
            }
        }
    }
    debug!(target = "fleetd::triggers", "trigger drain stopped");
}
