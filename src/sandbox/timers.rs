use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rhai::FnPtr;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A timer created by a script run, armed once the run returns.
pub(crate) struct PendingTimer {
    pub id: i64,
    pub callback: FnPtr,
    pub delay: Duration,
    pub repeat: bool,
}

/// Timers of one node. Scripts only schedule; the host arms what was
/// scheduled after each run so callbacks never overlap a run.
#[derive(Default)]
pub struct TimerRegistry {
    next_id: AtomicI64,
    pending: Mutex<Vec<PendingTimer>>,
    active: DashMap<i64, CancellationToken>,
}

impl std::fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TimerRegistry({} active)", self.active_count())
    }
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn schedule(&self, callback: FnPtr, delay_ms: i64, repeat: bool) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut delay = Duration::from_millis(delay_ms.max(0) as u64);
        if repeat {
            delay = delay.max(Duration::from_millis(1));
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(PendingTimer {
                id,
                callback,
                delay,
                repeat,
            });
        }
        id
    }

    pub(crate) fn clear(&self, id: i64) {
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        let before = pending.len();
        pending.retain(|t| t.id != id);
        if pending.len() == before {
            if let Some((_, token)) = self.active.remove(&id) {
                token.cancel();
                trace!(timer = id, "timer cleared");
            }
        }
    }

    /// Hand every scheduled timer to `start` with its own cancellation token.
    pub(crate) fn arm(&self, parent: &CancellationToken, mut start: impl FnMut(PendingTimer, CancellationToken)) {
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        for timer in pending.drain(..) {
            let token = parent.child_token();
            self.active.insert(timer.id, token.clone());
            start(timer, token);
        }
    }

    /// A one-shot timer fired.
    pub(crate) fn finish(&self, id: i64) {
        self.active.remove(&id);
    }

    /// Timers scheduled or running.
    pub fn active_count(&self) -> usize {
        self.active.len() + self.pending.lock().map(|p| p.len()).unwrap_or_default()
    }

    pub fn cancel_all(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        let ids: Vec<i64> = self.active.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, token)) = self.active.remove(&id) {
                token.cancel();
            }
        }
    }
}
