use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CancelReason, UplinkError};
use crate::message::GwMessage;

/// Terminal outcome delivered to the waiter of an outstanding request.
#[derive(Debug)]
pub(crate) enum ContextOutcome {
    Fulfilled(GwMessage),
    TimedOut,
    Cancelled(CancelReason),
}

#[derive(Debug)]
struct PoolEntry {
    deadline: Instant,
    waiter: oneshot::Sender<ContextOutcome>,
}

/// Bounded registry of in-flight requests, keyed by correlation id.
///
/// Exactly one of `fulfill`, `reap` and `cancel_all` delivers to a given
/// waiter; whichever removes the entry first wins the race.
#[derive(Debug)]
pub(crate) struct ContextPool {
    capacity: usize,
    resend_timeout: Duration,
    entries: Mutex<HashMap<Uuid, PoolEntry>>,
}

impl ContextPool {
    pub(crate) fn new(capacity: usize, resend_timeout: Duration) -> Self {
        Self {
            capacity,
            resend_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a correlation id and returns the channel its outcome
    /// arrives on. The entry expires `resend_timeout` from now.
    pub(crate) fn register(
        &self,
        correlation_id: Uuid,
    ) -> Result<oneshot::Receiver<ContextOutcome>, UplinkError> {
        let (waiter, outcome) = oneshot::channel();
        let entry = PoolEntry {
            deadline: Instant::now() + self.resend_timeout,
            waiter,
        };

        let mut entries = self.entries.lock().expect("context pool lock poisoned");
        if entries.len() >= self.capacity && !entries.contains_key(&correlation_id) {
            return Err(UplinkError::Capacity {
                capacity: self.capacity,
            });
        }
        if let Some(stale) = entries.insert(correlation_id, entry) {
            // Correlation ids are random per session; a collision means the
            // previous waiter already gave up.
            warn!(%correlation_id, "replacing stale context registration");
            drop(stale);
        }
        Ok(outcome)
    }

    /// Delivers a response to the matching waiter. Returns `false` when no
    /// entry exists, e.g. because the reaper got there first.
    pub(crate) fn fulfill(&self, correlation_id: Uuid, response: GwMessage) -> bool {
        let entry = {
            let mut entries = self.entries.lock().expect("context pool lock poisoned");
            entries.remove(&correlation_id)
        };

        match entry {
            Some(entry) => {
                let _ = entry.waiter.send(ContextOutcome::Fulfilled(response));
                true
            }
            None => {
                debug!(%correlation_id, "response without outstanding context");
                false
            }
        }
    }

    /// Expires entries whose deadline passed, delivering `TimedOut` to each
    /// waiter. Returns the number of reaped entries.
    pub(crate) fn reap(&self, now: Instant) -> usize {
        let expired: Vec<PoolEntry> = {
            let mut entries = self.entries.lock().expect("context pool lock poisoned");
            let dead: Vec<Uuid> = entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            dead.into_iter()
                .filter_map(|id| entries.remove(&id))
                .collect()
        };

        let reaped = expired.len();
        for entry in expired {
            let _ = entry.waiter.send(ContextOutcome::TimedOut);
        }
        if reaped > 0 {
            debug!(reaped, "expired outstanding contexts");
        }
        reaped
    }

    /// Removes an entry without delivering an outcome; used when the
    /// waiter stopped listening on its own.
    pub(crate) fn abandon(&self, correlation_id: Uuid) {
        let mut entries = self.entries.lock().expect("context pool lock poisoned");
        entries.remove(&correlation_id);
    }

    /// Cancels every outstanding context, e.g. on disconnect or shutdown.
    pub(crate) fn cancel_all(&self, reason: CancelReason) {
        let drained: Vec<PoolEntry> = {
            let mut entries = self.entries.lock().expect("context pool lock poisoned");
            entries.drain().map(|(_, entry)| entry).collect()
        };

        if !drained.is_empty() {
            debug!(count = drained.len(), %reason, "cancelling outstanding contexts");
        }
        for entry in drained {
            let _ = entry.waiter.send(ContextOutcome::Cancelled(reason));
        }
    }

    /// Returns how many requests are currently outstanding.
    pub(crate) fn outstanding(&self) -> usize {
        self.entries.lock().expect("context pool lock poisoned").len()
    }

    /// Cadence at which the reaper should run.
    pub(crate) fn reap_interval(&self) -> Duration {
        (self.resend_timeout / 4).max(Duration::from_millis(50))
    }
}
