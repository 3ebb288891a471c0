//! In-flight and resent transaction tracking
//!
//! Waiting for transactions to settle is a registered continuation, never a
//! blocking wait. A continuation runs on the thread that completes the last
//! transaction it waits for, or inline at registration when nothing is
//! pending. Continuations always run outside the tracker's lock.

use std::collections::BTreeSet;

use parking_lot::Mutex;

use super::collaborators::Completion;
use crate::model::ServerTransactionId;

#[derive(Default)]
struct TrackerInner {
    in_flight: BTreeSet<ServerTransactionId>,
    resent: BTreeSet<ServerTransactionId>,
    in_flight_waiters: Vec<(BTreeSet<ServerTransactionId>, Completion)>,
    resent_waiters: Vec<Completion>,
}

/// Tracks transactions between receipt and completion.
#[derive(Default)]
pub struct TransactionTracker {
    inner: Mutex<TrackerInner>,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction_started(&self, id: ServerTransactionId) {
        self.inner.lock().in_flight.insert(id);
    }

    /// Registers transactions resent by clients after a failover. They
    /// count as in flight too.
    pub fn add_resent(&self, ids: impl IntoIterator<Item = ServerTransactionId>) {
        let mut inner = self.inner.lock();
        for id in ids {
            inner.resent.insert(id);
            inner.in_flight.insert(id);
        }
    }

    pub fn transaction_completed(&self, id: ServerTransactionId) {
        let ready = {
            let mut inner = self.inner.lock();
            inner.in_flight.remove(&id);
            inner.resent.remove(&id);

            let mut ready = Vec::new();
            let mut still_waiting = Vec::new();
            for (mut waiting_on, callback) in inner.in_flight_waiters.drain(..) {
                waiting_on.remove(&id);
                if waiting_on.is_empty() {
                    ready.push(callback);
                } else {
                    still_waiting.push((waiting_on, callback));
                }
            }
            inner.in_flight_waiters = still_waiting;
            if inner.resent.is_empty() {
                ready.append(&mut inner.resent_waiters);
            }
            ready
        };
        for callback in ready {
            callback();
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn resent_count(&self) -> usize {
        self.inner.lock().resent.len()
    }

    /// Runs `callback` once everything in flight right now completes.
    pub fn call_when_in_flight_complete(&self, callback: Completion) {
        let mut inner = self.inner.lock();
        if inner.in_flight.is_empty() {
            drop(inner);
            callback();
            return;
        }
        let snapshot = inner.in_flight.clone();
        inner.in_flight_waiters.push((snapshot, callback));
    }

    /// Runs `callback` once every resent transaction has completed.
    pub fn call_when_resent_complete(&self, callback: Completion) {
        let mut inner = self.inner.lock();
        if inner.resent.is_empty() {
            drop(inner);
            callback();
            return;
        }
        inner.resent_waiters.push(callback);
    }
}
