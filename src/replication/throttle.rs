//! Per-node flow control for object sync batches
//!
//! A node's task is re-run until it either reports there was nothing to send
//! or the node has `max_in_flight` un-acked batches. Each ack frees one slot
//! and pumps the task again.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::model::NodeId;

/// Sends one batch. Returns false when there was nothing to send.
pub type SyncTask = Arc<dyn Fn() -> bool + Send + Sync>;

struct NodeSlots {
    in_flight: usize,
    task: SyncTask,
}

pub struct ThrottledTaskExecutor {
    max_in_flight: usize,
    nodes: Mutex<HashMap<NodeId, NodeSlots>>,
}

impl ThrottledTaskExecutor {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Installs `task` for `node` and starts pumping it.
    pub fn schedule(&self, node: NodeId, task: SyncTask) {
        self.nodes
            .lock()
            .insert(node, NodeSlots { in_flight: 0, task });
        self.pump(node);
    }

    /// One batch for `node` was acknowledged.
    pub fn acked(&self, node: NodeId) {
        {
            let mut nodes = self.nodes.lock();
            let Some(slots) = nodes.get_mut(&node) else {
                debug!(node = %node, "ack for a node with no sync task");
                return;
            };
            slots.in_flight = slots.in_flight.saturating_sub(1);
        }
        self.pump(node);
    }

    /// Drops the node's task. Returns how many batches were still un-acked.
    pub fn cancel(&self, node: NodeId) -> usize {
        self.nodes
            .lock()
            .remove(&node)
            .map(|slots| slots.in_flight)
            .unwrap_or(0)
    }

    pub fn in_flight(&self, node: NodeId) -> usize {
        self.nodes
            .lock()
            .get(&node)
            .map(|slots| slots.in_flight)
            .unwrap_or(0)
    }

    fn pump(&self, node: NodeId) {
        loop {
            // Reserve the slot before running so concurrent pumps never
            // overshoot the bound.
            let task = {
                let mut nodes = self.nodes.lock();
                let Some(slots) = nodes.get_mut(&node) else {
                    return;
                };
                if slots.in_flight >= self.max_in_flight {
                    return;
                }
                slots.in_flight += 1;
                Arc::clone(&slots.task)
            };

            if !task() {
                if let Some(slots) = self.nodes.lock().get_mut(&node) {
                    slots.in_flight = slots.in_flight.saturating_sub(1);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_task(limit: usize) -> (SyncTask, Arc<AtomicUsize>) {
        let sent = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sent);
        let task: SyncTask = Arc::new(move || {
            if counter.load(Ordering::SeqCst) >= limit {
                return false;
            }
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        (task, sent)
    }

    #[test]
    fn test_bound_on_unacked_batches() {
        let executor = ThrottledTaskExecutor::new(3);
        let node = NodeId::random();
        let (task, sent) = counting_task(10);
        executor.schedule(node, task);
        assert_eq!(sent.load(Ordering::SeqCst), 3);
        assert_eq!(executor.in_flight(node), 3);

        executor.acked(node);
        assert_eq!(sent.load(Ordering::SeqCst), 4);
        assert_eq!(executor.in_flight(node), 3);
    }

    #[test]
    fn test_exhausted_task_releases_reserved_slot() {
        let executor = ThrottledTaskExecutor::new(5);
        let node = NodeId::random();
        let (task, sent) = counting_task(2);
        executor.schedule(node, task);
        assert_eq!(sent.load(Ordering::SeqCst), 2);
        assert_eq!(executor.in_flight(node), 2);
    }

    #[test]
    fn test_cancel_reports_outstanding() {
        let executor = ThrottledTaskExecutor::new(2);
        let node = NodeId::random();
        let (task, _) = counting_task(10);
        executor.schedule(node, task);
        assert_eq!(executor.cancel(node), 2);
        assert_eq!(executor.cancel(node), 0);
        executor.acked(node);
        assert_eq!(executor.in_flight(node), 0);
    }
}
