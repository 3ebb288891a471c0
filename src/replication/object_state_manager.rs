//! Sync state of every passive, as tracked by the active
//!
//! Entries are keyed by node and tagged with an instance number. Deferred
//! callbacks carry the instance they were scheduled for and do nothing if
//! the node was removed (or removed and re-added) in the meantime.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::collaborators::{ObjectStore, ServerTransactionManager};
use super::errors::{ReplicationError, ReplicationResult};
use super::object_state::{L2ObjectState, ObjectSyncContext, SyncState};
use super::throttle::{SyncTask, ThrottledTaskExecutor};
use crate::model::{NodeId, ServerState};

/// Told when a passive's missing set is known and when its sync finishes.
pub trait L2ObjectStateListener: Send + Sync {
    fn missing_objects_for(&self, node: NodeId, missing: usize);
    fn object_sync_complete_for(&self, node: NodeId);
}

struct Entry {
    instance: u64,
    state: L2ObjectState,
}

#[derive(Default)]
struct Arena {
    next_instance: u64,
    entries: HashMap<NodeId, Entry>,
}

impl Arena {
    fn current(&mut self, node: NodeId, instance: u64) -> Option<&mut L2ObjectState> {
        self.entries
            .get_mut(&node)
            .filter(|entry| entry.instance == instance)
            .map(|entry| &mut entry.state)
    }
}

pub struct L2ObjectStateManager {
    store: Arc<dyn ObjectStore>,
    transactions: Arc<dyn ServerTransactionManager>,
    throttle: ThrottledTaskExecutor,
    listener: Weak<dyn L2ObjectStateListener>,
    arena: Mutex<Arena>,
    this: Weak<L2ObjectStateManager>,
}

impl L2ObjectStateManager {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        transactions: Arc<dyn ServerTransactionManager>,
        max_batches_in_flight: usize,
        listener: Weak<dyn L2ObjectStateListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            transactions,
            throttle: ThrottledTaskExecutor::new(max_batches_in_flight),
            listener,
            arena: Mutex::new(Arena::default()),
            this: this.clone(),
        })
    }

    /// Starts tracking `node`. Returns false if the node is already a
    /// standby and needs no sync.
    ///
    /// The missing set is computed only once resent transactions have
    /// been replayed, so objects they create are not missed.
    pub fn add_l2(&self, node: NodeId, current_state: ServerState) -> bool {
        if current_state == ServerState::PassiveStandby {
            info!(node = %node, "passive already in standby, nothing to sync");
            return false;
        }

        let instance = {
            let mut arena = self.arena.lock();
            arena.next_instance += 1;
            let instance = arena.next_instance;
            if arena
                .entries
                .insert(
                    node,
                    Entry {
                        instance,
                        state: L2ObjectState::new(node),
                    },
                )
                .is_some()
            {
                warn!(node = %node, "replacing existing sync state");
            }
            instance
        };

        let this = self.this.clone();
        self.transactions
            .call_back_on_resent_txns_in_system_completion(Box::new(move || {
                if let Some(manager) = this.upgrade() {
                    manager.move_to_ready_to_sync(node, instance);
                }
            }));
        true
    }

    fn move_to_ready_to_sync(&self, node: NodeId, instance: u64) {
        let all_ids = self.store.all_object_ids();
        let roots = self.store.root_names();
        let missing = {
            let mut arena = self.arena.lock();
            let Some(state) = arena.current(node, instance) else {
                debug!(node = %node, "node removed before its missing set was computed");
                return;
            };
            match state.move_to_ready_to_sync(&all_ids, &roots) {
                Ok(missing) => missing,
                Err(e) => {
                    warn!(node = %node, error = %e, "cannot compute missing objects");
                    return;
                }
            }
        };
        info!(node = %node, missing, "passive ready to sync");
        if let Some(listener) = self.listener.upgrade() {
            listener.missing_objects_for(node, missing);
        }
    }

    /// Stops tracking `node` and drops its pending batches.
    pub fn remove_l2(&self, node: NodeId) -> bool {
        let removed = self.arena.lock().entries.remove(&node);
        let dropped = self.throttle.cancel(node);
        match removed {
            Some(entry) => {
                info!(
                    node = %node,
                    state = %entry.state.state(),
                    dropped_batches = dropped,
                    "stopped tracking passive"
                );
                true
            }
            None => false,
        }
    }

    /// Moves `node` to `SYNC_STARTED` and starts pumping `task`.
    pub fn initiate_sync(&self, node: NodeId, task: SyncTask) -> ReplicationResult<()> {
        {
            let mut arena = self.arena.lock();
            let entry = arena
                .entries
                .get_mut(&node)
                .ok_or_else(|| ReplicationError::unknown_node(node.to_string()))?;
            entry.state.start_sync()?;
        }
        self.throttle.schedule(node, task);
        Ok(())
    }

    pub fn get_some_objects_to_sync_context(
        &self,
        node: NodeId,
        max: usize,
    ) -> Option<ObjectSyncContext> {
        self.arena
            .lock()
            .entries
            .get_mut(&node)?
            .state
            .get_some_objects_to_sync_context(max)
    }

    /// Folds a sent batch back into the node's state. Once everything is
    /// synced, completion is reported after the transactions in flight now
    /// have finished.
    pub fn close(&self, ctx: ObjectSyncContext) -> ReplicationResult<()> {
        let node = ctx.node;
        let instance = {
            let mut arena = self.arena.lock();
            let entry = arena
                .entries
                .get_mut(&node)
                .ok_or_else(|| ReplicationError::unknown_node(node.to_string()))?;
            if !entry.state.close(ctx)? {
                return Ok(());
            }
            entry.instance
        };

        debug!(node = %node, "all objects sent, waiting for in-flight transactions");
        let this = self.this.clone();
        self.transactions
            .call_back_on_txns_in_system_completion(Box::new(move || {
                if let Some(manager) = this.upgrade() {
                    manager.move_to_in_sync(node, instance);
                }
            }));
        Ok(())
    }

    fn move_to_in_sync(&self, node: NodeId, instance: u64) {
        {
            let mut arena = self.arena.lock();
            let Some(state) = arena.current(node, instance) else {
                return;
            };
            if let Err(e) = state.move_to_in_sync() {
                warn!(node = %node, error = %e, "cannot mark passive in sync");
                return;
            }
        }
        self.throttle.cancel(node);
        if let Some(listener) = self.listener.upgrade() {
            listener.object_sync_complete_for(node);
        }
    }

    pub fn receive_sync_ack(&self, node: NodeId, sequence: u64) {
        debug!(node = %node, sequence, "object sync batch acknowledged");
        self.throttle.acked(node);
    }

    pub fn l2_count(&self) -> usize {
        self.arena.lock().entries.len()
    }

    pub fn sync_state(&self, node: NodeId) -> Option<SyncState> {
        self.arena
            .lock()
            .entries
            .get(&node)
            .map(|entry| entry.state.state())
    }

    /// `(synced, total)` for `node`.
    pub fn sync_progress(&self, node: NodeId) -> Option<(u64, u64)> {
        self.arena
            .lock()
            .entries
            .get(&node)
            .map(|entry| (entry.state.synced_count(), entry.state.total_count()))
    }
}
