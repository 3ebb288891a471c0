//! Interfaces to the subsystems the replication core drives but does not own
//!
//! The object store, the garbage collector and the transaction pipeline live
//! outside this crate; these traits are the whole contract with them.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::errors::ReplicationResult;
use super::role::StateChangedEvent;
use crate::model::{
    ConnectionId, DgcResultContext, Dna, GcInfo, GlobalTransactionId, NodeId, ObjectId,
    ObjectIdSet, ObjectSnapshot, ServerState, ServerTransaction, ServerTransactionId,
};

/// Continuation run when a set of transactions completes.
pub type Completion = Box<dyn FnOnce() + Send>;

/// Read access to the active's object graph.
pub trait ObjectStore: Send + Sync {
    /// Every live object id.
    fn all_object_ids(&self) -> ObjectIdSet;

    /// Root name to object id.
    fn root_names(&self) -> BTreeMap<String, ObjectId>;

    /// Serialized state of `id`. `Ok(None)` means the object no longer
    /// exists; `Err` means it exists but could not be read right now.
    fn lookup(&self, id: ObjectId) -> ReplicationResult<Option<ObjectSnapshot>>;

    /// Number of objects known locally.
    fn object_count(&self) -> u64;

    /// Storage available for new objects, in bytes.
    fn storage_capacity(&self) -> u64;
}

/// Distributed garbage collector controls.
pub trait GarbageCollector: Send + Sync {
    /// Asks the collector to stop scheduling cycles. Non-blocking; returns
    /// whether the collector is now disabled (false while a cycle runs).
    fn request_disable_gc(&self) -> bool;

    /// Disables the collector, waiting for a running cycle to finish.
    fn wait_to_disable_gc(&self);

    /// Re-enables the collector. Returns whether it was disabled.
    fn enable_gc(&self) -> bool;

    fn is_disabled(&self) -> bool;

    /// Applies a relayed GC result on a passive.
    fn delete_garbage(&self, result: DgcResultContext);

    fn add_listener(&self, listener: Arc<dyn GarbageCollectorEventListener>);
}

pub trait GarbageCollectorEventListener: Send + Sync {
    fn garbage_collector_cycle_completed(&self, info: GcInfo, deleted: ObjectIdSet);
}

/// A batch of synced objects as applied on a passive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSyncTransaction {
    pub sequence: u64,
    pub changes: Vec<Dna>,
    pub root_names: BTreeMap<String, ObjectId>,
    pub deleted: ObjectIdSet,
}

impl ObjectSyncTransaction {
    /// Every object defined by this batch.
    pub fn object_ids(&self) -> ObjectIdSet {
        self.changes
            .iter()
            .filter(|c| !c.is_delta())
            .map(|c| c.object_id)
            .collect()
    }
}

/// The server's transaction pipeline.
pub trait ServerTransactionManager: Send + Sync {
    /// Applies relayed committed transactions.
    fn incoming_transactions(&self, from: NodeId, transactions: Vec<ServerTransaction>);

    /// Applies one object-sync batch. Returns once the batch is applied.
    fn apply_object_sync(&self, from: NodeId, transaction: ObjectSyncTransaction);

    /// Runs `callback` once every transaction in flight right now has
    /// completed. Transactions started later do not delay it.
    fn call_back_on_txns_in_system_completion(&self, callback: Completion);

    /// Runs `callback` once every resent transaction has been replayed.
    fn call_back_on_resent_txns_in_system_completion(&self, callback: Completion);
}

/// Mapping from server transaction ids to global transaction ids.
pub trait ServerGlobalTransactionManager: Send + Sync {
    /// Global id of `id`, assigning the next one on first sight (active
    /// only). The mapping never changes once made.
    fn get_or_create_global_id(&self, id: ServerTransactionId) -> ReplicationResult<GlobalTransactionId>;

    /// Records a mapping assigned by the active.
    fn record(&self, id: ServerTransactionId, global_id: GlobalTransactionId) -> ReplicationResult<()>;

    /// Forgets every mapping below `low_water_mark`.
    fn clear_below_low_water_mark(&self, low_water_mark: GlobalTransactionId) -> ReplicationResult<()>;

    /// Oldest mapping still held, or NULL when empty.
    fn low_water_mark(&self) -> GlobalTransactionId;

    /// Highest global id assigned or recorded.
    fn last_global_id(&self) -> GlobalTransactionId;
}

/// Local lifecycle state, as consulted by the replication core.
pub trait StateManager: Send + Sync {
    fn current_state(&self) -> ServerState;

    fn is_active_coordinator(&self) -> bool {
        self.current_state() == ServerState::ActiveCoordinator
    }

    /// Node currently believed to be active, NULL if unknown.
    fn active_node_id(&self) -> NodeId;

    /// Tells a fully synced passive to move to standby.
    fn move_node_to_passive_standby(&self, node: NodeId);
}

pub trait StateChangeListener: Send + Sync {
    fn l2_state_changed(&self, event: &StateChangedEvent);
}

/// Notified when a replicated connection delta arrives on a passive.
pub trait ConnectionEventListener: Send + Sync {
    fn connection_created(&self, connection: ConnectionId);
    fn connection_destroyed(&self, connection: ConnectionId);
}
