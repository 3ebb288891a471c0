//! Replication Subsystem
//!
//! Keeps the passives of a stripe in step with its active:
//! - cluster state (id sequences, connections, stripe id) is pushed to every
//!   passive and acknowledged before a publish returns
//! - a new passive is admitted only with an empty, clean database, then
//!   receives the whole object graph in throttled batches
//! - committed transactions are relayed; an uninitialized passive parks
//!   changes to objects it has not received yet
//! - GC is held off while any passive is syncing
//!
//! Protocol violations evict the offending peer. Nothing here retries a
//! correctness failure silently.

mod cluster_state;
mod cluster_state_manager;
mod collaborators;
mod config;
mod errors;
mod gtx;
mod node;
mod object_manager;
mod object_state;
mod object_state_manager;
mod pending_changes;
mod role;
mod throttle;
mod transaction_manager;
mod txn_completion;

pub use cluster_state::{ClusterState, SharedClusterState};
pub use cluster_state_manager::ReplicatedClusterStateManager;
pub use collaborators::{
    Completion, ConnectionEventListener, GarbageCollector, GarbageCollectorEventListener,
    ObjectStore, ObjectSyncTransaction, ServerGlobalTransactionManager, ServerTransactionManager,
    StateChangeListener, StateManager,
};
pub use config::HaConfig;
pub use errors::{ReplicationError, ReplicationErrorKind, ReplicationResult};
pub use gtx::GlobalTransactionStore;
pub use node::{HaCollaborators, HaNode};
pub use object_manager::{GcMonitor, ReplicatedObjectManager};
pub use object_state::{L2ObjectState, ObjectSyncContext, SyncState};
pub use object_state_manager::{L2ObjectStateListener, L2ObjectStateManager};
pub use pending_changes::PendingChangesAccount;
pub use role::{RoleManager, StateChangedEvent};
pub use throttle::{SyncTask, ThrottledTaskExecutor};
pub use transaction_manager::{
    Intake, ObjectSyncAckManager, PassiveTransactionManager, ReplicatedTransactionManager,
    TransactionRole,
};
pub use txn_completion::TransactionTracker;
