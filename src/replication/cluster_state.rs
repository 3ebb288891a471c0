//! Cluster state record
//!
//! Identifier sequences only move forward: a proposed value lower than the
//! one held is logged and ignored, so a stale node can never overwrite
//! progress. Applied sequence updates are only marked dirty; the explicit
//! `sync_*_to_disk` calls write them out. Connections, the lifecycle label,
//! the stripe ids and the database-clean marker are written immediately.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::errors::{ReplicationError, ReplicationResult};
use crate::model::{ConnectionId, GroupId, ServerState, StripeId};
use crate::observability::{log_event, Event};
use crate::persistence::{get_as, put_as, ClusterStatePersistor, StateKey};
use crate::transport::ClusterStateSnapshot;

/// Cluster state shared between the components of one node.
pub type SharedClusterState = Arc<Mutex<ClusterState>>;

pub struct ClusterState {
    persistor: Arc<dyn ClusterStatePersistor>,
    group_id: GroupId,

    next_available_object_id: u64,
    next_available_global_txn_id: u64,
    next_available_connection_id: u64,
    next_available_gc_iteration_id: u64,

    object_id_dirty: bool,
    global_txn_id_dirty: bool,
    connection_id_dirty: bool,
    gc_iteration_id_dirty: bool,

    connections: BTreeSet<ConnectionId>,
    current_state: ServerState,
    stripe_id: StripeId,
    stripe_ids: BTreeMap<GroupId, StripeId>,
    db_clean: bool,
}

impl ClusterState {
    /// Restores every field from `persistor`. Missing keys take their
    /// initial values.
    pub fn load(persistor: Arc<dyn ClusterStatePersistor>, group_id: GroupId) -> ReplicationResult<Self> {
        let p = persistor.as_ref();
        let stripe_ids: BTreeMap<GroupId, StripeId> =
            get_as::<Vec<(GroupId, StripeId)>>(p, StateKey::StripeIds)?
                .unwrap_or_default()
                .into_iter()
                .collect();
        let current_state = match get_as::<String>(p, StateKey::CurrentState)? {
            Some(label) => ServerState::from_label(&label).ok_or_else(|| {
                ReplicationError::configuration_error(format!("unknown persisted state {}", label))
            })?,
            None => ServerState::Start,
        };

        Ok(Self {
            next_available_object_id: get_as(p, StateKey::NextObjectId)?.unwrap_or(0),
            next_available_global_txn_id: get_as(p, StateKey::NextGlobalTxnId)?.unwrap_or(0),
            next_available_connection_id: get_as(p, StateKey::NextConnectionId)?.unwrap_or(0),
            next_available_gc_iteration_id: get_as(p, StateKey::NextGcIterationId)?.unwrap_or(0),
            object_id_dirty: false,
            global_txn_id_dirty: false,
            connection_id_dirty: false,
            gc_iteration_id_dirty: false,
            connections: get_as::<Vec<ConnectionId>>(p, StateKey::Connections)?
                .unwrap_or_default()
                .into_iter()
                .collect(),
            current_state,
            stripe_id: stripe_ids.get(&group_id).copied().unwrap_or(StripeId::NULL),
            stripe_ids,
            db_clean: get_as(p, StateKey::DbClean)?.unwrap_or(true),
            persistor,
            group_id,
        })
    }

    /// Loads the state and wraps it for sharing.
    pub fn shared(persistor: Arc<dyn ClusterStatePersistor>, group_id: GroupId) -> ReplicationResult<SharedClusterState> {
        Ok(Arc::new(Mutex::new(Self::load(persistor, group_id)?)))
    }

    fn ignore_regressive(name: &str, current: u64, proposed: u64) {
        warn!(
            sequence = name,
            current, proposed, "ignoring regressive cluster-state update"
        );
        log_event(
            Event::RegressiveUpdateIgnored,
            &[("sequence", name), ("proposed", proposed.to_string().as_str())],
        );
    }

    /// Returns whether the value was applied.
    pub fn set_next_available_object_id(&mut self, next: u64) -> bool {
        if next < self.next_available_object_id {
            Self::ignore_regressive("object_id", self.next_available_object_id, next);
            return false;
        }
        self.next_available_object_id = next;
        self.object_id_dirty = true;
        true
    }

    /// Returns whether the value was applied.
    pub fn set_next_available_global_txn_id(&mut self, next: u64) -> bool {
        if next < self.next_available_global_txn_id {
            Self::ignore_regressive("global_txn_id", self.next_available_global_txn_id, next);
            return false;
        }
        self.next_available_global_txn_id = next;
        self.global_txn_id_dirty = true;
        true
    }

    /// Returns whether the value was applied.
    pub fn set_next_available_connection_id(&mut self, next: u64) -> bool {
        if next < self.next_available_connection_id {
            Self::ignore_regressive("connection_id", self.next_available_connection_id, next);
            return false;
        }
        self.next_available_connection_id = next;
        self.connection_id_dirty = true;
        true
    }

    /// Returns whether the value was applied.
    pub fn set_next_available_gc_iteration_id(&mut self, next: u64) -> bool {
        if next < self.next_available_gc_iteration_id {
            Self::ignore_regressive("gc_iteration_id", self.next_available_gc_iteration_id, next);
            return false;
        }
        self.next_available_gc_iteration_id = next;
        self.gc_iteration_id_dirty = true;
        true
    }

    pub fn next_available_object_id(&self) -> u64 {
        self.next_available_object_id
    }

    pub fn next_available_global_txn_id(&self) -> u64 {
        self.next_available_global_txn_id
    }

    pub fn next_available_connection_id(&self) -> u64 {
        self.next_available_connection_id
    }

    pub fn next_available_gc_iteration_id(&self) -> u64 {
        self.next_available_gc_iteration_id
    }

    pub fn sync_object_id_to_disk(&mut self) -> ReplicationResult<()> {
        if self.object_id_dirty {
            put_as(self.persistor.as_ref(), StateKey::NextObjectId, &self.next_available_object_id)?;
            self.object_id_dirty = false;
        }
        Ok(())
    }

    pub fn sync_global_txn_id_to_disk(&mut self) -> ReplicationResult<()> {
        if self.global_txn_id_dirty {
            put_as(
                self.persistor.as_ref(),
                StateKey::NextGlobalTxnId,
                &self.next_available_global_txn_id,
            )?;
            self.global_txn_id_dirty = false;
        }
        Ok(())
    }

    pub fn sync_connection_id_to_disk(&mut self) -> ReplicationResult<()> {
        if self.connection_id_dirty {
            put_as(
                self.persistor.as_ref(),
                StateKey::NextConnectionId,
                &self.next_available_connection_id,
            )?;
            self.connection_id_dirty = false;
        }
        Ok(())
    }

    pub fn sync_gc_iteration_id_to_disk(&mut self) -> ReplicationResult<()> {
        if self.gc_iteration_id_dirty {
            put_as(
                self.persistor.as_ref(),
                StateKey::NextGcIterationId,
                &self.next_available_gc_iteration_id,
            )?;
            self.gc_iteration_id_dirty = false;
        }
        Ok(())
    }

    /// Writes every dirty sequence.
    pub fn sync_sequences_to_disk(&mut self) -> ReplicationResult<()> {
        self.sync_object_id_to_disk()?;
        self.sync_global_txn_id_to_disk()?;
        self.sync_connection_id_to_disk()?;
        self.sync_gc_iteration_id_to_disk()
    }

    /// Whether any sequence update is waiting to be written.
    pub fn has_dirty_sequences(&self) -> bool {
        self.object_id_dirty
            || self.global_txn_id_dirty
            || self.connection_id_dirty
            || self.gc_iteration_id_dirty
    }

    fn persist_connections(&self) -> ReplicationResult<()> {
        let connections: Vec<ConnectionId> = self.connections.iter().copied().collect();
        put_as(self.persistor.as_ref(), StateKey::Connections, &connections)?;
        Ok(())
    }

    /// Returns false if the connection was already known.
    pub fn add_new_connection(&mut self, connection: ConnectionId) -> ReplicationResult<bool> {
        if !self.connections.insert(connection) {
            return Ok(false);
        }
        self.persist_connections()?;
        Ok(true)
    }

    /// Returns false if the connection was not known.
    pub fn remove_connection(&mut self, connection: ConnectionId) -> ReplicationResult<bool> {
        if !self.connections.remove(&connection) {
            return Ok(false);
        }
        self.persist_connections()?;
        Ok(true)
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.connections.iter().copied().collect()
    }

    pub fn current_state(&self) -> ServerState {
        self.current_state
    }

    /// Persists the lifecycle label verbatim.
    pub fn set_current_state(&mut self, state: ServerState) -> ReplicationResult<()> {
        put_as(self.persistor.as_ref(), StateKey::CurrentState, &state.label())?;
        self.current_state = state;
        Ok(())
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn stripe_id(&self) -> StripeId {
        self.stripe_id
    }

    pub fn stripe_id_for(&self, group: GroupId) -> StripeId {
        self.stripe_ids.get(&group).copied().unwrap_or(StripeId::NULL)
    }

    fn persist_stripe_ids(&self) -> ReplicationResult<()> {
        let entries: Vec<(GroupId, StripeId)> =
            self.stripe_ids.iter().map(|(g, s)| (*g, *s)).collect();
        put_as(self.persistor.as_ref(), StateKey::StripeIds, &entries)?;
        Ok(())
    }

    /// Creates the stripe id the first time the node becomes active.
    /// Afterwards the stored id is returned unchanged.
    pub fn generate_stripe_id_if_needed(&mut self) -> ReplicationResult<StripeId> {
        if !self.stripe_id.is_null() {
            return Ok(self.stripe_id);
        }
        let id = StripeId::generate();
        self.stripe_ids.insert(self.group_id, id);
        self.persist_stripe_ids()?;
        self.stripe_id = id;
        info!(stripe_id = %id, group = %self.group_id, "generated stripe id");
        log_event(
            Event::StripeIdGenerated,
            &[("stripe_id", id.to_string().as_str())],
        );
        Ok(id)
    }

    /// Adopts `id` for `group`.
    ///
    /// Fails with `StripeMismatch` if a different non-null id is already
    /// held; the caller must treat that as a hard fault.
    pub fn set_stripe_id(&mut self, group: GroupId, id: StripeId) -> ReplicationResult<()> {
        let held = self.stripe_id_for(group);
        if held == id || id.is_null() {
            return Ok(());
        }
        if !held.is_null() {
            log_event(
                Event::StripeIdMismatch,
                &[
                    ("held", held.to_string().as_str()),
                    ("offered", id.to_string().as_str()),
                ],
            );
            return Err(ReplicationError::stripe_mismatch(format!(
                "{} holds {} but was asked to join {}",
                group, held, id
            )));
        }
        self.stripe_ids.insert(group, id);
        self.persist_stripe_ids()?;
        if group == self.group_id {
            self.stripe_id = id;
        }
        Ok(())
    }

    pub fn is_db_clean(&self) -> bool {
        self.db_clean
    }

    pub fn set_db_clean(&mut self, clean: bool) -> ReplicationResult<()> {
        put_as(self.persistor.as_ref(), StateKey::DbClean, &clean)?;
        self.db_clean = clean;
        Ok(())
    }

    /// Full state as broadcast to passives.
    pub fn snapshot(&self) -> ClusterStateSnapshot {
        ClusterStateSnapshot {
            group_id: self.group_id,
            stripe_id: self.stripe_id,
            next_object_id: self.next_available_object_id,
            next_global_txn_id: self.next_available_global_txn_id,
            next_connection_id: self.next_available_connection_id,
            next_gc_iteration_id: self.next_available_gc_iteration_id,
            connections: self.connections(),
        }
    }

    /// Applies a full state received from the active and writes it out.
    ///
    /// Sequences go through the monotone setters; the connection set is
    /// replaced. A foreign stripe id fails before anything is applied.
    pub fn apply_snapshot(&mut self, snapshot: &ClusterStateSnapshot) -> ReplicationResult<()> {
        self.set_stripe_id(snapshot.group_id, snapshot.stripe_id)?;
        self.set_next_available_object_id(snapshot.next_object_id);
        self.set_next_available_global_txn_id(snapshot.next_global_txn_id);
        self.set_next_available_connection_id(snapshot.next_connection_id);
        self.set_next_available_gc_iteration_id(snapshot.next_gc_iteration_id);
        self.sync_sequences_to_disk()?;

        let connections: BTreeSet<ConnectionId> = snapshot.connections.iter().copied().collect();
        if connections != self.connections {
            self.connections = connections;
            self.persist_connections()?;
        }
        Ok(())
    }
}
