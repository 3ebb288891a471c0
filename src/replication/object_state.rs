//! Per-passive object sync state
//!
//! ```text
//! START -> READY_TO_SYNC -> SYNC_STARTED -> IN_SYNC_PENDING_NOTIFY -> IN_SYNC
//! ```
//!
//! `IN_SYNC` is terminal. Re-syncing a node takes removing and re-adding it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tracing::debug;

use super::errors::{ReplicationError, ReplicationResult};
use crate::model::{NodeId, ObjectId, ObjectIdSet, ObjectSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Start,
    ReadyToSync,
    SyncStarted,
    InSyncPendingNotify,
    InSync,
}

impl SyncState {
    pub fn label(&self) -> &'static str {
        match self {
            SyncState::Start => "START",
            SyncState::ReadyToSync => "READY_TO_SYNC",
            SyncState::SyncStarted => "SYNC_STARTED",
            SyncState::InSyncPendingNotify => "IN_SYNC_PENDING_NOTIFY",
            SyncState::InSync => "IN_SYNC",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One batch of objects handed out for streaming.
///
/// The caller fills in the outcome of each requested id (`synced`,
/// `not_synced` or `deleted`) before giving the context back via
/// [`L2ObjectState::close`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSyncContext {
    pub node: NodeId,
    pub sequence: u64,
    pub requested: ObjectIdSet,
    /// Roots included in this batch, by name.
    pub root_names: BTreeMap<String, ObjectId>,
    pub objects: Vec<ObjectSnapshot>,
    pub synced: ObjectIdSet,
    pub not_synced: ObjectIdSet,
    pub deleted: ObjectIdSet,
}

impl ObjectSyncContext {
    /// Records that `object` was read and will be shipped.
    pub fn object_synced(&mut self, object: ObjectSnapshot) {
        self.synced.insert(object.id);
        self.objects.push(object);
    }

    pub fn object_not_synced(&mut self, id: ObjectId) {
        self.not_synced.insert(id);
    }

    pub fn object_deleted(&mut self, id: ObjectId) {
        self.deleted.insert(id);
    }
}

/// Sync bookkeeping for one passive, owned by the active.
#[derive(Debug)]
pub struct L2ObjectState {
    node: NodeId,
    state: SyncState,
    missing: ObjectIdSet,
    missing_roots: BTreeMap<String, ObjectId>,
    synced_count: u64,
    total_count: u64,
    outstanding: usize,
    sequence: u64,
}

impl L2ObjectState {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            state: SyncState::Start,
            missing: ObjectIdSet::new(),
            missing_roots: BTreeMap::new(),
            synced_count: 0,
            total_count: 0,
            outstanding: 0,
            sequence: 0,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn synced_count(&self) -> u64 {
        self.synced_count
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Objects (roots included) still to be streamed.
    pub fn missing_count(&self) -> usize {
        self.missing.len() + self.missing_roots.len()
    }

    pub fn outstanding_batches(&self) -> usize {
        self.outstanding
    }

    fn illegal(&self, to: SyncState) -> ReplicationError {
        ReplicationError::illegal_transition(format!(
            "{}: cannot move from {} to {}",
            self.node, self.state, to
        ))
    }

    /// Computes the missing set: every live object, with roots tracked by
    /// name. A passive starts with nothing. With no objects at all the node
    /// goes straight to `IN_SYNC`.
    pub fn move_to_ready_to_sync(
        &mut self,
        all_ids: &ObjectIdSet,
        roots: &BTreeMap<String, ObjectId>,
    ) -> ReplicationResult<usize> {
        if self.state != SyncState::Start {
            return Err(self.illegal(SyncState::ReadyToSync));
        }
        let root_ids: ObjectIdSet = roots.values().copied().collect();
        self.missing = all_ids.difference(&root_ids).copied().collect();
        self.missing_roots = roots.clone();
        self.total_count = self.missing_count() as u64;
        self.state = if self.total_count == 0 {
            SyncState::InSync
        } else {
            SyncState::ReadyToSync
        };
        debug!(node = %self.node, missing = self.total_count, state = %self.state, "computed missing objects");
        Ok(self.missing_count())
    }

    pub fn start_sync(&mut self) -> ReplicationResult<()> {
        if self.state != SyncState::ReadyToSync {
            return Err(self.illegal(SyncState::SyncStarted));
        }
        self.state = SyncState::SyncStarted;
        Ok(())
    }

    /// Hands out up to `max` missing objects, roots first, then ascending
    /// object ids. `None` when nothing is missing or sync is not running.
    pub fn get_some_objects_to_sync_context(&mut self, max: usize) -> Option<ObjectSyncContext> {
        if self.state != SyncState::SyncStarted || max == 0 || self.missing_count() == 0 {
            return None;
        }

        let mut requested = ObjectIdSet::new();
        let mut root_names = BTreeMap::new();
        while requested.len() < max {
            let Some((name, id)) = self.missing_roots.pop_first() else {
                break;
            };
            requested.insert(id);
            root_names.insert(name, id);
        }
        while requested.len() < max {
            let Some(id) = self.missing.pop_first() else {
                break;
            };
            requested.insert(id);
        }

        self.sequence += 1;
        self.outstanding += 1;
        Some(ObjectSyncContext {
            node: self.node,
            sequence: self.sequence,
            requested,
            root_names,
            objects: Vec::new(),
            synced: ObjectIdSet::new(),
            not_synced: ObjectIdSet::new(),
            deleted: ObjectIdSet::new(),
        })
    }

    /// Folds a finished batch back in.
    ///
    /// Not-synced ids return to the missing set (roots keep their names),
    /// deleted ids are dropped for good. Returns true when this close moved
    /// the node to `IN_SYNC_PENDING_NOTIFY`.
    pub fn close(&mut self, ctx: ObjectSyncContext) -> ReplicationResult<bool> {
        if self.state != SyncState::SyncStarted {
            return Err(self.illegal(SyncState::InSyncPendingNotify));
        }
        self.outstanding = self.outstanding.saturating_sub(1);

        let unaccounted: ObjectIdSet = ctx
            .requested
            .iter()
            .filter(|id| {
                !ctx.synced.contains(id) && !ctx.deleted.contains(id) && !ctx.not_synced.contains(id)
            })
            .copied()
            .collect();
        let mut names_by_id: HashMap<ObjectId, Vec<&String>> = HashMap::new();
        for (name, id) in &ctx.root_names {
            names_by_id.entry(*id).or_default().push(name);
        }
        for id in ctx.not_synced.iter().chain(unaccounted.iter()) {
            match names_by_id.get(id) {
                Some(names) => {
                    for name in names {
                        self.missing_roots.insert((*name).clone(), *id);
                    }
                }
                None => {
                    self.missing.insert(*id);
                }
            }
        }
        for id in &ctx.deleted {
            self.missing.remove(id);
            for name in names_by_id.get(id).into_iter().flatten() {
                self.missing_roots.remove(name.as_str());
            }
        }
        self.total_count = self.total_count.saturating_sub(ctx.deleted.len() as u64);
        self.synced_count += ctx.synced.len() as u64;

        if self.missing_count() == 0 && self.outstanding == 0 {
            self.state = SyncState::InSyncPendingNotify;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn move_to_in_sync(&mut self) -> ReplicationResult<()> {
        match self.state {
            SyncState::InSyncPendingNotify | SyncState::InSync => {
                self.state = SyncState::InSync;
                Ok(())
            }
            _ => Err(self.illegal(SyncState::InSync)),
        }
    }
}
