//! Changes held back on an uninitialized passive
//!
//! A relayed delta for an object the passive has not received yet cannot be
//! applied. It is parked here, keyed by object, until the object's full
//! state arrives through sync; the parked deltas are then replayed after it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::model::{Dna, GlobalTransactionId, ObjectId};

#[derive(Default)]
pub struct PendingChangesAccount {
    by_object: HashMap<ObjectId, Vec<(GlobalTransactionId, Dna)>>,
    by_transaction: BTreeMap<GlobalTransactionId, BTreeSet<ObjectId>>,
}

impl PendingChangesAccount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_to_pending(&mut self, global_id: GlobalTransactionId, change: Dna) {
        self.by_transaction
            .entry(global_id)
            .or_default()
            .insert(change.object_id);
        self.by_object
            .entry(change.object_id)
            .or_default()
            .push((global_id, change));
    }

    /// Removes and returns the parked changes for `object`, in ascending
    /// global transaction order, each pinned to its transaction.
    pub fn take_pending_changes_for(&mut self, object: ObjectId) -> Vec<Dna> {
        let Some(mut changes) = self.by_object.remove(&object) else {
            return Vec::new();
        };
        changes.sort_by_key(|(gid, _)| *gid);
        for (gid, _) in &changes {
            if let Some(objects) = self.by_transaction.get_mut(gid) {
                objects.remove(&object);
                if objects.is_empty() {
                    self.by_transaction.remove(gid);
                }
            }
        }
        changes
            .into_iter()
            .map(|(gid, change)| change.versioned(gid))
            .collect()
    }

    /// Drops every change from a transaction strictly below `low_water_mark`.
    pub fn clear_transactions_below_low_water_mark(&mut self, low_water_mark: GlobalTransactionId) {
        let keep = self.by_transaction.split_off(&low_water_mark);
        let evicted = std::mem::replace(&mut self.by_transaction, keep);
        for (gid, objects) in evicted {
            for object in objects {
                if let Some(changes) = self.by_object.get_mut(&object) {
                    changes.retain(|(change_gid, _)| *change_gid != gid);
                    if changes.is_empty() {
                        self.by_object.remove(&object);
                    }
                }
            }
        }
    }

    /// Number of parked changes.
    pub fn size(&self) -> usize {
        self.by_object.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_object.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_object.clear();
        self.by_transaction.clear();
    }
}
