//! Change sets and the transactions that carry them.

use serde::{Deserialize, Serialize};

use super::ids::{GlobalTransactionId, ObjectId, ObjectIdSet, ServerTransactionId};

/// Whether a change defines an object or modifies an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnaKind {
    /// Full definition of a (possibly new) object.
    Full,
    /// Incremental change against a known object.
    Delta,
}

/// One change to one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dna {
    pub object_id: ObjectId,
    pub kind: DnaKind,
    /// Set when a buffered change is replayed, so the apply layer can skip
    /// changes already folded into a synced object.
    pub version: Option<GlobalTransactionId>,
    pub payload: Vec<u8>,
}

impl Dna {
    pub fn full(object_id: ObjectId, payload: Vec<u8>) -> Self {
        Self {
            object_id,
            kind: DnaKind::Full,
            version: None,
            payload,
        }
    }

    pub fn delta(object_id: ObjectId, payload: Vec<u8>) -> Self {
        Self {
            object_id,
            kind: DnaKind::Delta,
            version: None,
            payload,
        }
    }

    pub fn is_delta(&self) -> bool {
        self.kind == DnaKind::Delta
    }

    /// Returns this change pinned to the transaction it originally came from.
    pub fn versioned(mut self, version: GlobalTransactionId) -> Self {
        self.version = Some(version);
        self
    }
}

/// A committed transaction as seen by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTransaction {
    pub id: ServerTransactionId,
    pub global_id: GlobalTransactionId,
    pub changes: Vec<Dna>,
    /// Objects first defined by this transaction.
    pub new_object_ids: ObjectIdSet,
    /// Set when some of the original changes were held back.
    pub pruned: bool,
}

impl ServerTransaction {
    pub fn new(id: ServerTransactionId, global_id: GlobalTransactionId, changes: Vec<Dna>) -> Self {
        let new_object_ids = changes
            .iter()
            .filter(|c| !c.is_delta())
            .map(|c| c.object_id)
            .collect();
        Self {
            id,
            global_id,
            changes,
            new_object_ids,
            pruned: false,
        }
    }

    /// Builds the reduced form of `original` carrying only `changes`.
    pub fn pruned_from(
        original: &ServerTransaction,
        changes: Vec<Dna>,
        new_object_ids: ObjectIdSet,
    ) -> Self {
        Self {
            id: original.id,
            global_id: original.global_id,
            changes,
            new_object_ids,
            pruned: true,
        }
    }

    /// Every object touched by this transaction.
    pub fn object_ids(&self) -> ObjectIdSet {
        self.changes.iter().map(|c| c.object_id).collect()
    }
}

/// Serialized state of one object, as streamed during passive sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub id: ObjectId,
    pub payload: Vec<u8>,
}

/// Summary of one distributed GC cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcInfo {
    pub iteration: u64,
    pub full: bool,
}

/// Result of a GC cycle, applied on passives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DgcResultContext {
    pub info: GcInfo,
    pub deleted: ObjectIdSet,
}
