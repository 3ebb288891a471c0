//! Identifier types shared by every subsystem.
//!
//! All identifiers are plain value types: `Copy`, totally ordered and
//! hashable so they can key maps and sort deterministically.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a stripe member or client node.
///
/// Opaque; only equality, ordering and hashing are meaningful.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// The null node, used where no node is known (e.g. no active yet).
    pub const NULL: NodeId = NodeId(Uuid::nil());

    /// Creates a node id from an existing UUID.
    pub fn new(value: Uuid) -> Self {
        Self(value)
    }

    /// Generates a fresh random node id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeID[{}]", self.0)
    }
}

/// Dense 64-bit identifier of an object in the shared graph.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectID={}", self.0)
    }
}

/// Ordered set of object ids. Iteration is ascending, which keeps
/// missing-set diffs and sync batches deterministic.
pub type ObjectIdSet = BTreeSet<ObjectId>;

/// Server-assigned total order over committed transactions.
///
/// `NULL` is the bottom value; the first assigned id is 1.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct GlobalTransactionId(u64);

impl GlobalTransactionId {
    pub const NULL: GlobalTransactionId = GlobalTransactionId(0);

    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for GlobalTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalTxnID={}", self.0)
    }
}

/// Per-client transaction counter.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ClientTransactionId(u64);

impl ClientTransactionId {
    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Key for transaction-descriptor lookup: (source node, client transaction).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ServerTransactionId {
    pub source: NodeId,
    pub client_txn: ClientTransactionId,
}

impl ServerTransactionId {
    pub fn new(source: NodeId, client_txn: ClientTransactionId) -> Self {
        Self { source, client_txn }
    }

    /// String form used as a persistence map key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.source.as_uuid(), self.client_txn.value())
    }
}

impl fmt::Display for ServerTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerTxnID[{}:{}]", self.source.as_uuid(), self.client_txn.value())
    }
}

/// Identity of a stripe. Generated once, immutable afterwards.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct StripeId(Uuid);

impl StripeId {
    pub const NULL: StripeId = StripeId(Uuid::nil());

    pub fn new(value: Uuid) -> Self {
        Self(value)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for StripeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StripeID[{}]", self.0)
    }
}

/// Replication group a stripe id belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct GroupId(u32);

impl GroupId {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupID[{}]", self.0)
    }
}

/// A live client connection: the channel number handed out by the
/// connection-id sequence plus the client it belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ConnectionId {
    pub channel: u64,
    pub client: NodeId,
}

impl ConnectionId {
    pub fn new(channel: u64, client: NodeId) -> Self {
        Self { channel, client }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionID[{}.{}]", self.channel, self.client.as_uuid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_ids() {
        assert!(NodeId::NULL.is_null());
        assert!(StripeId::NULL.is_null());
        assert!(GlobalTransactionId::NULL.is_null());
        assert!(!NodeId::random().is_null());
        assert!(!StripeId::generate().is_null());
    }

    #[test]
    fn test_object_id_set_iterates_ascending() {
        let set: ObjectIdSet = [5, 1, 3].into_iter().map(ObjectId::new).collect();
        let ordered: Vec<u64> = set.iter().map(|id| id.value()).collect();
        assert_eq!(ordered, vec![1, 3, 5]);
    }

    #[test]
    fn test_gid_ordering_is_numeric() {
        assert!(GlobalTransactionId::NULL < GlobalTransactionId::new(1));
        assert!(GlobalTransactionId::new(9) < GlobalTransactionId::new(10));
    }

    #[test]
    fn test_server_transaction_key_is_stable() {
        let node = NodeId::random();
        let a = ServerTransactionId::new(node, ClientTransactionId::new(7));
        let b = ServerTransactionId::new(node, ClientTransactionId::new(7));
        assert_eq!(a.key(), b.key());
        assert!(a.key().ends_with(":7"));
    }
}
