//! Group message catalogue
//!
//! Every message exchanged between stripe members. Listeners register per
//! [`MessageKind`]; the transport routes by [`GroupMessage::kind`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{
    ConnectionId, GcInfo, GlobalTransactionId, GroupId, ObjectId, ObjectIdSet, ObjectSnapshot,
    ServerState, ServerTransaction, StripeId, ZapReason,
};

/// Routing key for listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    ClusterState,
    ObjectListSync,
    PassiveSyncBegin,
    ObjectSync,
    ObjectSyncAck,
    ObjectSyncComplete,
    GcResult,
    RelayedCommit,
    ObjectSyncReset,
    StateChange,
    Zap,
}

/// Full cluster state as shipped to a passive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStateSnapshot {
    pub group_id: GroupId,
    pub stripe_id: StripeId,
    pub next_object_id: u64,
    pub next_global_txn_id: u64,
    pub next_connection_id: u64,
    pub next_gc_iteration_id: u64,
    pub connections: Vec<ConnectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStateMessage {
    CompleteState(ClusterStateSnapshot),
    NextAvailableObjectId(u64),
    NextAvailableGlobalTxnId(u64),
    NextAvailableConnectionId(u64),
    NextAvailableGcIterationId(u64),
    ConnectionCreated(ConnectionId),
    ConnectionDestroyed(ConnectionId),
    OperationSuccess,
    OperationFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectListSyncMessage {
    Request,
    Response {
        current_state: ServerState,
        sync_allowed: bool,
        known_object_count: u64,
        storage_capacity: u64,
    },
    FailedResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassiveSyncBeginMessage {
    Request,
    Response { current_state: ServerState },
    Error,
}

/// One batch of streamed objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSyncMessage {
    pub sequence: u64,
    pub objects: Vec<ObjectSnapshot>,
    pub root_names: BTreeMap<String, ObjectId>,
    /// Requested ids found to be gone from the store.
    pub deleted: ObjectIdSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectSyncCompleteMessage {
    /// Every object has been streamed; `synced` is the number sent.
    Complete { synced: u64 },
    Ack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcResultMessage {
    pub info: GcInfo,
    pub deleted: ObjectIdSet,
}

/// Committed transactions relayed from the active, plus the low-water mark
/// at the time of relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayedCommitMessage {
    pub transactions: Vec<ServerTransaction>,
    pub low_water_mark: GlobalTransactionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectSyncResetMessage {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZapRequestMessage {
    pub reason: ZapReason,
    pub message: String,
    pub weights: Vec<i64>,
}

/// Every message a stripe member can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMessage {
    ClusterState(ClusterStateMessage),
    ObjectListSync(ObjectListSyncMessage),
    PassiveSyncBegin(PassiveSyncBeginMessage),
    ObjectSync(ObjectSyncMessage),
    ObjectSyncAck { sequence: u64 },
    ObjectSyncComplete(ObjectSyncCompleteMessage),
    GcResult(GcResultMessage),
    RelayedCommit(RelayedCommitMessage),
    ObjectSyncReset(ObjectSyncResetMessage),
    MoveToPassiveStandby,
    ZapRequest(ZapRequestMessage),
}

impl GroupMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            GroupMessage::ClusterState(_) => MessageKind::ClusterState,
            GroupMessage::ObjectListSync(_) => MessageKind::ObjectListSync,
            GroupMessage::PassiveSyncBegin(_) => MessageKind::PassiveSyncBegin,
            GroupMessage::ObjectSync(_) => MessageKind::ObjectSync,
            GroupMessage::ObjectSyncAck { .. } => MessageKind::ObjectSyncAck,
            GroupMessage::ObjectSyncComplete(_) => MessageKind::ObjectSyncComplete,
            GroupMessage::GcResult(_) => MessageKind::GcResult,
            GroupMessage::RelayedCommit(_) => MessageKind::RelayedCommit,
            GroupMessage::ObjectSyncReset(_) => MessageKind::ObjectSyncReset,
            GroupMessage::MoveToPassiveStandby => MessageKind::StateChange,
            GroupMessage::ZapRequest(_) => MessageKind::Zap,
        }
    }
}
