//! Group transport abstraction
//!
//! The replication core talks to its peers only through [`GroupManager`]:
//! point-to-point send, send-and-wait for a reply, broadcast-and-collect and
//! the eviction primitive `zap_node`. Delivery to any one peer is FIFO.
//!
//! Listeners are synchronous: a handler runs to completion on the receiving
//! node's dispatch task and may return a reply. Only the waiting side of a
//! request is async; a handler that needs to wait hands the waiting part to
//! [`GroupManager::spawn_task`].
//!
//! [`LocalNetwork`] is an in-process implementation used by tests and by
//! single-process simulations of a whole stripe.

mod broadcast;
mod errors;
mod local;
mod messages;

pub use broadcast::send_all_and_wait;
pub use errors::{TransportError, TransportResult};
pub use local::{LocalGroupManager, LocalNetwork, ZapRecord};
pub use messages::{
    ClusterStateMessage, ClusterStateSnapshot, GcResultMessage, GroupMessage, MessageKind,
    ObjectListSyncMessage, ObjectSyncCompleteMessage, ObjectSyncMessage, ObjectSyncResetMessage,
    PassiveSyncBeginMessage, RelayedCommitMessage, ZapRequestMessage,
};

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::model::{NodeId, ZapReason};

/// Receives messages of the kinds it registered for.
pub trait GroupMessageListener: Send + Sync {
    /// Handles `message`. A returned message is the reply delivered to a
    /// peer blocked in [`GroupManager::send_to_and_wait`]; it is dropped for
    /// plain sends.
    fn message_received(&self, from: NodeId, message: GroupMessage) -> Option<GroupMessage>;
}

/// Gatekeeper consulted on every zap, outgoing and incoming.
pub trait ZapNodeRequestProcessor: Send + Sync {
    /// Whether the local node may evict `node`.
    fn accept_outgoing_zap_node_request(&self, node: NodeId, reason: ZapReason, message: &str)
        -> bool;

    /// Weights attached to outgoing zaps.
    fn current_node_weights(&self) -> Vec<i64>;

    /// Called when a peer evicts the local node.
    fn incoming_zap_node_request(
        &self,
        from: NodeId,
        reason: ZapReason,
        message: &str,
        peer_weights: &[i64],
    );
}

/// Messaging primitives between stripe members.
#[async_trait]
pub trait GroupManager: Send + Sync {
    fn local_node_id(&self) -> NodeId;

    /// Currently connected peers, excluding the local node.
    fn peers(&self) -> Vec<NodeId>;

    fn register_for_messages(&self, kind: MessageKind, listener: Arc<dyn GroupMessageListener>);

    fn set_zap_node_request_processor(&self, processor: Arc<dyn ZapNodeRequestProcessor>);

    /// Fire-and-forget send.
    fn send_to(&self, node: NodeId, message: GroupMessage) -> TransportResult<()>;

    /// Sends to every peer; returns the peers that could not be reached.
    fn send_all(&self, message: GroupMessage) -> Vec<NodeId> {
        self.peers()
            .into_iter()
            .filter(|peer| self.send_to(*peer, message.clone()).is_err())
            .collect()
    }

    /// Sends and waits for the listener's reply.
    async fn send_to_and_wait(&self, node: NodeId, message: GroupMessage)
        -> TransportResult<GroupMessage>;

    /// Runs `task` in the background on the current tokio runtime.
    fn spawn_task(&self, task: BoxFuture<'static, ()>) -> TransportResult<()> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        runtime.spawn(task);
        Ok(())
    }

    /// Forcibly evicts `node`. Silently dropped if the local zap processor
    /// refuses it.
    fn zap_node(&self, node: NodeId, reason: ZapReason, message: &str);
}
