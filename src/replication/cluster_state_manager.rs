//! Replicated cluster state manager
//!
//! On the active, every cluster-state change is pushed to the passives and
//! the publishing call resolves only once each target has acknowledged or
//! been evicted. A non-success reply evicts with `ProgramError`; a transport
//! failure or timeout evicts with `CommunicationError`. The other targets
//! are unaffected either way.
//!
//! On a passive, incoming state is applied and synced to disk before the
//! acknowledgement goes out. A node that believes it is active refuses the
//! message and evicts the sender: two actives means split brain.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::cluster_state::SharedClusterState;
use super::collaborators::{ConnectionEventListener, StateManager};
use super::errors::ReplicationResult;
use crate::arbitration::NodeTerminator;
use crate::model::{ConnectionId, NodeId, ServerState, ZapReason};
use crate::observability::{log_event, Event};
use crate::transport::{
    send_all_and_wait, ClusterStateMessage, GroupManager, GroupMessage, GroupMessageListener,
    MessageKind,
};

pub struct ReplicatedClusterStateManager {
    group: Arc<dyn GroupManager>,
    cluster_state: SharedClusterState,
    state_manager: Arc<dyn StateManager>,
    terminator: Arc<dyn NodeTerminator>,
    connection_listeners: Mutex<Vec<Arc<dyn ConnectionEventListener>>>,
    timeout: Duration,
}

impl ReplicatedClusterStateManager {
    pub fn new(
        group: Arc<dyn GroupManager>,
        cluster_state: SharedClusterState,
        state_manager: Arc<dyn StateManager>,
        terminator: Arc<dyn NodeTerminator>,
        timeout: Duration,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            group: Arc::clone(&group),
            cluster_state,
            state_manager,
            terminator,
            connection_listeners: Mutex::new(Vec::new()),
            timeout,
        });
        group.register_for_messages(MessageKind::ClusterState, manager.clone());
        manager
    }

    pub fn add_connection_event_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        self.connection_listeners.lock().push(listener);
    }

    /// Generates the stripe id if absent, persists the active role and
    /// pushes the full state to every peer.
    pub async fn go_active_and_sync_state(&self) -> ReplicationResult<()> {
        let snapshot = {
            let mut state = self.cluster_state.lock();
            state.generate_stripe_id_if_needed()?;
            state.set_current_state(ServerState::ActiveCoordinator)?;
            state.sync_sequences_to_disk()?;
            state.snapshot()
        };
        let peers = self.group.peers();
        info!(peers = peers.len(), stripe_id = %snapshot.stripe_id, "publishing full cluster state");
        self.publish(&peers, ClusterStateMessage::CompleteState(snapshot))
            .await;
        log_event(Event::ClusterStatePublished, &[]);
        Ok(())
    }

    /// Pushes the full state to one newly joined passive.
    pub async fn publish_cluster_state(&self, node: NodeId) {
        let snapshot = self.cluster_state.lock().snapshot();
        self.publish(&[node], ClusterStateMessage::CompleteState(snapshot))
            .await;
    }

    pub async fn publish_next_available_object_id(&self, next: u64) -> ReplicationResult<()> {
        {
            let mut state = self.cluster_state.lock();
            state.set_next_available_object_id(next);
            state.sync_object_id_to_disk()?;
        }
        self.publish_to_peers(ClusterStateMessage::NextAvailableObjectId(next))
            .await;
        Ok(())
    }

    pub async fn publish_next_available_global_transaction_id(
        &self,
        next: u64,
    ) -> ReplicationResult<()> {
        {
            let mut state = self.cluster_state.lock();
            state.set_next_available_global_txn_id(next);
            state.sync_global_txn_id_to_disk()?;
        }
        self.publish_to_peers(ClusterStateMessage::NextAvailableGlobalTxnId(next))
            .await;
        Ok(())
    }

    pub async fn publish_next_available_connection_id(&self, next: u64) -> ReplicationResult<()> {
        {
            let mut state = self.cluster_state.lock();
            state.set_next_available_connection_id(next);
            state.sync_connection_id_to_disk()?;
        }
        self.publish_to_peers(ClusterStateMessage::NextAvailableConnectionId(next))
            .await;
        Ok(())
    }

    pub async fn publish_next_available_gc_iteration_id(&self, next: u64) -> ReplicationResult<()> {
        {
            let mut state = self.cluster_state.lock();
            state.set_next_available_gc_iteration_id(next);
            state.sync_gc_iteration_id_to_disk()?;
        }
        self.publish_to_peers(ClusterStateMessage::NextAvailableGcIterationId(next))
            .await;
        Ok(())
    }

    pub async fn connection_created(&self, connection: ConnectionId) -> ReplicationResult<()> {
        self.cluster_state.lock().add_new_connection(connection)?;
        self.publish_to_peers(ClusterStateMessage::ConnectionCreated(connection))
            .await;
        Ok(())
    }

    pub async fn connection_destroyed(&self, connection: ConnectionId) -> ReplicationResult<()> {
        self.cluster_state.lock().remove_connection(connection)?;
        self.publish_to_peers(ClusterStateMessage::ConnectionDestroyed(connection))
            .await;
        Ok(())
    }

    async fn publish_to_peers(&self, message: ClusterStateMessage) {
        let peers = self.group.peers();
        self.publish(&peers, message).await;
    }

    async fn publish(&self, nodes: &[NodeId], message: ClusterStateMessage) {
        if nodes.is_empty() {
            return;
        }
        let message = GroupMessage::ClusterState(message);
        let replies = send_all_and_wait(self.group.as_ref(), nodes, &message, self.timeout).await;
        for (node, reply) in replies {
            match reply {
                Ok(GroupMessage::ClusterState(ClusterStateMessage::OperationSuccess)) => {
                    debug!(node = %node, "cluster state acknowledged");
                }
                Ok(other) => {
                    error!(node = %node, reply = ?other, "cluster state refused");
                    self.group.zap_node(
                        node,
                        ZapReason::ProgramError,
                        &format!("unexpected reply to cluster state: {:?}", other),
                    );
                }
                Err(e) => {
                    error!(node = %node, error = %e, "cluster state not delivered");
                    self.group.zap_node(
                        node,
                        ZapReason::CommunicationError,
                        &format!("cluster state not delivered: {}", e),
                    );
                }
            }
        }
    }

    fn fire_connection_event(&self, connection: ConnectionId, created: bool) {
        let listeners = self.connection_listeners.lock().clone();
        for listener in listeners {
            if created {
                listener.connection_created(connection);
            } else {
                listener.connection_destroyed(connection);
            }
        }
    }

    /// Applies a state message on a passive.
    fn apply(&self, message: ClusterStateMessage) -> ClusterStateMessage {
        let outcome = {
            let mut state = self.cluster_state.lock();
            match &message {
                ClusterStateMessage::CompleteState(snapshot) => state.apply_snapshot(snapshot),
                ClusterStateMessage::NextAvailableObjectId(next) => {
                    state.set_next_available_object_id(*next);
                    state.sync_object_id_to_disk()
                }
                ClusterStateMessage::NextAvailableGlobalTxnId(next) => {
                    state.set_next_available_global_txn_id(*next);
                    state.sync_global_txn_id_to_disk()
                }
                ClusterStateMessage::NextAvailableConnectionId(next) => {
                    state.set_next_available_connection_id(*next);
                    state.sync_connection_id_to_disk()
                }
                ClusterStateMessage::NextAvailableGcIterationId(next) => {
                    state.set_next_available_gc_iteration_id(*next);
                    state.sync_gc_iteration_id_to_disk()
                }
                ClusterStateMessage::ConnectionCreated(c) => state.add_new_connection(*c).map(|_| ()),
                ClusterStateMessage::ConnectionDestroyed(c) => {
                    state.remove_connection(*c).map(|_| ())
                }
                ClusterStateMessage::OperationSuccess
                | ClusterStateMessage::OperationFailed { .. } => {
                    return ClusterStateMessage::OperationFailed {
                        reason: "response routed as a request".to_string(),
                    };
                }
            }
        };

        match outcome {
            Ok(()) => {
                match message {
                    ClusterStateMessage::ConnectionCreated(c) => self.fire_connection_event(c, true),
                    ClusterStateMessage::ConnectionDestroyed(c) => {
                        self.fire_connection_event(c, false)
                    }
                    _ => {}
                }
                ClusterStateMessage::OperationSuccess
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "cannot apply cluster state, terminating");
                self.terminator.terminate(ZapReason::ProgramError, &e.message);
                ClusterStateMessage::OperationFailed { reason: e.message }
            }
            Err(e) => {
                warn!(error = %e, "failed to apply cluster state");
                ClusterStateMessage::OperationFailed { reason: e.message }
            }
        }
    }
}

impl GroupMessageListener for ReplicatedClusterStateManager {
    fn message_received(&self, from: NodeId, message: GroupMessage) -> Option<GroupMessage> {
        let GroupMessage::ClusterState(message) = message else {
            return None;
        };

        if self.state_manager.is_active_coordinator() {
            error!(from = %from, "received cluster state while active");
            log_event(
                Event::SplitBrainDetected,
                &[("peer", from.to_string().as_str())],
            );
            self.group.zap_node(
                from,
                ZapReason::SplitBrain,
                "sent cluster state to a node that is itself active",
            );
            return Some(GroupMessage::ClusterState(
                ClusterStateMessage::OperationFailed {
                    reason: "recipient is active".to_string(),
                },
            ));
        }

        Some(GroupMessage::ClusterState(self.apply(message)))
    }
}
