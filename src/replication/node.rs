//! Wiring of one stripe member
//!
//! Builds every replication component for a node from its collaborators and
//! registers them with each other and with the group. Several nodes can be
//! built in one process, each over its own group manager.

use std::sync::Arc;

use tracing::info;

use super::cluster_state::{ClusterState, SharedClusterState};
use super::cluster_state_manager::ReplicatedClusterStateManager;
use super::collaborators::{GarbageCollector, ObjectStore, ServerTransactionManager, StateManager};
use super::config::HaConfig;
use super::errors::ReplicationResult;
use super::gtx::GlobalTransactionStore;
use super::object_manager::ReplicatedObjectManager;
use super::role::RoleManager;
use super::transaction_manager::ReplicatedTransactionManager;
use crate::arbitration::{HaZapNodeRequestProcessor, NodeTerminator, WeightGeneratorFactory};
use crate::model::NodeId;
use crate::observability::{log_event, Event};
use crate::persistence::ClusterStatePersistor;
use crate::transport::{GroupManager, MessageKind};

/// Everything a node needs from outside the replication core.
pub struct HaCollaborators {
    pub persistor: Arc<dyn ClusterStatePersistor>,
    pub store: Arc<dyn ObjectStore>,
    pub gc: Arc<dyn GarbageCollector>,
    pub transactions: Arc<dyn ServerTransactionManager>,
    pub terminator: Arc<dyn NodeTerminator>,
    pub weights: WeightGeneratorFactory,
}

pub struct HaNode {
    pub group: Arc<dyn GroupManager>,
    pub cluster_state: SharedClusterState,
    pub roles: Arc<RoleManager>,
    pub global_transactions: Arc<GlobalTransactionStore>,
    pub cluster_state_manager: Arc<ReplicatedClusterStateManager>,
    pub object_manager: Arc<ReplicatedObjectManager>,
    pub transaction_manager: Arc<ReplicatedTransactionManager>,
    pub zap_processor: Arc<HaZapNodeRequestProcessor>,
}

impl HaNode {
    pub fn new(
        group: Arc<dyn GroupManager>,
        config: &HaConfig,
        collaborators: HaCollaborators,
    ) -> ReplicationResult<Self> {
        let HaCollaborators {
            persistor,
            store,
            gc,
            transactions,
            terminator,
            weights,
        } = collaborators;

        let cluster_state = ClusterState::shared(Arc::clone(&persistor), config.group())?;
        let global_transactions = Arc::new(GlobalTransactionStore::load(persistor)?);

        let roles = Arc::new(RoleManager::new(
            Arc::clone(&group),
            Arc::clone(&cluster_state),
        ));
        group.register_for_messages(MessageKind::StateChange, roles.clone());
        let state_manager: Arc<dyn StateManager> = roles.clone();

        let cluster_state_manager = ReplicatedClusterStateManager::new(
            Arc::clone(&group),
            Arc::clone(&cluster_state),
            Arc::clone(&state_manager),
            Arc::clone(&terminator),
            config.broadcast_timeout(),
        );

        let transaction_manager = ReplicatedTransactionManager::new(
            Arc::clone(&group),
            Arc::clone(&transactions),
            global_transactions.clone(),
        );
        roles.add_state_change_listener(transaction_manager.clone());

        let object_manager = ReplicatedObjectManager::new(
            Arc::clone(&group),
            Arc::clone(&state_manager),
            Arc::clone(&cluster_state),
            store,
            gc,
            transactions,
            Arc::clone(&transaction_manager),
            config,
        );
        roles.add_state_change_listener(object_manager.clone());

        let zap_processor = Arc::new(HaZapNodeRequestProcessor::new(
            Arc::clone(&group),
            state_manager,
            Arc::clone(&cluster_state),
            Arc::new(weights),
            terminator,
        ));
        group.set_zap_node_request_processor(zap_processor.clone());

        log_event(
            Event::NodeStarted,
            &[("node", group.local_node_id().to_string().as_str())],
        );
        Ok(Self {
            group,
            cluster_state,
            roles,
            global_transactions,
            cluster_state_manager,
            object_manager,
            transaction_manager,
            zap_processor,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.group.local_node_id()
    }

    /// Takes over as active: persists the role, publishes the full cluster
    /// state and queries every peer for admission.
    pub async fn start_as_active(&self) -> ReplicationResult<()> {
        self.roles.start_as_active()?;
        self.cluster_state_manager.go_active_and_sync_state().await?;
        self.object_manager.sync();
        Ok(())
    }

    /// Joins `active` as a new passive.
    pub fn start_as_passive(&self, active: NodeId) -> ReplicationResult<()> {
        self.roles.start_as_passive(active)
    }

    /// A peer joined the group. On the active it receives the cluster state
    /// and is then queried for admission.
    pub async fn node_joined(&self, node: NodeId) {
        if !self.roles.is_active_coordinator() {
            return;
        }
        info!(node = %node, "peer joined");
        self.cluster_state_manager.publish_cluster_state(node).await;
        self.object_manager.query(node);
    }

    /// A peer left the group.
    pub fn node_left(&self, node: NodeId) {
        info!(node = %node, "peer left");
        self.object_manager.clear(node);
    }
}
