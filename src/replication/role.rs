//! Lifecycle Role State Machine
//!
//! A node starts in `START-STATE` and is then told its role:
//! - `ACTIVE-COORDINATOR`: sole write authority
//! - `PASSIVE-UNINITIALIZED`: joined an active, catching up
//! - `PASSIVE-STANDBY`: fully synced, may be promoted
//!
//! Once standby, a node never becomes uninitialized again; that takes a
//! fresh node removal and re-add. An uninitialized passive can never be
//! promoted because it does not hold the whole object graph.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::cluster_state::SharedClusterState;
use super::collaborators::{StateChangeListener, StateManager};
use super::errors::{ReplicationError, ReplicationResult};
use crate::model::{NodeId, ServerState, ZapReason};
use crate::observability::{log_event, Event};
use crate::transport::{GroupManager, GroupMessage, GroupMessageListener};

impl ServerState {
    /// Transition to ACTIVE-COORDINATOR.
    ///
    /// Valid from START (fresh election) or PASSIVE-STANDBY (failover).
    pub fn become_active(self) -> ReplicationResult<Self> {
        match self {
            Self::Start | Self::PassiveStandby | Self::ActiveCoordinator => {
                Ok(Self::ActiveCoordinator)
            }
            Self::PassiveUninitialized => Err(ReplicationError::illegal_transition(
                "an uninitialized passive cannot be promoted",
            )),
        }
    }

    /// Transition to PASSIVE-UNINITIALIZED. Valid only from START.
    pub fn become_passive_uninitialized(self) -> ReplicationResult<Self> {
        match self {
            Self::Start | Self::PassiveUninitialized => Ok(Self::PassiveUninitialized),
            other => Err(ReplicationError::illegal_transition(format!(
                "cannot move from {} to {}",
                other,
                Self::PassiveUninitialized
            ))),
        }
    }

    /// Transition to PASSIVE-STANDBY. Valid only once synced.
    pub fn become_passive_standby(self) -> ReplicationResult<Self> {
        match self {
            Self::PassiveUninitialized | Self::PassiveStandby => Ok(Self::PassiveStandby),
            other => Err(ReplicationError::illegal_transition(format!(
                "cannot move from {} to {}",
                other,
                Self::PassiveStandby
            ))),
        }
    }
}

/// A change of the local lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChangedEvent {
    pub old: ServerState,
    pub new: ServerState,
}

impl StateChangedEvent {
    pub fn moved_to_active(&self) -> bool {
        self.new == ServerState::ActiveCoordinator
    }
}

struct RoleInner {
    state: ServerState,
    active_node: NodeId,
}

/// Owns the local lifecycle state.
///
/// Every transition is persisted through the cluster state before
/// listeners hear about it.
pub struct RoleManager {
    group: Arc<dyn GroupManager>,
    cluster_state: SharedClusterState,
    inner: Mutex<RoleInner>,
    listeners: Mutex<Vec<Arc<dyn StateChangeListener>>>,
}

impl RoleManager {
    pub fn new(group: Arc<dyn GroupManager>, cluster_state: SharedClusterState) -> Self {
        Self {
            group,
            cluster_state,
            inner: Mutex::new(RoleInner {
                state: ServerState::Start,
                active_node: NodeId::NULL,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_state_change_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners.lock().push(listener);
    }

    /// Local node wins the election.
    pub fn start_as_active(&self) -> ReplicationResult<()> {
        let local = self.group.local_node_id();
        self.transition(ServerState::become_active, Some(local))?;
        log_event(
            Event::ActivatedAsCoordinator,
            &[("node", local.to_string().as_str())],
        );
        Ok(())
    }

    /// Local node joins `active` as a new passive.
    pub fn start_as_passive(&self, active: NodeId) -> ReplicationResult<()> {
        self.transition(ServerState::become_passive_uninitialized, Some(active))
    }

    pub fn move_to_passive_standby(&self) -> ReplicationResult<()> {
        self.transition(ServerState::become_passive_standby, None)
    }

    /// Records the node currently believed active.
    pub fn set_active_node(&self, node: NodeId) {
        self.inner.lock().active_node = node;
    }

    fn transition(
        &self,
        step: fn(ServerState) -> ReplicationResult<ServerState>,
        active: Option<NodeId>,
    ) -> ReplicationResult<()> {
        let event = {
            let mut inner = self.inner.lock();
            let old = inner.state;
            let new = step(old)?;
            if let Some(active) = active {
                inner.active_node = active;
            }
            if old == new {
                return Ok(());
            }
            self.cluster_state.lock().set_current_state(new)?;
            inner.state = new;
            StateChangedEvent { old, new }
        };

        info!(old = %event.old, new = %event.new, "lifecycle state changed");
        log_event(
            Event::StateChanged,
            &[("old", event.old.label()), ("new", event.new.label())],
        );
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.l2_state_changed(&event);
        }
        Ok(())
    }
}

impl StateManager for RoleManager {
    fn current_state(&self) -> ServerState {
        self.inner.lock().state
    }

    fn active_node_id(&self) -> NodeId {
        self.inner.lock().active_node
    }

    fn move_node_to_passive_standby(&self, node: NodeId) {
        if let Err(e) = self.group.send_to(node, GroupMessage::MoveToPassiveStandby) {
            warn!(node = %node, error = %e, "failed to send move-to-standby");
            self.group.zap_node(
                node,
                ZapReason::CommunicationError,
                &format!("failed to send move-to-standby: {}", e),
            );
        }
    }
}

impl GroupMessageListener for RoleManager {
    fn message_received(&self, from: NodeId, message: GroupMessage) -> Option<GroupMessage> {
        if let GroupMessage::MoveToPassiveStandby = message {
            let active = self.active_node_id();
            if from != active {
                warn!(from = %from, active = %active, "move-to-standby from a node that is not active, ignoring");
                return None;
            }
            if let Err(e) = self.move_to_passive_standby() {
                warn!(error = %e, "cannot move to passive standby");
            }
        }
        None
    }
}
