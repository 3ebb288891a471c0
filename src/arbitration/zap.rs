//! Zap request processing and node termination
//!
//! Every eviction passes through [`HaZapNodeRequestProcessor`] on both ends.
//! Outgoing zaps are only honoured from the active coordinator, or from a
//! node reporting that the node it believed active has become unreachable.
//! Incoming zaps either start split-brain arbitration (local node is active)
//! or end the local node (local node is passive).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

use super::generators::WeightGeneratorFactory;
use super::weights::{resolve_split_brain, SplitBrainVerdict, WeightVector};
use crate::model::{NodeId, ZapReason};
use crate::observability::{log_event, Event};
use crate::replication::{SharedClusterState, StateManager};
use crate::transport::{GroupManager, ZapNodeRequestProcessor};

/// Ends the local node's participation in the stripe.
///
/// Termination is final: implementations must not return control to a
/// state where the node keeps serving.
pub trait NodeTerminator: Send + Sync {
    fn terminate(&self, reason: ZapReason, message: &str);
}

/// Exits the process with a non-zero status.
#[derive(Debug, Default)]
pub struct ProcessTerminator;

impl NodeTerminator for ProcessTerminator {
    fn terminate(&self, reason: ZapReason, message: &str) {
        error!(reason = %reason, detail = message, "terminating node");
        std::process::exit(1);
    }
}

/// Observer of zap outcomes.
pub trait ZapEventListener: Send + Sync {
    /// Local node lost arbitration against `peer` and is terminating.
    fn fire_split_brain_event(&self, peer: NodeId);

    /// Local node won arbitration; `peer` is being told to back off.
    fn fire_back_off_event(&self, peer: NodeId);

    /// Local (passive) node was zapped by `from`.
    fn fire_node_zapped_event(&self, from: NodeId, reason: ZapReason);
}

pub struct HaZapNodeRequestProcessor {
    group: Arc<dyn GroupManager>,
    state_manager: Arc<dyn StateManager>,
    cluster_state: SharedClusterState,
    weights: Arc<WeightGeneratorFactory>,
    terminator: Arc<dyn NodeTerminator>,
    listeners: Mutex<Vec<Arc<dyn ZapEventListener>>>,
    terminated: AtomicBool,
}

impl HaZapNodeRequestProcessor {
    pub fn new(
        group: Arc<dyn GroupManager>,
        state_manager: Arc<dyn StateManager>,
        cluster_state: SharedClusterState,
        weights: Arc<WeightGeneratorFactory>,
        terminator: Arc<dyn NodeTerminator>,
    ) -> Self {
        Self {
            group,
            state_manager,
            cluster_state,
            weights,
            terminator,
            listeners: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn add_zap_event_listener(&self, listener: Arc<dyn ZapEventListener>) {
        self.listeners.lock().push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn ZapEventListener>> {
        self.listeners.lock().clone()
    }

    fn terminate_once(&self, reason: ZapReason, message: &str) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.terminator.terminate(reason, message);
    }

    fn handle_split_brain(&self, from: NodeId, reason: ZapReason, message: &str, peer: &[i64]) {
        let local = self.group.local_node_id();
        let local_weights = self.weights.generate_weight_sequence();
        let peer_weights = WeightVector::new(peer.to_vec());
        let local_str = local.to_string();
        let peer_str = from.to_string();
        log_event(
            Event::SplitBrainDetected,
            &[("local", local_str.as_str()), ("peer", peer_str.as_str())],
        );

        match resolve_split_brain(local, &local_weights, from, &peer_weights) {
            SplitBrainVerdict::Continue => {
                warn!(
                    peer = %from,
                    local_weights = %local_weights,
                    peer_weights = %peer_weights,
                    "won split-brain arbitration, asking peer to back off"
                );
                log_event(Event::ArbitrationWon, &[("peer", peer_str.as_str())]);
                for l in self.listeners() {
                    l.fire_back_off_event(from);
                }
                self.group.zap_node(
                    from,
                    ZapReason::SplitBrain,
                    &format!("{} won split-brain arbitration with {}", local, local_weights),
                );
            }
            SplitBrainVerdict::Terminate => {
                error!(
                    peer = %from,
                    local_weights = %local_weights,
                    peer_weights = %peer_weights,
                    "lost split-brain arbitration"
                );
                log_event(Event::ArbitrationLost, &[("peer", peer_str.as_str())]);
                for l in self.listeners() {
                    l.fire_split_brain_event(from);
                }
                self.terminate_once(reason, message);
            }
        }
    }
}

impl ZapNodeRequestProcessor for HaZapNodeRequestProcessor {
    fn accept_outgoing_zap_node_request(
        &self,
        node: NodeId,
        reason: ZapReason,
        message: &str,
    ) -> bool {
        if self.state_manager.is_active_coordinator() {
            return true;
        }
        let active = self.state_manager.active_node_id();
        if (active.is_null() || active == node) && reason == ZapReason::CommunicationToActiveError
        {
            return true;
        }
        warn!(
            node = %node,
            reason = %reason,
            active = %active,
            detail = message,
            "not allowed to zap from a non-active node"
        );
        false
    }

    fn current_node_weights(&self) -> Vec<i64> {
        self.weights.generate_weight_sequence().into_inner()
    }

    fn incoming_zap_node_request(
        &self,
        from: NodeId,
        reason: ZapReason,
        message: &str,
        peer_weights: &[i64],
    ) {
        if self.state_manager.is_active_coordinator() {
            self.handle_split_brain(from, reason, message, peer_weights);
            return;
        }

        error!(from = %from, reason = %reason, detail = message, "zapped by peer");
        if reason.marks_database_dirty() {
            if let Err(e) = self.cluster_state.lock().set_db_clean(false) {
                error!(error = %e, "failed to mark database dirty");
            }
        }
        for l in self.listeners() {
            l.fire_node_zapped_event(from, reason);
        }
        log_event(
            Event::LocalNodeTerminated,
            &[("from", from.to_string().as_str()), ("reason", reason.as_str())],
        );
        self.terminate_once(reason, message);
    }
}
