//! Replicated object manager
//!
//! Decides which passives may join, streams the object graph to them and
//! relays committed work and GC results.
//!
//! Admission of a new passive:
//! 1. object-list query: the passive reports its state, whether it has ever
//!    begun a sync, how many objects it holds and how much storage it has
//! 2. anything but a clean, empty, uninitialized passive is zapped
//! 3. once resent transactions have replayed, GC is asked to stop; if a
//!    cycle is running the passive waits for it to finish
//! 4. the passive's object-sync intake is reset so nothing left over from an
//!    earlier attempt is acked or applied
//! 5. passive-sync-begin handshake, then batches of objects, then the
//!    completion handshake and the move to standby
//!
//! GC stays disabled while any passive is syncing so no object in a missing
//! set disappears mid-stream without the passive hearing about it.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::cluster_state::SharedClusterState;
use super::collaborators::{
    GarbageCollector, GarbageCollectorEventListener, ObjectStore, ServerTransactionManager,
    StateChangeListener, StateManager,
};
use super::config::HaConfig;
use super::object_state::{ObjectSyncContext, SyncState};
use super::object_state_manager::{L2ObjectStateListener, L2ObjectStateManager};
use super::role::StateChangedEvent;
use super::throttle::SyncTask;
use super::transaction_manager::ReplicatedTransactionManager;
use crate::model::{
    DgcResultContext, GcInfo, GlobalTransactionId, NodeId, ObjectIdSet, ServerState,
    ServerTransaction, ZapReason,
};
use crate::observability::{log_event, Event};
use crate::transport::{
    GcResultMessage, GroupManager, GroupMessage, GroupMessageListener, MessageKind,
    ObjectListSyncMessage, ObjectSyncCompleteMessage, ObjectSyncMessage,
    PassiveSyncBeginMessage, RelayedCommitMessage,
};

#[derive(Default)]
struct GcMonitorState {
    syncing: HashSet<NodeId>,
    queued: Vec<NodeId>,
}

/// Keeps GC disabled while passives sync and queues passives that arrive
/// while a cycle is running.
pub struct GcMonitor {
    gc: Arc<dyn GarbageCollector>,
    state: Mutex<GcMonitorState>,
}

impl GcMonitor {
    pub fn new(gc: Arc<dyn GarbageCollector>) -> Self {
        Self {
            gc,
            state: Mutex::new(GcMonitorState::default()),
        }
    }

    /// Returns true if `node` may start syncing now.
    fn admit(&self, node: NodeId) -> bool {
        let mut state = self.state.lock();
        if state.syncing.contains(&node) || state.queued.contains(&node) {
            debug!(node = %node, "passive already admitted");
            return false;
        }
        if self.gc.request_disable_gc() {
            if state.syncing.is_empty() {
                log_event(Event::GcDisabled, &[]);
            }
            state.syncing.insert(node);
            true
        } else {
            state.queued.push(node);
            log_event(
                Event::PassiveSyncQueued,
                &[("node", node.to_string().as_str())],
            );
            false
        }
    }

    /// Disables GC and hands back every queued passive.
    fn admit_queued(&self) -> Vec<NodeId> {
        let queued = std::mem::take(&mut self.state.lock().queued);
        if queued.is_empty() {
            return queued;
        }
        self.gc.wait_to_disable_gc();
        log_event(Event::GcDisabled, &[]);
        self.state.lock().syncing.extend(queued.iter().copied());
        queued
    }

    pub fn sync_complete_for(&self, node: NodeId) {
        self.state.lock().syncing.remove(&node);
        self.enable_gc_if_idle();
    }

    fn clear(&self, node: NodeId) {
        {
            let mut state = self.state.lock();
            state.syncing.remove(&node);
            state.queued.retain(|queued| *queued != node);
        }
        self.enable_gc_if_idle();
    }

    fn enable_gc_if_idle(&self) {
        let idle = {
            let state = self.state.lock();
            state.syncing.is_empty() && state.queued.is_empty()
        };
        if idle && self.gc.enable_gc() {
            log_event(Event::GcEnabled, &[]);
        }
    }

    pub fn syncing_count(&self) -> usize {
        self.state.lock().syncing.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().queued.len()
    }
}

pub struct ReplicatedObjectManager {
    group: Arc<dyn GroupManager>,
    state_manager: Arc<dyn StateManager>,
    cluster_state: SharedClusterState,
    store: Arc<dyn ObjectStore>,
    gc: Arc<dyn GarbageCollector>,
    transactions: Arc<dyn ServerTransactionManager>,
    txn_manager: Arc<ReplicatedTransactionManager>,
    objects: Arc<L2ObjectStateManager>,
    gc_monitor: GcMonitor,
    batch_size: usize,
    required_capacity: u64,
    sync_started: AtomicBool,
    this: Weak<ReplicatedObjectManager>,
}

impl ReplicatedObjectManager {
    pub fn new(
        group: Arc<dyn GroupManager>,
        state_manager: Arc<dyn StateManager>,
        cluster_state: SharedClusterState,
        store: Arc<dyn ObjectStore>,
        gc: Arc<dyn GarbageCollector>,
        transactions: Arc<dyn ServerTransactionManager>,
        txn_manager: Arc<ReplicatedTransactionManager>,
        config: &HaConfig,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|this: &Weak<Self>| {
            let listener: Weak<dyn L2ObjectStateListener> = this.clone();
            Self {
                group: Arc::clone(&group),
                state_manager,
                cluster_state,
                objects: L2ObjectStateManager::new(
                    Arc::clone(&store),
                    Arc::clone(&transactions),
                    config.max_sync_batches_in_flight,
                    listener,
                ),
                store,
                gc_monitor: GcMonitor::new(Arc::clone(&gc)),
                gc: Arc::clone(&gc),
                transactions,
                txn_manager,
                batch_size: config.sync_batch_size,
                required_capacity: config.storage_capacity_bytes,
                sync_started: AtomicBool::new(false),
                this: this.clone(),
            }
        });

        for kind in [
            MessageKind::ObjectListSync,
            MessageKind::PassiveSyncBegin,
            MessageKind::ObjectSyncAck,
            MessageKind::ObjectSyncComplete,
            MessageKind::GcResult,
        ] {
            group.register_for_messages(kind, manager.clone());
        }
        gc.add_listener(manager.clone());
        manager
    }

    pub fn object_states(&self) -> &L2ObjectStateManager {
        &self.objects
    }

    pub fn gc_monitor(&self) -> &GcMonitor {
        &self.gc_monitor
    }

    pub fn sync_state(&self, node: NodeId) -> Option<SyncState> {
        self.objects.sync_state(node)
    }

    /// Queries every current peer. Called when the local node becomes
    /// active.
    pub fn sync(&self) {
        for peer in self.group.peers() {
            self.query(peer);
        }
    }

    /// Asks `node` for its object-list summary.
    pub fn query(&self, node: NodeId) {
        debug!(node = %node, "querying passive object list");
        if let Err(e) = self
            .group
            .send_to(node, GroupMessage::ObjectListSync(ObjectListSyncMessage::Request))
        {
            warn!(node = %node, error = %e, "cannot query passive");
        }
    }

    /// Forgets `node`, e.g. after it left the group.
    pub fn clear(&self, node: NodeId) {
        let tracked = self.objects.remove_l2(node);
        self.gc_monitor.clear(node);
        if tracked {
            log_event(
                Event::PassiveSyncCancelled,
                &[("node", node.to_string().as_str())],
            );
        }
    }

    /// Relays committed transactions and the current low-water mark to
    /// every passive.
    pub fn relay_transactions(
        &self,
        transactions: Vec<ServerTransaction>,
        low_water_mark: GlobalTransactionId,
    ) {
        let message = GroupMessage::RelayedCommit(RelayedCommitMessage {
            transactions,
            low_water_mark,
        });
        for node in self.group.send_all(message) {
            warn!(node = %node, "cannot relay committed transactions");
            self.group.zap_node(
                node,
                ZapReason::CommunicationError,
                "committed transactions could not be relayed",
            );
        }
    }

    /// Applies a GC result relayed by the active.
    pub fn handle_gc_result(&self, from: NodeId, result: GcResultMessage) {
        if self.state_manager.is_active_coordinator() {
            warn!(from = %from, "GC result received while active, ignoring");
            return;
        }
        debug!(from = %from, iteration = result.info.iteration, deleted = result.deleted.len(), "applying relayed GC result");
        self.gc.delete_garbage(DgcResultContext {
            info: result.info,
            deleted: result.deleted,
        });
    }

    fn reply(&self, node: NodeId, message: GroupMessage) {
        if let Err(e) = self.group.send_to(node, message) {
            warn!(node = %node, error = %e, "cannot send reply");
        }
    }

    fn handle_object_list_sync(&self, from: NodeId, message: ObjectListSyncMessage) {
        match message {
            ObjectListSyncMessage::Request => self.answer_object_list_request(from),
            ObjectListSyncMessage::Response {
                current_state,
                sync_allowed,
                known_object_count,
                storage_capacity,
            } => self.handle_object_list_response(
                from,
                current_state,
                sync_allowed,
                known_object_count,
                storage_capacity,
            ),
            ObjectListSyncMessage::FailedResponse => {
                error!(from = %from, "object list query failed on the passive");
                self.group.zap_node(
                    from,
                    ZapReason::ProgramError,
                    "failed object list response",
                );
            }
        }
    }

    fn answer_object_list_request(&self, from: NodeId) {
        if self.state_manager.is_active_coordinator() {
            error!(from = %from, "object list query received while active");
            log_event(
                Event::SplitBrainDetected,
                &[("peer", from.to_string().as_str())],
            );
            self.reply(
                from,
                GroupMessage::ObjectListSync(ObjectListSyncMessage::FailedResponse),
            );
            self.group.zap_node(
                from,
                ZapReason::SplitBrain,
                "queried the object list of a node that is itself active",
            );
            return;
        }

        let this = self.this.clone();
        self.transactions
            .call_back_on_txns_in_system_completion(Box::new(move || {
                let Some(manager) = this.upgrade() else {
                    return;
                };
                let sync_allowed = !manager.sync_started.load(Ordering::SeqCst)
                    && manager.cluster_state.lock().is_db_clean();
                let response = ObjectListSyncMessage::Response {
                    current_state: manager.state_manager.current_state(),
                    sync_allowed,
                    known_object_count: manager.store.object_count(),
                    storage_capacity: manager.store.storage_capacity(),
                };
                manager.reply(from, GroupMessage::ObjectListSync(response));
            }));
    }

    fn handle_object_list_response(
        &self,
        from: NodeId,
        current_state: ServerState,
        sync_allowed: bool,
        known_object_count: u64,
        storage_capacity: u64,
    ) {
        if self.objects.sync_state(from).is_some() {
            debug!(node = %from, "passive already syncing, ignoring object list");
            return;
        }
        if current_state == ServerState::PassiveStandby {
            self.group.zap_node(
                from,
                ZapReason::NodeJoinedWithDirtyDb,
                "a standby joined an active that did not sync it",
            );
            return;
        }
        if !sync_allowed || known_object_count > 0 {
            self.group.zap_node(
                from,
                ZapReason::NodeJoinedWithDirtyDb,
                &format!(
                    "passive joined with existing data (sync allowed: {}, objects: {})",
                    sync_allowed, known_object_count
                ),
            );
            return;
        }
        if self.required_capacity > 0 && storage_capacity < self.required_capacity {
            self.group.zap_node(
                from,
                ZapReason::InsufficientResources,
                &format!(
                    "passive has {} bytes of storage, {} required",
                    storage_capacity, self.required_capacity
                ),
            );
            return;
        }

        let this = self.this.clone();
        self.transactions
            .call_back_on_resent_txns_in_system_completion(Box::new(move || {
                if let Some(manager) = this.upgrade() {
                    manager.admit(from);
                }
            }));
    }

    fn admit(&self, node: NodeId) {
        if self.gc_monitor.admit(node) {
            self.begin_passive_sync(node);
        }
    }

    fn begin_passive_sync(&self, node: NodeId) {
        log_event(
            Event::PassiveSyncAdmitted,
            &[("node", node.to_string().as_str())],
        );
        let this = self.this.clone();
        let txn_manager = Arc::clone(&self.txn_manager);
        let spawned = self.group.spawn_task(Box::pin(async move {
            let reset = txn_manager.publish_reset_request(node).await;
            let Some(manager) = this.upgrade() else {
                return;
            };
            match reset {
                Ok(()) => manager.send_passive_sync_begin(node),
                Err(e) => {
                    warn!(node = %node, error = %e, "cannot reset passive object sync intake");
                    manager.gc_monitor.clear(node);
                }
            }
        }));
        if let Err(e) = spawned {
            warn!(node = %node, error = %e, "cannot reset passive object sync intake");
            self.gc_monitor.clear(node);
        }
    }

    fn send_passive_sync_begin(&self, node: NodeId) {
        if let Err(e) = self.group.send_to(
            node,
            GroupMessage::PassiveSyncBegin(PassiveSyncBeginMessage::Request),
        ) {
            warn!(node = %node, error = %e, "cannot begin passive sync");
            self.gc_monitor.clear(node);
        }
    }

    fn handle_passive_sync_begin(&self, from: NodeId, message: PassiveSyncBeginMessage) {
        match message {
            PassiveSyncBeginMessage::Request => {
                if self.state_manager.is_active_coordinator() {
                    error!(from = %from, "asked to begin passive sync while active");
                    self.reply(
                        from,
                        GroupMessage::PassiveSyncBegin(PassiveSyncBeginMessage::Error),
                    );
                    return;
                }
                if self.sync_started.swap(true, Ordering::SeqCst) {
                    warn!(from = %from, "passive sync already begun, ignoring request");
                    return;
                }
                // A sync cut short leaves a partial graph behind.
                if let Err(e) = self.cluster_state.lock().set_db_clean(false) {
                    error!(error = %e, "cannot mark database dirty");
                }
                let current_state = self.state_manager.current_state();
                self.reply(
                    from,
                    GroupMessage::PassiveSyncBegin(PassiveSyncBeginMessage::Response {
                        current_state,
                    }),
                );
            }
            PassiveSyncBeginMessage::Response { current_state } => {
                if self.objects.add_l2(from, current_state) {
                    log_event(
                        Event::PassiveSyncStarted,
                        &[("node", from.to_string().as_str())],
                    );
                } else {
                    self.gc_monitor.sync_complete_for(from);
                }
            }
            PassiveSyncBeginMessage::Error => {
                self.group.zap_node(
                    from,
                    ZapReason::ProgramError,
                    "passive refused to begin sync",
                );
            }
        }
    }

    fn sync_task(&self, node: NodeId) -> SyncTask {
        let this = self.this.clone();
        Arc::new(move || match this.upgrade() {
            Some(manager) => manager.send_object_batch(node),
            None => false,
        })
    }

    /// Streams one batch to `node`. Returns false when nothing was sent.
    fn send_object_batch(&self, node: NodeId) -> bool {
        let Some(mut ctx) = self
            .objects
            .get_some_objects_to_sync_context(node, self.batch_size)
        else {
            return false;
        };
        self.fill(&mut ctx);

        let root_names: BTreeMap<_, _> = ctx
            .root_names
            .iter()
            .filter(|(_, id)| ctx.synced.contains(id))
            .map(|(name, id)| (name.clone(), *id))
            .collect();
        let message = ObjectSyncMessage {
            sequence: ctx.sequence,
            objects: std::mem::take(&mut ctx.objects),
            root_names,
            deleted: ctx.deleted.clone(),
        };
        debug!(
            node = %node,
            sequence = message.sequence,
            objects = message.objects.len(),
            deleted = message.deleted.len(),
            retry = ctx.not_synced.len(),
            "sending object sync batch"
        );

        if let Err(e) = self.group.send_to(node, GroupMessage::ObjectSync(message)) {
            warn!(node = %node, error = %e, "cannot send object sync batch");
            self.group.zap_node(
                node,
                ZapReason::CommunicationError,
                &format!("object sync batch not delivered: {}", e),
            );
            self.clear(node);
            return false;
        }
        if let Err(e) = self.objects.close(ctx) {
            warn!(node = %node, error = %e, "cannot close object sync batch");
            return false;
        }
        true
    }

    fn fill(&self, ctx: &mut ObjectSyncContext) {
        let requested: Vec<_> = ctx.requested.iter().copied().collect();
        for id in requested {
            match self.store.lookup(id) {
                Ok(Some(object)) => ctx.object_synced(object),
                Ok(None) => ctx.object_deleted(id),
                Err(e) => {
                    debug!(object = %id, error = %e, "object lookup failed, will retry");
                    ctx.object_not_synced(id);
                }
            }
        }
    }

    fn handle_sync_complete(&self, from: NodeId, message: ObjectSyncCompleteMessage) {
        match message {
            ObjectSyncCompleteMessage::Complete { synced } => {
                info!(from = %from, synced, "object sync complete, acking once transactions settle");
                let this = self.this.clone();
                self.transactions
                    .call_back_on_txns_in_system_completion(Box::new(move || {
                        if let Some(manager) = this.upgrade() {
                            manager.reply(
                                from,
                                GroupMessage::ObjectSyncComplete(ObjectSyncCompleteMessage::Ack),
                            );
                        }
                    }));
            }
            ObjectSyncCompleteMessage::Ack => {
                let progress = self.objects.sync_progress(from).unwrap_or((0, 0));
                log_event(
                    Event::PassiveSyncComplete,
                    &[
                        ("node", from.to_string().as_str()),
                        ("synced", progress.0.to_string().as_str()),
                    ],
                );
                self.state_manager.move_node_to_passive_standby(from);
                self.gc_monitor.sync_complete_for(from);
            }
        }
    }

    fn gc_cycle_settled(&self, info: GcInfo, deleted: ObjectIdSet) {
        if !self.state_manager.is_active_coordinator() {
            return;
        }
        if !deleted.is_empty() {
            let count = deleted.len();
            let unreachable = self
                .group
                .send_all(GroupMessage::GcResult(GcResultMessage { info, deleted }));
            for node in unreachable {
                warn!(node = %node, "cannot relay GC result");
            }
            log_event(
                Event::GcResultRelayed,
                &[
                    ("iteration", info.iteration.to_string().as_str()),
                    ("deleted", count.to_string().as_str()),
                ],
            );
        }
        for node in self.gc_monitor.admit_queued() {
            self.begin_passive_sync(node);
        }
    }
}

impl L2ObjectStateListener for ReplicatedObjectManager {
    fn missing_objects_for(&self, node: NodeId, missing: usize) {
        if missing == 0 {
            self.object_sync_complete_for(node);
            return;
        }
        if let Err(e) = self.objects.initiate_sync(node, self.sync_task(node)) {
            warn!(node = %node, error = %e, "cannot start object sync");
        }
    }

    fn object_sync_complete_for(&self, node: NodeId) {
        let synced = self
            .objects
            .sync_progress(node)
            .map(|(synced, _)| synced)
            .unwrap_or(0);
        info!(node = %node, synced, "all objects synced");
        self.reply(
            node,
            GroupMessage::ObjectSyncComplete(ObjectSyncCompleteMessage::Complete { synced }),
        );
    }
}

impl GarbageCollectorEventListener for ReplicatedObjectManager {
    fn garbage_collector_cycle_completed(&self, info: GcInfo, deleted: ObjectIdSet) {
        let this = self.this.clone();
        self.transactions
            .call_back_on_txns_in_system_completion(Box::new(move || {
                if let Some(manager) = this.upgrade() {
                    manager.gc_cycle_settled(info, deleted);
                }
            }));
    }
}

impl StateChangeListener for ReplicatedObjectManager {
    fn l2_state_changed(&self, event: &StateChangedEvent) {
        if event.new == ServerState::PassiveStandby {
            if let Err(e) = self.cluster_state.lock().set_db_clean(true) {
                error!(error = %e, "cannot mark database clean");
            }
        }
    }
}

impl GroupMessageListener for ReplicatedObjectManager {
    fn message_received(&self, from: NodeId, message: GroupMessage) -> Option<GroupMessage> {
        match message {
            GroupMessage::ObjectListSync(m) => self.handle_object_list_sync(from, m),
            GroupMessage::PassiveSyncBegin(m) => self.handle_passive_sync_begin(from, m),
            GroupMessage::ObjectSyncAck { sequence } => {
                self.objects.receive_sync_ack(from, sequence)
            }
            GroupMessage::ObjectSyncComplete(m) => self.handle_sync_complete(from, m),
            GroupMessage::GcResult(m) => self.handle_gc_result(from, m),
            other => debug!(from = %from, kind = ?other.kind(), "unexpected message"),
        }
        None
    }
}
