//! Replicated transaction manager
//!
//! Intake of relayed committed transactions and object-sync batches on a
//! passive. What happens to them depends on the local role:
//!
//! | role          | committed txns             | object sync              |
//! |---------------|----------------------------|--------------------------|
//! | uninitialized | pruned against known ids   | merged with parked deltas|
//! | standby       | applied as-is              | acked and ignored        |
//! | active        | logged and ignored         | logged and ignored       |
//!
//! The role only moves forward: uninitialized, then standby or active.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::collaborators::{
    ObjectSyncTransaction, ServerGlobalTransactionManager, ServerTransactionManager,
    StateChangeListener,
};
use super::errors::{ReplicationError, ReplicationResult};
use super::pending_changes::PendingChangesAccount;
use super::role::StateChangedEvent;
use crate::model::{
    Dna, GlobalTransactionId, NodeId, ObjectIdSet, ServerState, ServerTransaction, ZapReason,
};
use crate::transport::{
    GroupManager, GroupMessage, GroupMessageListener, MessageKind, ObjectSyncMessage,
    ObjectSyncResetMessage, RelayedCommitMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionRole {
    Uninitialized,
    Standby,
    Active,
}

/// Tracks object-sync batches received from the active and acks each one
/// once it has been applied.
pub struct ObjectSyncAckManager {
    group: Arc<dyn GroupManager>,
    pending: Mutex<BTreeMap<u64, NodeId>>,
}

impl ObjectSyncAckManager {
    pub fn new(group: Arc<dyn GroupManager>) -> Self {
        Self {
            group,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn batch_received(&self, from: NodeId, sequence: u64) {
        self.pending.lock().insert(sequence, from);
    }

    pub fn ack_object_sync(&self, sequence: u64) {
        let Some(node) = self.pending.lock().remove(&sequence) else {
            debug!(sequence, "no pending object sync batch, ack dropped");
            return;
        };
        if let Err(e) = self
            .group
            .send_to(node, GroupMessage::ObjectSyncAck { sequence })
        {
            warn!(node = %node, sequence, error = %e, "cannot ack object sync batch");
        }
    }

    /// Forgets every un-acked batch.
    pub fn reset(&self) {
        let dropped = std::mem::take(&mut *self.pending.lock());
        if !dropped.is_empty() {
            info!(dropped = dropped.len(), "object sync acks reset");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// What every delegate can reach.
pub struct Intake {
    transactions: Arc<dyn ServerTransactionManager>,
    gtxm: Arc<dyn ServerGlobalTransactionManager>,
    acks: Arc<ObjectSyncAckManager>,
}

impl Intake {
    fn incoming(&self, from: NodeId, transactions: Vec<ServerTransaction>) {
        if transactions.is_empty() {
            return;
        }
        for txn in &transactions {
            if let Err(e) = self.gtxm.record(txn.id, txn.global_id) {
                error!(txn = %txn.id, error = %e, "cannot record global transaction id");
            }
        }
        self.transactions.incoming_transactions(from, transactions);
    }
}

/// Role-specific handling of passive traffic.
pub trait PassiveTransactionManager: Send {
    fn add_committed_transactions(
        &mut self,
        intake: &Intake,
        from: NodeId,
        transactions: Vec<ServerTransaction>,
    );

    fn add_object_sync_transaction(
        &mut self,
        intake: &Intake,
        from: NodeId,
        transaction: ObjectSyncTransaction,
    );

    fn clear_transactions_below_low_water_mark(
        &mut self,
        intake: &Intake,
        low_water_mark: GlobalTransactionId,
    );

    /// Changes received but not yet handed to the transaction pipeline.
    fn pending_transactions(&self) -> usize;
}

#[derive(Default)]
struct UninitializedTransactions {
    known: ObjectIdSet,
    pending: PendingChangesAccount,
}

impl UninitializedTransactions {
    fn prune(&mut self, txn: ServerTransaction) -> Option<ServerTransaction> {
        let total = txn.changes.len();
        let mut kept = Vec::with_capacity(total);
        let mut new_ids = ObjectIdSet::new();
        for change in &txn.changes {
            let id = change.object_id;
            if !change.is_delta() {
                if self.known.insert(id) {
                    new_ids.insert(id);
                    kept.push(change.clone());
                } else {
                    warn!(object = %id, txn = %txn.id, "ignoring new object already received through sync");
                }
            } else if self.known.contains(&id) {
                kept.push(change.clone());
            } else {
                self.pending.add_to_pending(txn.global_id, change.clone());
            }
        }

        if kept.len() == total {
            Some(txn)
        } else if kept.is_empty() {
            None
        } else {
            Some(ServerTransaction::pruned_from(&txn, kept, new_ids))
        }
    }

    /// Full state of each synced object, each followed by its parked
    /// deltas. Objects already known are dropped.
    fn compound(&mut self, txn: &ObjectSyncTransaction) -> Vec<Dna> {
        let mut changes = Vec::with_capacity(txn.changes.len());
        for change in &txn.changes {
            let id = change.object_id;
            let parked = self.pending.take_pending_changes_for(id);
            if self.known.insert(id) {
                changes.push(change.clone());
                changes.extend(parked);
            } else {
                debug!(object = %id, "ignoring synced object already known");
                if !parked.is_empty() {
                    error!(object = %id, parked = parked.len(), "known object had parked changes");
                }
            }
        }
        changes
    }
}

impl PassiveTransactionManager for UninitializedTransactions {
    fn add_committed_transactions(
        &mut self,
        intake: &Intake,
        from: NodeId,
        transactions: Vec<ServerTransaction>,
    ) {
        let pruned: Vec<_> = transactions
            .into_iter()
            .filter_map(|txn| self.prune(txn))
            .collect();
        intake.incoming(from, pruned);
    }

    fn add_object_sync_transaction(
        &mut self,
        intake: &Intake,
        from: NodeId,
        transaction: ObjectSyncTransaction,
    ) {
        for id in &transaction.deleted {
            self.pending.take_pending_changes_for(*id);
        }
        let changes = self.compound(&transaction);
        let sequence = transaction.sequence;
        if changes.is_empty() {
            warn!(sequence, "every change in object sync batch ignored");
        } else {
            intake.transactions.apply_object_sync(
                from,
                ObjectSyncTransaction {
                    changes,
                    ..transaction
                },
            );
        }
        intake.acks.ack_object_sync(sequence);
    }

    /// Parked changes are kept. The active may have read an object for a
    /// sync batch before one of these deltas applied, so the batch can be
    /// older than the mark and still need them replayed on top.
    fn clear_transactions_below_low_water_mark(
        &mut self,
        intake: &Intake,
        low_water_mark: GlobalTransactionId,
    ) {
        if let Err(e) = intake.gtxm.clear_below_low_water_mark(low_water_mark) {
            error!(%low_water_mark, error = %e, "cannot clear global transaction ids");
        }
    }

    fn pending_transactions(&self) -> usize {
        self.pending.size()
    }
}

struct StandbyTransactions;

impl PassiveTransactionManager for StandbyTransactions {
    fn add_committed_transactions(
        &mut self,
        intake: &Intake,
        from: NodeId,
        transactions: Vec<ServerTransaction>,
    ) {
        intake.incoming(from, transactions);
    }

    fn add_object_sync_transaction(
        &mut self,
        intake: &Intake,
        from: NodeId,
        transaction: ObjectSyncTransaction,
    ) {
        // After a failover the new active may still think this node is
        // uninitialized. Replayed commits already cover these objects.
        warn!(from = %from, sequence = transaction.sequence, "ignoring object sync batch in standby");
        intake.acks.ack_object_sync(transaction.sequence);
    }

    fn clear_transactions_below_low_water_mark(
        &mut self,
        intake: &Intake,
        low_water_mark: GlobalTransactionId,
    ) {
        if let Err(e) = intake.gtxm.clear_below_low_water_mark(low_water_mark) {
            error!(%low_water_mark, error = %e, "cannot clear global transaction ids");
        }
    }

    fn pending_transactions(&self) -> usize {
        0
    }
}

struct ActiveTransactions;

impl PassiveTransactionManager for ActiveTransactions {
    fn add_committed_transactions(
        &mut self,
        _intake: &Intake,
        from: NodeId,
        transactions: Vec<ServerTransaction>,
    ) {
        warn!(from = %from, count = transactions.len(), "ignoring relayed transactions while active");
    }

    fn add_object_sync_transaction(
        &mut self,
        _intake: &Intake,
        from: NodeId,
        transaction: ObjectSyncTransaction,
    ) {
        error!(from = %from, sequence = transaction.sequence, "object sync batch received while active");
    }

    fn clear_transactions_below_low_water_mark(
        &mut self,
        _intake: &Intake,
        low_water_mark: GlobalTransactionId,
    ) {
        warn!(%low_water_mark, "ignoring low-water mark while active");
    }

    fn pending_transactions(&self) -> usize {
        0
    }
}

struct Delegates {
    role: TransactionRole,
    uninitialized: UninitializedTransactions,
    standby: StandbyTransactions,
    active: ActiveTransactions,
}

impl Delegates {
    fn current(&mut self) -> &mut dyn PassiveTransactionManager {
        match self.role {
            TransactionRole::Uninitialized => &mut self.uninitialized,
            TransactionRole::Standby => &mut self.standby,
            TransactionRole::Active => &mut self.active,
        }
    }
}

pub struct ReplicatedTransactionManager {
    group: Arc<dyn GroupManager>,
    intake: Intake,
    delegates: Mutex<Delegates>,
}

impl ReplicatedTransactionManager {
    pub fn new(
        group: Arc<dyn GroupManager>,
        transactions: Arc<dyn ServerTransactionManager>,
        gtxm: Arc<dyn ServerGlobalTransactionManager>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            group: Arc::clone(&group),
            intake: Intake {
                transactions,
                gtxm,
                acks: Arc::new(ObjectSyncAckManager::new(Arc::clone(&group))),
            },
            delegates: Mutex::new(Delegates {
                role: TransactionRole::Uninitialized,
                uninitialized: UninitializedTransactions::default(),
                standby: StandbyTransactions,
                active: ActiveTransactions,
            }),
        });
        for kind in [
            MessageKind::RelayedCommit,
            MessageKind::ObjectSync,
            MessageKind::ObjectSyncReset,
        ] {
            group.register_for_messages(kind, manager.clone());
        }
        manager
    }

    pub fn role(&self) -> TransactionRole {
        self.delegates.lock().role
    }

    pub fn acks(&self) -> &ObjectSyncAckManager {
        &self.intake.acks
    }

    /// Seeds the known object set, e.g. from objects already on disk.
    pub fn init(&self, known: ObjectIdSet) {
        let mut delegates = self.delegates.lock();
        if delegates.role != TransactionRole::Uninitialized {
            info!(known = known.len(), "not seeding known objects outside uninitialized role");
            return;
        }
        delegates.uninitialized.known.extend(known);
    }

    pub fn add_committed_transactions(&self, from: NodeId, transactions: Vec<ServerTransaction>) {
        self.delegates
            .lock()
            .current()
            .add_committed_transactions(&self.intake, from, transactions);
    }

    pub fn add_object_sync_transaction(&self, from: NodeId, transaction: ObjectSyncTransaction) {
        self.delegates
            .lock()
            .current()
            .add_object_sync_transaction(&self.intake, from, transaction);
    }

    pub fn clear_transactions_below_low_water_mark(&self, low_water_mark: GlobalTransactionId) {
        self.delegates
            .lock()
            .current()
            .clear_transactions_below_low_water_mark(&self.intake, low_water_mark);
    }

    pub fn pending_transactions(&self) -> usize {
        self.delegates.lock().current().pending_transactions()
    }

    /// Asks `node` to drop un-acked sync state left by an earlier sync
    /// attempt. A wrong reply evicts the node.
    pub async fn publish_reset_request(&self, node: NodeId) -> ReplicationResult<()> {
        let reply = self
            .group
            .send_to_and_wait(node, GroupMessage::ObjectSyncReset(ObjectSyncResetMessage::Request))
            .await?;
        if reply == GroupMessage::ObjectSyncReset(ObjectSyncResetMessage::Response) {
            return Ok(());
        }
        let message = format!("wrong reply to object sync reset: {:?}", reply);
        error!(node = %node, reply = ?reply, "wrong reply to object sync reset");
        self.group.zap_node(node, ZapReason::ProgramError, &message);
        Err(ReplicationError::unexpected_reply(message))
    }

    fn handle_relayed_commit(&self, from: NodeId, message: RelayedCommitMessage) {
        let mut delegates = self.delegates.lock();
        let delegate = delegates.current();
        delegate.add_committed_transactions(&self.intake, from, message.transactions);
        if !message.low_water_mark.is_null() {
            delegate.clear_transactions_below_low_water_mark(&self.intake, message.low_water_mark);
        }
    }

    fn handle_object_sync(&self, from: NodeId, message: ObjectSyncMessage) {
        self.intake.acks.batch_received(from, message.sequence);
        let transaction = ObjectSyncTransaction {
            sequence: message.sequence,
            changes: message
                .objects
                .into_iter()
                .map(|object| Dna::full(object.id, object.payload))
                .collect(),
            root_names: message.root_names,
            deleted: message.deleted,
        };
        self.add_object_sync_transaction(from, transaction);
    }
}

impl StateChangeListener for ReplicatedTransactionManager {
    fn l2_state_changed(&self, event: &StateChangedEvent) {
        let role = match event.new {
            ServerState::ActiveCoordinator => TransactionRole::Active,
            ServerState::PassiveStandby => TransactionRole::Standby,
            _ => return,
        };
        let mut delegates = self.delegates.lock();
        delegates.uninitialized = UninitializedTransactions::default();
        delegates.role = role;
        info!(role = ?role, "transaction intake role changed");
    }
}

impl GroupMessageListener for ReplicatedTransactionManager {
    fn message_received(&self, from: NodeId, message: GroupMessage) -> Option<GroupMessage> {
        match message {
            GroupMessage::RelayedCommit(m) => self.handle_relayed_commit(from, m),
            GroupMessage::ObjectSync(m) => self.handle_object_sync(from, m),
            GroupMessage::ObjectSyncReset(ObjectSyncResetMessage::Request) => {
                self.intake.acks.reset();
                return Some(GroupMessage::ObjectSyncReset(
                    ObjectSyncResetMessage::Response,
                ));
            }
            other => debug!(from = %from, kind = ?other.kind(), "unexpected message"),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClientTransactionId, ObjectId, ServerTransactionId};
    use crate::persistence::MemoryClusterStatePersistor;
    use crate::replication::collaborators::Completion;
    use crate::replication::gtx::GlobalTransactionStore;
    use crate::transport::LocalNetwork;

    #[derive(Default)]
    struct Recording {
        incoming: Mutex<Vec<ServerTransaction>>,
        synced: Mutex<Vec<ObjectSyncTransaction>>,
    }

    impl ServerTransactionManager for Recording {
        fn incoming_transactions(&self, _: NodeId, transactions: Vec<ServerTransaction>) {
            self.incoming.lock().extend(transactions);
        }
        fn apply_object_sync(&self, _: NodeId, transaction: ObjectSyncTransaction) {
            self.synced.lock().push(transaction);
        }
        fn call_back_on_txns_in_system_completion(&self, callback: Completion) {
            callback();
        }
        fn call_back_on_resent_txns_in_system_completion(&self, callback: Completion) {
            callback();
        }
    }

    fn txn(n: u64, changes: Vec<Dna>) -> ServerTransaction {
        ServerTransaction::new(
            ServerTransactionId::new(NodeId::random(), ClientTransactionId::new(n)),
            GlobalTransactionId::new(n),
            changes,
        )
    }

    fn sync_batch(sequence: u64, ids: &[u64]) -> ObjectSyncTransaction {
        ObjectSyncTransaction {
            sequence,
            changes: ids
                .iter()
                .map(|id| Dna::full(ObjectId::new(*id), vec![]))
                .collect(),
            root_names: BTreeMap::new(),
            deleted: ObjectIdSet::new(),
        }
    }

    fn manager_on(
        network: &Arc<LocalNetwork>,
        node: NodeId,
    ) -> (Arc<ReplicatedTransactionManager>, Arc<Recording>) {
        let group = network.join(node);
        let recording = Arc::new(Recording::default());
        let gtxm = GlobalTransactionStore::load(Arc::new(MemoryClusterStatePersistor::new()))
            .expect("load gtx store");
        let manager = ReplicatedTransactionManager::new(group, recording.clone(), Arc::new(gtxm));
        (manager, recording)
    }

    async fn setup() -> (Arc<ReplicatedTransactionManager>, Arc<Recording>) {
        manager_on(&LocalNetwork::new(), NodeId::random())
    }

    /// Answers every reset request with an ack instead of the reset reply.
    struct WrongReply;

    impl GroupMessageListener for WrongReply {
        fn message_received(&self, _: NodeId, _: GroupMessage) -> Option<GroupMessage> {
            Some(GroupMessage::ObjectSyncAck { sequence: 0 })
        }
    }

    #[tokio::test]
    async fn test_deltas_for_unknown_objects_are_parked() {
        let (manager, recording) = setup().await;
        let a = ObjectId::new(1);
        let b = ObjectId::new(2);
        manager.add_committed_transactions(
            NodeId::random(),
            vec![txn(1, vec![Dna::full(a, vec![]), Dna::delta(b, vec![])])],
        );

        let incoming = recording.incoming.lock();
        assert_eq!(incoming.len(), 1);
        assert!(incoming[0].pruned);
        assert_eq!(incoming[0].changes.len(), 1);
        assert_eq!(manager.pending_transactions(), 1);
    }

    #[tokio::test]
    async fn test_sync_splices_parked_deltas_in_order() {
        let (manager, recording) = setup().await;
        let object = ObjectId::new(9);
        let from = NodeId::random();
        for n in [2, 1, 3] {
            manager.add_committed_transactions(from, vec![txn(n, vec![Dna::delta(object, vec![])])]);
        }
        assert!(recording.incoming.lock().is_empty());

        manager.add_object_sync_transaction(from, sync_batch(1, &[9]));
        let synced = recording.synced.lock();
        let versions: Vec<_> = synced[0].changes.iter().map(|c| c.version).collect();
        assert_eq!(
            versions,
            vec![
                None,
                Some(GlobalTransactionId::new(1)),
                Some(GlobalTransactionId::new(2)),
                Some(GlobalTransactionId::new(3)),
            ]
        );
        assert_eq!(manager.pending_transactions(), 0);
    }

    #[tokio::test]
    async fn test_low_water_mark_keeps_parked_deltas() {
        let (manager, recording) = setup().await;
        let object = ObjectId::new(9);
        let from = NodeId::random();
        manager.add_committed_transactions(from, vec![txn(5, vec![Dna::delta(object, vec![5])])]);
        assert_eq!(manager.pending_transactions(), 1);

        manager.clear_transactions_below_low_water_mark(GlobalTransactionId::new(6));
        assert_eq!(manager.pending_transactions(), 1);

        manager.add_object_sync_transaction(from, sync_batch(1, &[9]));
        let synced = recording.synced.lock();
        assert_eq!(synced[0].changes.len(), 2);
        assert!(!synced[0].changes[0].is_delta());
        assert_eq!(synced[0].changes[1].version, Some(GlobalTransactionId::new(5)));
        assert_eq!(synced[0].changes[1].payload, vec![5]);
    }

    #[tokio::test]
    async fn test_fully_known_sync_batch_is_not_applied() {
        let (manager, recording) = setup().await;
        manager.init([ObjectId::new(5)].into_iter().collect());
        manager.add_object_sync_transaction(NodeId::random(), sync_batch(1, &[5]));
        assert!(recording.synced.lock().is_empty());
    }

    #[tokio::test]
    async fn test_standby_passes_transactions_through() {
        let (manager, recording) = setup().await;
        manager.l2_state_changed(&StateChangedEvent {
            old: ServerState::PassiveUninitialized,
            new: ServerState::PassiveStandby,
        });
        assert_eq!(manager.role(), TransactionRole::Standby);
        manager.add_committed_transactions(
            NodeId::random(),
            vec![txn(1, vec![Dna::delta(ObjectId::new(1), vec![])])],
        );
        assert_eq!(recording.incoming.lock().len(), 1);
        assert!(!recording.incoming.lock()[0].pruned);
    }

    #[tokio::test]
    async fn test_active_ignores_relayed_traffic() {
        let (manager, recording) = setup().await;
        manager.l2_state_changed(&StateChangedEvent {
            old: ServerState::Start,
            new: ServerState::ActiveCoordinator,
        });
        manager.add_committed_transactions(
            NodeId::random(),
            vec![txn(1, vec![Dna::full(ObjectId::new(1), vec![])])],
        );
        manager.add_object_sync_transaction(NodeId::random(), sync_batch(1, &[2]));
        assert!(recording.incoming.lock().is_empty());
        assert!(recording.synced.lock().is_empty());
    }

    #[tokio::test]
    async fn test_reset_request_drops_pending_acks() {
        let network = LocalNetwork::new();
        let active_id = NodeId::random();
        let passive_id = NodeId::random();
        let (active, _) = manager_on(&network, active_id);
        let (passive, _) = manager_on(&network, passive_id);

        passive.acks().batch_received(active_id, 1);
        passive.acks().batch_received(active_id, 2);
        assert_eq!(passive.acks().pending_count(), 2);

        active.publish_reset_request(passive_id).await.unwrap();
        assert_eq!(passive.acks().pending_count(), 0);
        assert!(network.zaps().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_reset_reply_zaps_program_error() {
        let network = LocalNetwork::new();
        let (active, _) = manager_on(&network, NodeId::random());
        let rogue_id = NodeId::random();
        let rogue = network.join(rogue_id);
        rogue.register_for_messages(MessageKind::ObjectSyncReset, Arc::new(WrongReply));

        let err = active.publish_reset_request(rogue_id).await.unwrap_err();
        assert_eq!(err.kind, crate::replication::ReplicationErrorKind::UnexpectedReply);
        let zaps = network.zaps_of(rogue_id);
        assert_eq!(zaps.len(), 1);
        assert_eq!(zaps[0].reason, ZapReason::ProgramError);
    }
}
