//! Shared doubles for the multi-node scenarios.
//!
//! Every node runs over one [`LocalNetwork`] with in-memory persistence.
//! The collaborators record what the replication core asked of them into a
//! per-node journal so tests can assert on ordering across components.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use stripekeeper::arbitration::{NodeTerminator, WeightGenerator, WeightGeneratorFactory};
use stripekeeper::model::{
    ClientTransactionId, DgcResultContext, GcInfo, NodeId, ObjectId, ObjectIdSet, ObjectSnapshot,
    ServerTransaction, ServerTransactionId, ZapReason,
};
use stripekeeper::persistence::MemoryClusterStatePersistor;
use stripekeeper::replication::{
    Completion, GarbageCollector, GarbageCollectorEventListener, HaCollaborators, HaConfig, HaNode,
    ObjectStore, ObjectSyncTransaction, ReplicationError, ReplicationResult,
    ServerTransactionManager, TransactionTracker,
};
use stripekeeper::transport::LocalNetwork;

// =============================================================================
// Journal
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Committed(Vec<ServerTransaction>),
    ObjectSync(ObjectSyncTransaction),
    GcResult(DgcResultContext),
}

pub type Journal = Arc<Mutex<Vec<Entry>>>;

// =============================================================================
// Object store
// =============================================================================

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<ObjectId, Vec<u8>>>,
    roots: Mutex<BTreeMap<String, ObjectId>>,
    /// Remaining lookup failures per object.
    failing: Mutex<HashMap<ObjectId, usize>>,
    /// Still listed, but gone by the time they are looked up.
    vanished: Mutex<ObjectIdSet>,
    capacity: u64,
}

impl MemoryObjectStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Store holding objects `1..=count`.
    pub fn with_objects(count: u64) -> Self {
        let store = Self::new(u64::MAX);
        for id in 1..=count {
            store.insert(ObjectId::new(id));
        }
        store
    }

    pub fn insert(&self, id: ObjectId) {
        self.objects
            .lock()
            .insert(id, format!("object-{}", id.value()).into_bytes());
    }

    pub fn add_root(&self, name: &str, id: ObjectId) {
        self.insert(id);
        self.roots.lock().insert(name.to_string(), id);
    }

    pub fn remove(&self, ids: &ObjectIdSet) {
        let mut objects = self.objects.lock();
        for id in ids {
            objects.remove(id);
        }
        self.roots.lock().retain(|_, id| !ids.contains(id));
    }

    /// Keeps `id` in the listing while lookups report it deleted.
    pub fn vanish(&self, id: ObjectId) {
        self.objects.lock().remove(&id);
        self.vanished.lock().insert(id);
    }

    /// The next `times` lookups of `id` fail.
    pub fn fail_lookups(&self, id: ObjectId, times: usize) {
        self.failing.lock().insert(id, times);
    }
}

impl ObjectStore for MemoryObjectStore {
    fn all_object_ids(&self) -> ObjectIdSet {
        let mut ids: ObjectIdSet = self.objects.lock().keys().copied().collect();
        ids.extend(self.vanished.lock().iter().copied());
        ids
    }

    fn root_names(&self) -> BTreeMap<String, ObjectId> {
        self.roots.lock().clone()
    }

    fn lookup(&self, id: ObjectId) -> ReplicationResult<Option<ObjectSnapshot>> {
        {
            let mut failing = self.failing.lock();
            if let Some(left) = failing.get_mut(&id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ReplicationError::object_lookup(format!("{} is locked", id)));
                }
            }
        }
        Ok(self.objects.lock().get(&id).map(|payload| ObjectSnapshot {
            id,
            payload: payload.clone(),
        }))
    }

    fn object_count(&self) -> u64 {
        self.objects.lock().len() as u64
    }

    fn storage_capacity(&self) -> u64 {
        self.capacity
    }
}

// =============================================================================
// Garbage collector
// =============================================================================

pub struct FakeGc {
    store: Arc<MemoryObjectStore>,
    journal: Journal,
    running: AtomicBool,
    disabled: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn GarbageCollectorEventListener>>>,
}

impl FakeGc {
    pub fn new(store: Arc<MemoryObjectStore>, journal: Journal) -> Self {
        Self {
            store,
            journal,
            running: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn start_cycle(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Ends the running cycle, reclaiming `deleted` from the store, and
    /// notifies the listeners.
    pub fn complete_cycle(&self, info: GcInfo, deleted: ObjectIdSet) {
        self.store.remove(&deleted);
        self.running.store(false, Ordering::SeqCst);
        let listeners = self.listeners.lock().clone();
        for l in listeners {
            l.garbage_collector_cycle_completed(info, deleted.clone());
        }
    }
}

impl GarbageCollector for FakeGc {
    fn request_disable_gc(&self) -> bool {
        if self.running.load(Ordering::SeqCst) {
            return false;
        }
        self.disabled.store(true, Ordering::SeqCst);
        true
    }

    fn wait_to_disable_gc(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }

    fn enable_gc(&self) -> bool {
        self.disabled.swap(false, Ordering::SeqCst)
    }

    fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    fn delete_garbage(&self, result: DgcResultContext) {
        self.store.remove(&result.deleted);
        self.journal.lock().push(Entry::GcResult(result));
    }

    fn add_listener(&self, listener: Arc<dyn GarbageCollectorEventListener>) {
        self.listeners.lock().push(listener);
    }
}

// =============================================================================
// Transaction pipeline
// =============================================================================

pub struct RecordingTransactions {
    pub tracker: TransactionTracker,
    journal: Journal,
}

impl RecordingTransactions {
    pub fn new(journal: Journal) -> Self {
        Self {
            tracker: TransactionTracker::new(),
            journal,
        }
    }
}

impl ServerTransactionManager for RecordingTransactions {
    fn incoming_transactions(&self, _from: NodeId, transactions: Vec<ServerTransaction>) {
        self.journal.lock().push(Entry::Committed(transactions));
    }

    fn apply_object_sync(&self, _from: NodeId, transaction: ObjectSyncTransaction) {
        self.journal.lock().push(Entry::ObjectSync(transaction));
    }

    fn call_back_on_txns_in_system_completion(&self, callback: Completion) {
        self.tracker.call_when_in_flight_complete(callback);
    }

    fn call_back_on_resent_txns_in_system_completion(&self, callback: Completion) {
        self.tracker.call_when_resent_complete(callback);
    }
}

// =============================================================================
// Termination and weights
// =============================================================================

#[derive(Default)]
pub struct RecordingTerminator {
    terminated: Mutex<Vec<ZapReason>>,
}

impl RecordingTerminator {
    pub fn reasons(&self) -> Vec<ZapReason> {
        self.terminated.lock().clone()
    }

    pub fn is_terminated(&self) -> bool {
        !self.terminated.lock().is_empty()
    }
}

impl NodeTerminator for RecordingTerminator {
    fn terminate(&self, reason: ZapReason, _message: &str) {
        self.terminated.lock().push(reason);
    }
}

struct FixedWeight(i64);

impl WeightGenerator for FixedWeight {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn weight(&self) -> i64 {
        self.0
    }
}

pub fn fixed_weights(weights: &[i64]) -> WeightGeneratorFactory {
    let mut factory = WeightGeneratorFactory::new();
    for w in weights {
        factory.add(FixedWeight(*w));
    }
    factory
}

// =============================================================================
// Nodes
// =============================================================================

pub struct TestNode {
    pub node: HaNode,
    pub store: Arc<MemoryObjectStore>,
    pub gc: Arc<FakeGc>,
    pub transactions: Arc<RecordingTransactions>,
    pub terminator: Arc<RecordingTerminator>,
    pub persistor: Arc<MemoryClusterStatePersistor>,
    pub journal: Journal,
}

impl TestNode {
    pub fn id(&self) -> NodeId {
        self.node.node_id()
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.journal.lock().clone()
    }

    /// Every object id applied through object sync, in arrival order.
    pub fn synced_object_ids(&self) -> Vec<ObjectId> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                Entry::ObjectSync(txn) => Some(txn),
                _ => None,
            })
            .flat_map(|txn| txn.object_ids())
            .collect()
    }
}

pub fn small_batches() -> HaConfig {
    HaConfig {
        sync_batch_size: 4,
        max_sync_batches_in_flight: 2,
        broadcast_timeout_ms: 1_000,
        ..HaConfig::default()
    }
}

pub fn spawn_node(
    network: &Arc<LocalNetwork>,
    config: &HaConfig,
    store: MemoryObjectStore,
    weights: &[i64],
) -> TestNode {
    let id = NodeId::random();
    let group = network.join(id);
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(store);
    let gc = Arc::new(FakeGc::new(Arc::clone(&store), Arc::clone(&journal)));
    let transactions = Arc::new(RecordingTransactions::new(Arc::clone(&journal)));
    let terminator = Arc::new(RecordingTerminator::default());
    let persistor = Arc::new(MemoryClusterStatePersistor::new());

    let node = HaNode::new(
        group,
        config,
        HaCollaborators {
            persistor: persistor.clone(),
            store: store.clone(),
            gc: gc.clone(),
            transactions: transactions.clone(),
            terminator: terminator.clone(),
            weights: fixed_weights(weights),
        },
    )
    .unwrap();

    TestNode {
        node,
        store,
        gc,
        transactions,
        terminator,
        persistor,
        journal,
    }
}

pub fn txn_id(source: NodeId, n: u64) -> ServerTransactionId {
    ServerTransactionId::new(source, ClientTransactionId::new(n))
}
