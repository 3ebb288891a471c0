//! Global transaction id store
//!
//! Assigns global transaction ids on the active and records the ids relayed
//! to passives. Every mapping is appended to the global transaction log
//! before it is handed out, so the same server transaction id resolves to
//! the same global id after restart. Each write costs one log entry.
//!
//! The highest id handed out survives truncation: it is stored in the state
//! document just before entries below a low-water mark are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::collaborators::ServerGlobalTransactionManager;
use super::errors::{ReplicationError, ReplicationResult};
use crate::model::{GlobalTransactionId, ServerTransactionId};
use crate::persistence::{
    get_as, log_append_as, log_entries_as, put_as, ClusterStatePersistor, LogKey, StateKey,
};

struct GtxInner {
    last: u64,
    by_server: HashMap<ServerTransactionId, GlobalTransactionId>,
}

pub struct GlobalTransactionStore {
    persistor: Arc<dyn ClusterStatePersistor>,
    inner: Mutex<GtxInner>,
}

impl GlobalTransactionStore {
    /// Loads the persisted mapping.
    pub fn load(persistor: Arc<dyn ClusterStatePersistor>) -> ReplicationResult<Self> {
        let floor: u64 = get_as(persistor.as_ref(), StateKey::LastGlobalTxnId)?.unwrap_or(0);
        let logged = log_entries_as::<ServerTransactionId>(
            persistor.as_ref(),
            LogKey::GlobalTransactions,
        )?;
        let last = logged.keys().next_back().copied().unwrap_or(0).max(floor);
        let by_server = logged
            .into_iter()
            .map(|(gid, id)| (id, GlobalTransactionId::new(gid)))
            .collect();
        Ok(Self {
            persistor,
            inner: Mutex::new(GtxInner { last, by_server }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_server.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_server.is_empty()
    }

    pub fn lookup(&self, id: ServerTransactionId) -> Option<GlobalTransactionId> {
        self.inner.lock().by_server.get(&id).copied()
    }

    fn append(&self, id: ServerTransactionId, gid: GlobalTransactionId) -> ReplicationResult<()> {
        log_append_as(
            self.persistor.as_ref(),
            LogKey::GlobalTransactions,
            gid.value(),
            &id,
        )?;
        Ok(())
    }
}

impl ServerGlobalTransactionManager for GlobalTransactionStore {
    fn get_or_create_global_id(
        &self,
        id: ServerTransactionId,
    ) -> ReplicationResult<GlobalTransactionId> {
        let mut inner = self.inner.lock();
        if let Some(gid) = inner.by_server.get(&id) {
            return Ok(*gid);
        }
        let gid = GlobalTransactionId::new(inner.last + 1);
        self.append(id, gid)?;
        inner.last = gid.value();
        inner.by_server.insert(id, gid);
        Ok(gid)
    }

    fn record(&self, id: ServerTransactionId, global_id: GlobalTransactionId) -> ReplicationResult<()> {
        let mut inner = self.inner.lock();
        match inner.by_server.get(&id) {
            Some(existing) if *existing == global_id => return Ok(()),
            Some(existing) => {
                return Err(ReplicationError::illegal_transition(format!(
                    "{} already mapped to {}, refusing {}",
                    id, existing, global_id
                )))
            }
            None => {}
        }
        self.append(id, global_id)?;
        inner.by_server.insert(id, global_id);
        inner.last = inner.last.max(global_id.value());
        Ok(())
    }

    fn clear_below_low_water_mark(&self, low_water_mark: GlobalTransactionId) -> ReplicationResult<()> {
        let mut inner = self.inner.lock();
        if !inner.by_server.values().any(|gid| *gid < low_water_mark) {
            return Ok(());
        }
        put_as(self.persistor.as_ref(), StateKey::LastGlobalTxnId, &inner.last)?;
        self.persistor
            .log_truncate_below(LogKey::GlobalTransactions, low_water_mark.value())?;
        let before = inner.by_server.len();
        inner.by_server.retain(|_, gid| *gid >= low_water_mark);
        debug!(
            %low_water_mark,
            removed = before - inner.by_server.len(),
            "cleared global transaction ids below low-water mark"
        );
        Ok(())
    }

    fn low_water_mark(&self) -> GlobalTransactionId {
        self.inner
            .lock()
            .by_server
            .values()
            .min()
            .copied()
            .unwrap_or(GlobalTransactionId::NULL)
    }

    fn last_global_id(&self) -> GlobalTransactionId {
        GlobalTransactionId::new(self.inner.lock().last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::Value;

    use crate::model::{ClientTransactionId, NodeId};
    use crate::persistence::{MemoryClusterStatePersistor, PersistenceResult};

    /// Counts the bytes handed to the underlying persistor.
    #[derive(Default)]
    struct CountingPersistor {
        inner: MemoryClusterStatePersistor,
        bytes: AtomicUsize,
    }

    impl CountingPersistor {
        fn count(&self, value: &Value) {
            self.bytes.fetch_add(value.to_string().len(), Ordering::SeqCst);
        }
    }

    impl ClusterStatePersistor for CountingPersistor {
        fn get(&self, key: StateKey) -> PersistenceResult<Option<Value>> {
            self.inner.get(key)
        }
        fn put(&self, key: StateKey, value: Value) -> PersistenceResult<()> {
            self.count(&value);
            self.inner.put(key, value)
        }
        fn log_entries(&self, log: LogKey) -> PersistenceResult<BTreeMap<u64, Value>> {
            self.inner.log_entries(log)
        }
        fn log_append(&self, log: LogKey, sequence: u64, value: Value) -> PersistenceResult<()> {
            self.count(&value);
            self.inner.log_append(log, sequence, value)
        }
        fn log_truncate_below(&self, log: LogKey, sequence: u64) -> PersistenceResult<()> {
            self.inner.log_truncate_below(log, sequence)
        }
    }

    fn stx(node: NodeId, n: u64) -> ServerTransactionId {
        ServerTransactionId::new(node, ClientTransactionId::new(n))
    }

    #[test]
    fn test_assignment_is_strictly_increasing_and_idempotent() {
        let store = GlobalTransactionStore::load(Arc::new(MemoryClusterStatePersistor::new())).unwrap();
        let node = NodeId::random();
        let g1 = store.get_or_create_global_id(stx(node, 1)).unwrap();
        let g2 = store.get_or_create_global_id(stx(node, 2)).unwrap();
        assert_eq!(g1, GlobalTransactionId::new(1));
        assert!(g2 > g1);
        assert_eq!(store.get_or_create_global_id(stx(node, 1)).unwrap(), g1);
    }

    #[test]
    fn test_mapping_survives_reload() {
        let persistor: Arc<dyn ClusterStatePersistor> = Arc::new(MemoryClusterStatePersistor::new());
        let node = NodeId::random();
        let gid = {
            let store = GlobalTransactionStore::load(Arc::clone(&persistor)).unwrap();
            store.get_or_create_global_id(stx(node, 1)).unwrap();
            store.get_or_create_global_id(stx(node, 7)).unwrap()
        };
        let reloaded = GlobalTransactionStore::load(persistor).unwrap();
        assert_eq!(reloaded.get_or_create_global_id(stx(node, 7)).unwrap(), gid);
        let next = reloaded.get_or_create_global_id(stx(node, 8)).unwrap();
        assert!(next > gid);
    }

    #[test]
    fn test_clear_below_low_water_mark() {
        let store = GlobalTransactionStore::load(Arc::new(MemoryClusterStatePersistor::new())).unwrap();
        let node = NodeId::random();
        for n in 1..=5 {
            store.get_or_create_global_id(stx(node, n)).unwrap();
        }
        store
            .clear_below_low_water_mark(GlobalTransactionId::new(3))
            .unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.low_water_mark(), GlobalTransactionId::new(3));
        assert_eq!(store.last_global_id(), GlobalTransactionId::new(5));
    }

    #[test]
    fn test_record_refuses_remap() {
        let store = GlobalTransactionStore::load(Arc::new(MemoryClusterStatePersistor::new())).unwrap();
        let id = stx(NodeId::random(), 1);
        store.record(id, GlobalTransactionId::new(10)).unwrap();
        store.record(id, GlobalTransactionId::new(10)).unwrap();
        assert!(store.record(id, GlobalTransactionId::new(11)).is_err());
    }

    #[test]
    fn test_write_volume_is_linear() {
        let persistor = Arc::new(CountingPersistor::default());
        let store = GlobalTransactionStore::load(persistor.clone()).unwrap();
        let node = NodeId::random();

        store.get_or_create_global_id(stx(node, 1)).unwrap();
        let one = persistor.bytes.load(Ordering::SeqCst);
        for n in 2..=2000 {
            store.get_or_create_global_id(stx(node, n)).unwrap();
        }
        let total = persistor.bytes.load(Ordering::SeqCst);
        assert!(total <= 2000 * (one + 8), "wrote {} bytes", total);
        assert_eq!(persistor.inner.get(StateKey::LastGlobalTxnId).unwrap(), None);
    }

    #[test]
    fn test_last_id_survives_full_truncation() {
        let persistor: Arc<dyn ClusterStatePersistor> = Arc::new(MemoryClusterStatePersistor::new());
        let node = NodeId::random();
        {
            let store = GlobalTransactionStore::load(Arc::clone(&persistor)).unwrap();
            for n in 1..=4 {
                store.get_or_create_global_id(stx(node, n)).unwrap();
            }
            store
                .clear_below_low_water_mark(GlobalTransactionId::new(10))
                .unwrap();
            assert!(store.is_empty());
        }
        let reloaded = GlobalTransactionStore::load(persistor).unwrap();
        assert!(reloaded.is_empty());
        assert_eq!(reloaded.last_global_id(), GlobalTransactionId::new(4));
        assert_eq!(
            reloaded.get_or_create_global_id(stx(node, 5)).unwrap(),
            GlobalTransactionId::new(5)
        );
    }
}
