//! In-memory persistor

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde_json::Value;

use super::errors::PersistenceResult;
use super::{ClusterStatePersistor, LogKey, StateKey};

/// Persistor that keeps values in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryClusterStatePersistor {
    entries: Mutex<BTreeMap<StateKey, Value>>,
    logs: Mutex<BTreeMap<LogKey, BTreeMap<u64, Value>>>,
}

impl MemoryClusterStatePersistor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys written so far.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl ClusterStatePersistor for MemoryClusterStatePersistor {
    fn get(&self, key: StateKey) -> PersistenceResult<Option<Value>> {
        Ok(self.entries.lock().get(&key).cloned())
    }

    fn put(&self, key: StateKey, value: Value) -> PersistenceResult<()> {
        self.entries.lock().insert(key, value);
        Ok(())
    }

    fn log_entries(&self, log: LogKey) -> PersistenceResult<BTreeMap<u64, Value>> {
        Ok(self.logs.lock().get(&log).cloned().unwrap_or_default())
    }

    fn log_append(&self, log: LogKey, sequence: u64, value: Value) -> PersistenceResult<()> {
        self.logs.lock().entry(log).or_default().insert(sequence, value);
        Ok(())
    }

    fn log_truncate_below(&self, log: LogKey, sequence: u64) -> PersistenceResult<()> {
        if let Some(entries) = self.logs.lock().get_mut(&log) {
            *entries = entries.split_off(&sequence);
        }
        Ok(())
    }
}
