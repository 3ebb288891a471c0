//! Cluster-state persistence
//!
//! The replication core persists a handful of named values: sequence
//! high-water marks, the live connection set, the stripe ids and the
//! lifecycle label. The [`ClusterStatePersistor`] trait is a typed key/value
//! store over those names; `put` is idempotent and durable by the time it
//! returns.
//!
//! Data that grows with traffic, such as the global transaction map, goes to
//! sequence-keyed logs instead ([`LogKey`]) so each write costs one entry.
//!
//! Two implementations ship with the crate:
//! - [`FileClusterStatePersistor`]: one checksummed JSON document, replaced
//!   atomically on every write, plus one append-only file per log
//! - [`MemoryClusterStatePersistor`]: for tests and ephemeral nodes

mod checksum;
mod errors;
mod file;
mod log;
mod memory;

pub use checksum::{compute_checksum, verify_checksum};
pub use errors::{PersistenceError, PersistenceResult};
pub use file::FileClusterStatePersistor;
pub use memory::MemoryClusterStatePersistor;

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Names of the persisted cluster-state values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StateKey {
    NextObjectId,
    NextGlobalTxnId,
    NextConnectionId,
    NextGcIterationId,
    Connections,
    StripeIds,
    CurrentState,
    DbClean,
    LastGlobalTxnId,
}

impl StateKey {
    /// Key string used inside the persisted document.
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKey::NextObjectId => "next_object_id",
            StateKey::NextGlobalTxnId => "next_global_txn_id",
            StateKey::NextConnectionId => "next_connection_id",
            StateKey::NextGcIterationId => "next_gc_iteration_id",
            StateKey::Connections => "connections",
            StateKey::StripeIds => "stripe_ids",
            StateKey::CurrentState => "current_state",
            StateKey::DbClean => "db_clean",
            StateKey::LastGlobalTxnId => "last_global_txn_id",
        }
    }
}

/// Names of the persisted append-only logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogKey {
    /// Global transaction id to server transaction id.
    GlobalTransactions,
}

impl LogKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKey::GlobalTransactions => "global_transactions",
        }
    }
}

/// Durable key/value store for cluster state.
pub trait ClusterStatePersistor: Send + Sync {
    /// Returns the stored value, or `None` if the key was never written.
    fn get(&self, key: StateKey) -> PersistenceResult<Option<Value>>;

    /// Stores `value` under `key`. Durable once this returns.
    fn put(&self, key: StateKey, value: Value) -> PersistenceResult<()>;

    /// Every live entry of `log`, by sequence.
    fn log_entries(&self, log: LogKey) -> PersistenceResult<BTreeMap<u64, Value>>;

    /// Stores one entry. Durable once this returns; appending an existing
    /// sequence replaces its value.
    fn log_append(&self, log: LogKey, sequence: u64, value: Value) -> PersistenceResult<()>;

    /// Drops every entry with a sequence strictly below `sequence`.
    fn log_truncate_below(&self, log: LogKey, sequence: u64) -> PersistenceResult<()>;
}

/// Reads `key` and deserializes it into `T`.
pub fn get_as<T: DeserializeOwned>(
    persistor: &dyn ClusterStatePersistor,
    key: StateKey,
) -> PersistenceResult<Option<T>> {
    match persistor.get(key)? {
        None => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| PersistenceError::invalid_value(key.as_str(), e.to_string())),
    }
}

/// Serializes `value` and stores it under `key`.
pub fn put_as<T: Serialize>(
    persistor: &dyn ClusterStatePersistor,
    key: StateKey,
    value: &T,
) -> PersistenceResult<()> {
    let value = serde_json::to_value(value)
        .map_err(|e| PersistenceError::invalid_value(key.as_str(), e.to_string()))?;
    persistor.put(key, value)
}

/// Reads every entry of `log`, deserializing each value into `T`.
pub fn log_entries_as<T: DeserializeOwned>(
    persistor: &dyn ClusterStatePersistor,
    log: LogKey,
) -> PersistenceResult<BTreeMap<u64, T>> {
    persistor
        .log_entries(log)?
        .into_iter()
        .map(|(sequence, value)| {
            serde_json::from_value(value)
                .map(|v| (sequence, v))
                .map_err(|e| PersistenceError::invalid_value(log.as_str(), e.to_string()))
        })
        .collect()
}

/// Serializes `value` and appends it to `log` under `sequence`.
pub fn log_append_as<T: Serialize>(
    persistor: &dyn ClusterStatePersistor,
    log: LogKey,
    sequence: u64,
    value: &T,
) -> PersistenceResult<()> {
    let value = serde_json::to_value(value)
        .map_err(|e| PersistenceError::invalid_value(log.as_str(), e.to_string()))?;
    persistor.log_append(log, sequence, value)
}
