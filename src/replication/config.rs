//! Replication Configuration
//!
//! Loaded from a JSON file; every field has a default so a partial file
//! (or an empty `{}`) is a valid configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{ReplicationError, ReplicationResult};
use crate::arbitration::ConsistencyPriorities;
use crate::model::GroupId;

/// Configuration of one stripe member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaConfig {
    /// Directory holding persisted cluster state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Replication group this node belongs to.
    #[serde(default = "default_group_id")]
    pub group_id: u32,

    /// Maximum objects per sync batch.
    #[serde(default = "default_sync_batch_size")]
    pub sync_batch_size: usize,

    /// Maximum un-acknowledged sync batches per passive.
    #[serde(default = "default_max_sync_batches_in_flight")]
    pub max_sync_batches_in_flight: usize,

    /// Per-peer bound on a cluster-state broadcast.
    #[serde(default = "default_broadcast_timeout_ms")]
    pub broadcast_timeout_ms: u64,

    /// Storage a passive must report to be admitted, in bytes. Zero disables
    /// the check.
    #[serde(default)]
    pub storage_capacity_bytes: u64,

    #[serde(default)]
    pub consistency_priorities: ConsistencyPriorities,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_group_id() -> u32 {
    0
}

fn default_sync_batch_size() -> usize {
    500
}

fn default_max_sync_batches_in_flight() -> usize {
    10
}

fn default_broadcast_timeout_ms() -> u64 {
    30_000
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            group_id: default_group_id(),
            sync_batch_size: default_sync_batch_size(),
            max_sync_batches_in_flight: default_max_sync_batches_in_flight(),
            broadcast_timeout_ms: default_broadcast_timeout_ms(),
            storage_capacity_bytes: 0,
            consistency_priorities: ConsistencyPriorities::default(),
        }
    }
}

impl HaConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(path: &Path) -> ReplicationResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ReplicationError::configuration_error(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: HaConfig = serde_json::from_str(&content).map_err(|e| {
            ReplicationError::configuration_error(format!(
                "failed to parse {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> ReplicationResult<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            ReplicationError::configuration_error(format!("failed to serialize config: {}", e))
        })?;
        fs::write(path, content).map_err(|e| {
            ReplicationError::configuration_error(format!(
                "failed to write {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.sync_batch_size == 0 {
            return Err(ReplicationError::configuration_error(
                "sync_batch_size must be at least 1",
            ));
        }
        if self.max_sync_batches_in_flight == 0 {
            return Err(ReplicationError::configuration_error(
                "max_sync_batches_in_flight must be at least 1",
            ));
        }
        if self.broadcast_timeout_ms == 0 {
            return Err(ReplicationError::configuration_error(
                "broadcast_timeout_ms must be positive",
            ));
        }
        if !self.consistency_priorities.is_ordered() {
            return Err(ReplicationError::configuration_error(
                "consistency priorities must satisfy non_blocking > available > blocked",
            ));
        }
        Ok(())
    }

    pub fn group(&self) -> GroupId {
        GroupId::new(self.group_id)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }
}
