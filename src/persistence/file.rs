//! Checksummed, atomically replaced cluster-state file
//!
//! Layout on disk (`<data_dir>/metadata/cluster_state.json`):
//!
//! ```text
//! { "checksum": <crc32 of body>, "body": "<json object keyed by StateKey>" }
//! ```
//!
//! Every `put` rewrites the whole document:
//! 1. Write to temp file
//! 2. fsync temp file
//! 3. Rename temp to final
//! 4. fsync the directory
//!
//! A reader therefore sees either the previous or the new document, never a
//! torn one.
//!
//! Logs live beside it as `<data_dir>/metadata/<log>.log` and are opened on
//! first use.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::checksum::{compute_checksum, verify_checksum};
use super::errors::{PersistenceError, PersistenceResult};
use super::log::SequenceLog;
use super::{ClusterStatePersistor, LogKey, StateKey};

const STATE_FILE_NAME: &str = "cluster_state.json";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    checksum: u32,
    body: String,
}

/// File-backed persistor. Values are cached in memory and written through.
#[derive(Debug)]
pub struct FileClusterStatePersistor {
    state_path: PathBuf,
    temp_path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
    logs: Mutex<HashMap<LogKey, SequenceLog>>,
}

impl FileClusterStatePersistor {
    /// Opens (or creates) the state file under `data_dir/metadata`.
    ///
    /// Fails if an existing file does not parse or its checksum does not
    /// match.
    pub fn open(data_dir: &Path) -> PersistenceResult<Self> {
        let metadata_dir = data_dir.join("metadata");
        fs::create_dir_all(&metadata_dir)
            .map_err(|e| PersistenceError::io(metadata_dir.display().to_string(), e))?;

        let state_path = metadata_dir.join(STATE_FILE_NAME);
        let temp_path = metadata_dir.join(format!("{}.tmp", STATE_FILE_NAME));
        let entries = Self::read_document(&state_path)?;

        Ok(Self {
            state_path,
            temp_path,
            entries: Mutex::new(entries),
            logs: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the state document.
    pub fn path(&self) -> &Path {
        &self.state_path
    }

    /// Every stored value, keyed by its document name.
    pub fn entries(&self) -> BTreeMap<String, Value> {
        self.entries.lock().clone()
    }

    fn log_path(&self, log: LogKey) -> PathBuf {
        self.state_path
            .with_file_name(format!("{}.log", log.as_str()))
    }

    fn with_log<T>(
        &self,
        log: LogKey,
        f: impl FnOnce(&mut SequenceLog) -> PersistenceResult<T>,
    ) -> PersistenceResult<T> {
        let mut logs = self.logs.lock();
        let opened = match logs.entry(log) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                e.insert(SequenceLog::open(&self.log_path(log))?)
            }
        };
        f(opened)
    }

    fn read_document(path: &Path) -> PersistenceResult<BTreeMap<String, Value>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let display = path.display().to_string();
        let content = fs::read_to_string(path).map_err(|e| PersistenceError::io(&display, e))?;
        let envelope: Envelope = serde_json::from_str(&content)
            .map_err(|e| PersistenceError::Malformed(format!("{}: {}", display, e)))?;
        if !verify_checksum(envelope.body.as_bytes(), envelope.checksum) {
            return Err(PersistenceError::ChecksumMismatch(display));
        }
        serde_json::from_str(&envelope.body)
            .map_err(|e| PersistenceError::Malformed(format!("{}: {}", display, e)))
    }

    fn write_atomic(&self, entries: &BTreeMap<String, Value>) -> PersistenceResult<()> {
        let body = serde_json::to_string(entries)
            .map_err(|e| PersistenceError::Malformed(e.to_string()))?;
        let envelope = Envelope {
            checksum: compute_checksum(body.as_bytes()),
            body,
        };
        let content = serde_json::to_string_pretty(&envelope)
            .map_err(|e| PersistenceError::Malformed(e.to_string()))?;

        let temp_display = self.temp_path.display().to_string();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.temp_path)
            .map_err(|e| PersistenceError::io(&temp_display, e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| PersistenceError::io(&temp_display, e))?;
        file.sync_all()
            .map_err(|e| PersistenceError::io(&temp_display, e))?;

        fs::rename(&self.temp_path, &self.state_path)
            .map_err(|e| PersistenceError::io(self.state_path.display().to_string(), e))?;

        if let Some(parent) = self.state_path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

impl ClusterStatePersistor for FileClusterStatePersistor {
    fn get(&self, key: StateKey) -> PersistenceResult<Option<Value>> {
        Ok(self.entries.lock().get(key.as_str()).cloned())
    }

    fn put(&self, key: StateKey, value: Value) -> PersistenceResult<()> {
        let mut entries = self.entries.lock();
        if entries.get(key.as_str()) == Some(&value) {
            return Ok(());
        }
        let mut updated = entries.clone();
        updated.insert(key.as_str().to_string(), value);
        self.write_atomic(&updated)?;
        *entries = updated;
        Ok(())
    }

    fn log_entries(&self, log: LogKey) -> PersistenceResult<BTreeMap<u64, Value>> {
        self.with_log(log, |l| Ok(l.entries().clone()))
    }

    fn log_append(&self, log: LogKey, sequence: u64, value: Value) -> PersistenceResult<()> {
        self.with_log(log, |l| l.append(sequence, value))
    }

    fn log_truncate_below(&self, log: LogKey, sequence: u64) -> PersistenceResult<()> {
        self.with_log(log, |l| l.truncate_below(sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let persistor = FileClusterStatePersistor::open(dir.path()).unwrap();
            persistor.put(StateKey::NextObjectId, json!(1200)).unwrap();
            persistor
                .put(StateKey::CurrentState, json!("PASSIVE-STANDBY"))
                .unwrap();
        }
        let reopened = FileClusterStatePersistor::open(dir.path()).unwrap();
        assert_eq!(reopened.get(StateKey::NextObjectId).unwrap(), Some(json!(1200)));
        assert_eq!(
            reopened.get(StateKey::CurrentState).unwrap(),
            Some(json!("PASSIVE-STANDBY"))
        );
        assert_eq!(reopened.get(StateKey::DbClean).unwrap(), None);
    }

    #[test]
    fn test_log_writes_leave_state_document_alone() {
        let dir = TempDir::new().unwrap();
        {
            let persistor = FileClusterStatePersistor::open(dir.path()).unwrap();
            persistor.put(StateKey::DbClean, json!(true)).unwrap();
            let before = fs::read_to_string(persistor.path()).unwrap();
            for n in 1..=10 {
                persistor
                    .log_append(LogKey::GlobalTransactions, n, json!(n))
                    .unwrap();
            }
            assert_eq!(fs::read_to_string(persistor.path()).unwrap(), before);
            assert!(dir.path().join("metadata/global_transactions.log").exists());
        }
        let reopened = FileClusterStatePersistor::open(dir.path()).unwrap();
        assert_eq!(
            reopened.log_entries(LogKey::GlobalTransactions).unwrap().len(),
            10
        );
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let persistor = FileClusterStatePersistor::open(dir.path()).unwrap();
        persistor.put(StateKey::DbClean, json!(true)).unwrap();
        assert!(persistor.path().exists());
        assert!(!persistor.temp_path.exists());
    }

    #[test]
    fn test_corrupt_body_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = {
            let persistor = FileClusterStatePersistor::open(dir.path()).unwrap();
            persistor.put(StateKey::NextGlobalTxnId, json!(77)).unwrap();
            persistor.path().to_path_buf()
        };
        let tampered = fs::read_to_string(&path).unwrap().replace("77", "78");
        fs::write(&path, tampered).unwrap();

        let err = FileClusterStatePersistor::open(dir.path()).unwrap_err();
        assert!(matches!(err, PersistenceError::ChecksumMismatch(_)));
    }

    #[test]
    fn test_garbage_file_is_malformed() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("metadata")).unwrap();
        fs::write(dir.path().join("metadata").join(STATE_FILE_NAME), "not json").unwrap();
        let err = FileClusterStatePersistor::open(dir.path()).unwrap_err();
        assert!(matches!(err, PersistenceError::Malformed(_)));
    }
}
