//! Append-only, sequence-keyed log
//!
//! Values that grow with traffic (one entry per transaction) are kept out of
//! the state document and appended here instead, one checksummed JSON line
//! per record:
//!
//! ```text
//! {"checksum":<crc32 of body>,"body":"{\"op\":\"append\",\"sequence\":7,\"value\":...}"}
//! ```
//!
//! Every record is fsynced before the call returns. Truncation appends a
//! marker record; once dead records outnumber live entries the log is
//! compacted through a temp file and an atomic rename.
//!
//! A record that fails its checksum or does not parse is a startup failure,
//! never skipped.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::checksum::{compute_checksum, verify_checksum};
use super::errors::{PersistenceError, PersistenceResult};

/// Dead records tolerated on top of the live ones before compacting.
const COMPACTION_SLACK: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    checksum: u32,
    body: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
    Append { sequence: u64, value: Value },
    TruncateBelow { sequence: u64 },
}

#[derive(Debug)]
pub(super) struct SequenceLog {
    path: PathBuf,
    temp_path: PathBuf,
    file: File,
    entries: BTreeMap<u64, Value>,
    records: usize,
}

impl SequenceLog {
    /// Opens (or creates) the log at `path` and replays it.
    pub(super) fn open(path: &Path) -> PersistenceResult<Self> {
        let display = path.display().to_string();
        let mut entries = BTreeMap::new();
        let mut records = 0;
        if path.exists() {
            let content =
                fs::read_to_string(path).map_err(|e| PersistenceError::io(&display, e))?;
            for (index, line) in content.lines().enumerate() {
                if line.is_empty() {
                    continue;
                }
                match decode(line, &display, index)? {
                    LogRecord::Append { sequence, value } => {
                        entries.insert(sequence, value);
                    }
                    LogRecord::TruncateBelow { sequence } => {
                        entries = entries.split_off(&sequence);
                    }
                }
                records += 1;
            }
        }

        let file = open_append(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            temp_path: path.with_extension("log.tmp"),
            file,
            entries,
            records,
        })
    }

    pub(super) fn entries(&self) -> &BTreeMap<u64, Value> {
        &self.entries
    }

    pub(super) fn append(&mut self, sequence: u64, value: Value) -> PersistenceResult<()> {
        if self.entries.get(&sequence) == Some(&value) {
            return Ok(());
        }
        let record = LogRecord::Append {
            sequence,
            value: value.clone(),
        };
        self.write_record(&record)?;
        self.entries.insert(sequence, value);
        Ok(())
    }

    pub(super) fn truncate_below(&mut self, sequence: u64) -> PersistenceResult<()> {
        match self.entries.keys().next() {
            Some(first) if *first < sequence => {}
            _ => return Ok(()),
        }
        self.write_record(&LogRecord::TruncateBelow { sequence })?;
        self.entries = self.entries.split_off(&sequence);
        if self.records > 2 * self.entries.len() + COMPACTION_SLACK {
            self.compact()?;
        }
        Ok(())
    }

    /// Records currently on disk, live or dead.
    pub(super) fn record_count(&self) -> usize {
        self.records
    }

    fn write_record(&mut self, record: &LogRecord) -> PersistenceResult<()> {
        let line = encode(record)?;
        let display = self.path.display().to_string();
        self.file
            .write_all(line.as_bytes())
            .map_err(|e| PersistenceError::io(&display, e))?;
        self.file
            .sync_data()
            .map_err(|e| PersistenceError::io(&display, e))?;
        self.records += 1;
        Ok(())
    }

    /// Rewrites the log with only the live entries.
    fn compact(&mut self) -> PersistenceResult<()> {
        let mut content = String::new();
        for (sequence, value) in &self.entries {
            content.push_str(&encode(&LogRecord::Append {
                sequence: *sequence,
                value: value.clone(),
            })?);
        }

        let temp_display = self.temp_path.display().to_string();
        let mut temp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.temp_path)
            .map_err(|e| PersistenceError::io(&temp_display, e))?;
        temp.write_all(content.as_bytes())
            .map_err(|e| PersistenceError::io(&temp_display, e))?;
        temp.sync_all()
            .map_err(|e| PersistenceError::io(&temp_display, e))?;
        fs::rename(&self.temp_path, &self.path)
            .map_err(|e| PersistenceError::io(self.path.display().to_string(), e))?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        self.file = open_append(&self.path)?;
        self.records = self.entries.len();
        Ok(())
    }
}

fn open_append(path: &Path) -> PersistenceResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PersistenceError::io(path.display().to_string(), e))
}

fn encode(record: &LogRecord) -> PersistenceResult<String> {
    let body =
        serde_json::to_string(record).map_err(|e| PersistenceError::Malformed(e.to_string()))?;
    let line = LogLine {
        checksum: compute_checksum(body.as_bytes()),
        body,
    };
    let mut encoded =
        serde_json::to_string(&line).map_err(|e| PersistenceError::Malformed(e.to_string()))?;
    encoded.push('\n');
    Ok(encoded)
}

fn decode(line: &str, display: &str, index: usize) -> PersistenceResult<LogRecord> {
    let location = format!("{} record {}", display, index + 1);
    let line: LogLine = serde_json::from_str(line)
        .map_err(|e| PersistenceError::Malformed(format!("{}: {}", location, e)))?;
    if !verify_checksum(line.body.as_bytes(), line.checksum) {
        return Err(PersistenceError::ChecksumMismatch(location));
    }
    serde_json::from_str(&line.body)
        .map_err(|e| PersistenceError::Malformed(format!("{}: {}", location, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn log_path(dir: &TempDir) -> PathBuf {
        dir.path().join("entries.log")
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = SequenceLog::open(&log_path(&dir)).unwrap();
            log.append(1, json!("a")).unwrap();
            log.append(2, json!("b")).unwrap();
            log.truncate_below(2).unwrap();
            log.append(3, json!("c")).unwrap();
        }
        let log = SequenceLog::open(&log_path(&dir)).unwrap();
        let sequences: Vec<_> = log.entries().keys().copied().collect();
        assert_eq!(sequences, vec![2, 3]);
        assert_eq!(log.record_count(), 4);
    }

    #[test]
    fn test_each_append_writes_one_line() {
        let dir = TempDir::new().unwrap();
        let mut log = SequenceLog::open(&log_path(&dir)).unwrap();
        for n in 1..=100 {
            log.append(n, json!(n)).unwrap();
        }
        log.append(100, json!(100)).unwrap();

        let lines = fs::read_to_string(log_path(&dir)).unwrap().lines().count();
        assert_eq!(lines, 100);
        assert_eq!(log.record_count(), 100);
    }

    #[test]
    fn test_truncation_compacts_dead_records() {
        let dir = TempDir::new().unwrap();
        let mut log = SequenceLog::open(&log_path(&dir)).unwrap();
        for n in 1..=200 {
            log.append(n, json!(n)).unwrap();
        }
        log.truncate_below(195).unwrap();
        assert_eq!(log.entries().len(), 6);
        assert_eq!(log.record_count(), 6);
        assert!(!dir.path().join("entries.log.tmp").exists());

        let reopened = SequenceLog::open(&log_path(&dir)).unwrap();
        assert_eq!(reopened.entries().keys().next(), Some(&195));
    }

    #[test]
    fn test_corrupt_record_is_rejected() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = SequenceLog::open(&log_path(&dir)).unwrap();
            log.append(1, json!(77)).unwrap();
            log.append(2, json!(88)).unwrap();
        }
        let tampered = fs::read_to_string(log_path(&dir)).unwrap().replace("77", "78");
        fs::write(log_path(&dir), tampered).unwrap();

        let err = SequenceLog::open(&log_path(&dir)).unwrap_err();
        assert!(matches!(err, PersistenceError::ChecksumMismatch(_)));
    }
}
