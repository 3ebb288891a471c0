//! Persistence errors

use thiserror::Error;

/// Result type for persistor operations
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Cluster-state persistence errors
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("Checksum mismatch in {0}")]
    ChecksumMismatch(String),

    #[error("Malformed state document: {0}")]
    Malformed(String),

    #[error("Unexpected value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl PersistenceError {
    pub fn io(path: impl Into<String>, err: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn invalid_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        PersistenceError::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}
