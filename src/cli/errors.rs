//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero status.

use std::io;

use thiserror::Error;

use crate::persistence::PersistenceError;
use crate::replication::ReplicationError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    ConfigError,
    IoError,
    AlreadyInitialized,
    NotInitialized,
    StateError,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "STRIPE_CLI_CONFIG_ERROR",
            Self::IoError => "STRIPE_CLI_IO_ERROR",
            Self::AlreadyInitialized => "STRIPE_CLI_ALREADY_INITIALIZED",
            Self::NotInitialized => "STRIPE_CLI_NOT_INITIALIZED",
            Self::StateError => "STRIPE_CLI_STATE_ERROR",
        }
    }
}

/// CLI error
#[derive(Debug, Error)]
#[error("{}: {message}", .code.code())]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn already_initialized(data_dir: &std::path::Path) -> Self {
        Self::new(
            CliErrorCode::AlreadyInitialized,
            format!("{} already initialized", data_dir.display()),
        )
    }

    pub fn not_initialized(data_dir: &std::path::Path) -> Self {
        Self::new(
            CliErrorCode::NotInitialized,
            format!(
                "{} not initialized. Run 'stripekeeper init' first.",
                data_dir.display()
            ),
        )
    }

    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<PersistenceError> for CliError {
    fn from(e: PersistenceError) -> Self {
        Self::new(CliErrorCode::StateError, e.to_string())
    }
}

impl From<ReplicationError> for CliError {
    fn from(e: ReplicationError) -> Self {
        let code = match e.kind {
            crate::replication::ReplicationErrorKind::ConfigurationError => {
                CliErrorCode::ConfigError
            }
            _ => CliErrorCode::StateError,
        };
        Self::new(code, e.message)
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_code() {
        let err = CliError::config_error("bad");
        assert_eq!(err.to_string(), "STRIPE_CLI_CONFIG_ERROR: bad");
    }

    #[test]
    fn test_replication_config_error_maps_to_config_code() {
        let err: CliError = ReplicationError::configuration_error("zero batch").into();
        assert_eq!(err.code(), &CliErrorCode::ConfigError);
    }
}
