//! Replication Error Types
//!
//! Regressive updates are not errors: they are logged and ignored at the
//! call site. What remains here is either a local programming fault
//! (illegal transition), a hard fault that ends the node (stripe mismatch)
//! or a collaborator failure.

use thiserror::Error;

use crate::persistence::PersistenceError;
use crate::transport::TransportError;

/// Replication error type
#[derive(Debug, Clone, Error)]
#[error("ReplicationError({kind:?}): {message}")]
pub struct ReplicationError {
    /// Error kind
    pub kind: ReplicationErrorKind,
    /// Error message
    pub message: String,
}

/// Replication error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationErrorKind {
    /// Illegal state transition attempted
    IllegalTransition,

    /// Persisted stripe id differs from the stripe being joined
    StripeMismatch,

    /// Node has no sync state on the active
    UnknownNode,

    /// Object store lookup failed
    ObjectLookup,

    /// Peer answered with the wrong message
    UnexpectedReply,

    /// Persistence layer failed
    Persistence,

    /// Transport layer failed
    Transport,

    /// Configuration error
    ConfigurationError,
}

impl ReplicationError {
    /// Create a new replication error.
    pub fn new(kind: ReplicationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create an illegal transition error.
    pub fn illegal_transition(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::IllegalTransition, message)
    }

    /// Create a stripe mismatch error.
    pub fn stripe_mismatch(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::StripeMismatch, message)
    }

    pub fn unknown_node(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::UnknownNode, message)
    }

    pub fn object_lookup(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::ObjectLookup, message)
    }

    pub fn unexpected_reply(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::UnexpectedReply, message)
    }

    /// Create a configuration error.
    pub fn configuration_error(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::ConfigurationError, message)
    }

    /// Check if this error must end the local node.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ReplicationErrorKind::StripeMismatch | ReplicationErrorKind::Persistence
        )
    }
}

impl From<PersistenceError> for ReplicationError {
    fn from(err: PersistenceError) -> Self {
        Self::new(ReplicationErrorKind::Persistence, err.to_string())
    }
}

impl From<TransportError> for ReplicationError {
    fn from(err: TransportError) -> Self {
        Self::new(ReplicationErrorKind::Transport, err.to_string())
    }
}

/// Result type for replication operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(ReplicationError::stripe_mismatch("test").is_fatal());
        assert!(ReplicationError::from(PersistenceError::ChecksumMismatch("f".into())).is_fatal());
    }

    #[test]
    fn test_non_fatal_errors() {
        assert!(!ReplicationError::illegal_transition("test").is_fatal());
        assert!(!ReplicationError::object_lookup("test").is_fatal());
        assert!(!ReplicationError::unexpected_reply("test").is_fatal());
        assert!(!ReplicationError::from(TransportError::Disconnected).is_fatal());
    }

    #[test]
    fn test_display_carries_kind_and_message() {
        let err = ReplicationError::illegal_transition("IN_SYNC -> START");
        let shown = err.to_string();
        assert!(shown.contains("IllegalTransition"));
        assert!(shown.contains("IN_SYNC -> START"));
    }
}
