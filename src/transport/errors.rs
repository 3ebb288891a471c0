//! Transport errors

use thiserror::Error;

use crate::model::NodeId;

/// Result type for group transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Group transport errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Node unreachable: {0}")]
    NodeUnreachable(NodeId),

    #[error("Timed out waiting for {0}")]
    Timeout(NodeId),

    #[error("No response from {0}")]
    NoResponse(NodeId),

    #[error("Local node is not connected to the group")]
    Disconnected,

    #[error("No async runtime to run background work on")]
    NoRuntime,
}

impl TransportError {
    /// Node the failure is attributed to, if any.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            TransportError::NodeUnreachable(n)
            | TransportError::Timeout(n)
            | TransportError::NoResponse(n) => Some(*n),
            TransportError::Disconnected | TransportError::NoRuntime => None,
        }
    }
}
