//! Lifecycle states of a stripe member.
//!
//! The labels are persisted verbatim, so they must never change.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a server node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerState {
    /// Booted, role not yet decided.
    Start,
    /// Joined an active, still catching up on the object graph.
    PassiveUninitialized,
    /// Fully synced mirror of the active.
    PassiveStandby,
    /// The coordinator: sole write authority.
    ActiveCoordinator,
}

impl ServerState {
    /// Persisted label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Start => "START-STATE",
            Self::PassiveUninitialized => "PASSIVE-UNINITIALIZED",
            Self::PassiveStandby => "PASSIVE-STANDBY",
            Self::ActiveCoordinator => "ACTIVE-COORDINATOR",
        }
    }

    /// Parses a persisted label.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "START-STATE" => Some(Self::Start),
            "PASSIVE-UNINITIALIZED" => Some(Self::PassiveUninitialized),
            "PASSIVE-STANDBY" => Some(Self::PassiveStandby),
            "ACTIVE-COORDINATOR" => Some(Self::ActiveCoordinator),
            _ => None,
        }
    }

    pub fn is_passive(&self) -> bool {
        matches!(self, Self::PassiveUninitialized | Self::PassiveStandby)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_round_trip() {
        for state in [
            ServerState::Start,
            ServerState::PassiveUninitialized,
            ServerState::PassiveStandby,
            ServerState::ActiveCoordinator,
        ] {
            assert_eq!(ServerState::from_label(state.label()), Some(state));
        }
        assert_eq!(ServerState::from_label("ACTIVE"), None);
    }

    #[test]
    fn test_persisted_labels_are_verbatim() {
        assert_eq!(ServerState::ActiveCoordinator.label(), "ACTIVE-COORDINATOR");
        assert_eq!(ServerState::PassiveStandby.label(), "PASSIVE-STANDBY");
    }
}
