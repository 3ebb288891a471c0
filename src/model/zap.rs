//! Reason codes attached to an eviction ("zap") request.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a node is being forcibly evicted from the stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZapReason {
    CommunicationError,
    ProgramError,
    NodeJoinedWithDirtyDb,
    CommunicationToActiveError,
    PartiallySyncedPassiveJoined,
    InsufficientResources,
    SplitBrain,
}

impl ZapReason {
    /// Numeric code carried on the wire and in logs.
    pub fn code(&self) -> u8 {
        match self {
            Self::CommunicationError => 0x01,
            Self::ProgramError => 0x02,
            Self::NodeJoinedWithDirtyDb => 0x03,
            Self::CommunicationToActiveError => 0x04,
            Self::PartiallySyncedPassiveJoined => 0x05,
            Self::InsufficientResources => 0x06,
            Self::SplitBrain => 0xff,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommunicationError => "COMMUNICATION ERROR",
            Self::ProgramError => "PROGRAM ERROR",
            Self::NodeJoinedWithDirtyDb => "NODE JOINED WITH DIRTY DB",
            Self::CommunicationToActiveError => "COMMUNICATION TO ACTIVE SERVER ERROR",
            Self::PartiallySyncedPassiveJoined => "PARTIALLY SYNCED PASSIVE JOINED",
            Self::InsufficientResources => "INSUFFICIENT RESOURCES",
            Self::SplitBrain => "SPLIT BRAIN",
        }
    }

    /// Reasons that mean the receiving node's local data can no longer be
    /// trusted on restart.
    pub fn marks_database_dirty(&self) -> bool {
        !matches!(self, Self::CommunicationToActiveError)
    }
}

impl fmt::Display for ZapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.as_str(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let all = [
            ZapReason::CommunicationError,
            ZapReason::ProgramError,
            ZapReason::NodeJoinedWithDirtyDb,
            ZapReason::CommunicationToActiveError,
            ZapReason::PartiallySyncedPassiveJoined,
            ZapReason::InsufficientResources,
            ZapReason::SplitBrain,
        ];
        let codes: std::collections::HashSet<u8> = all.iter().map(|r| r.code()).collect();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn test_display_includes_code() {
        assert!(ZapReason::SplitBrain.to_string().contains("0xff"));
    }
}
