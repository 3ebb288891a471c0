//! Lifecycle events of the replication core
//!
//! Events are explicit and typed so that the interesting moments of a
//! stripe's life (role changes, passive admission, GC coordination, zaps)
//! always log under the same name.

use std::fmt;

/// Observable events emitted by the replication core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// Node booted, role not yet decided
    NodeStarted,
    /// Local lifecycle state changed
    StateChanged,
    /// Local node became the active coordinator
    ActivatedAsCoordinator,
    /// Stripe id generated for the first time
    StripeIdGenerated,
    /// Persisted stripe id does not match the stripe being joined (FATAL)
    StripeIdMismatch,

    // Cluster state
    /// Full cluster state published to passives
    ClusterStatePublished,
    /// Stale sequence value ignored
    RegressiveUpdateIgnored,

    // Passive sync
    /// Passive admitted for object sync
    PassiveSyncAdmitted,
    /// Passive sync queued behind a running GC cycle
    PassiveSyncQueued,
    /// Passive sync started streaming objects
    PassiveSyncStarted,
    /// Passive sync finished, passive moved to standby
    PassiveSyncComplete,
    /// Passive removed mid-sync
    PassiveSyncCancelled,

    // Distributed GC
    /// GC disabled while passives sync
    GcDisabled,
    /// GC re-enabled after the last passive synced
    GcEnabled,
    /// GC result relayed to passives
    GcResultRelayed,

    // Eviction & arbitration
    /// A peer was zapped
    NodeZapped,
    /// Two actives detected
    SplitBrainDetected,
    /// Local node won arbitration and keeps running
    ArbitrationWon,
    /// Local node lost arbitration and terminates (FATAL)
    ArbitrationLost,
    /// Local node terminates after being zapped (FATAL)
    LocalNodeTerminated,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::NodeStarted => "NODE_STARTED",
            Event::StateChanged => "STATE_CHANGED",
            Event::ActivatedAsCoordinator => "ACTIVATED_AS_COORDINATOR",
            Event::StripeIdGenerated => "STRIPE_ID_GENERATED",
            Event::StripeIdMismatch => "STRIPE_ID_MISMATCH",

            Event::ClusterStatePublished => "CLUSTER_STATE_PUBLISHED",
            Event::RegressiveUpdateIgnored => "REGRESSIVE_UPDATE_IGNORED",

            Event::PassiveSyncAdmitted => "PASSIVE_SYNC_ADMITTED",
            Event::PassiveSyncQueued => "PASSIVE_SYNC_QUEUED",
            Event::PassiveSyncStarted => "PASSIVE_SYNC_STARTED",
            Event::PassiveSyncComplete => "PASSIVE_SYNC_COMPLETE",
            Event::PassiveSyncCancelled => "PASSIVE_SYNC_CANCELLED",

            Event::GcDisabled => "GC_DISABLED",
            Event::GcEnabled => "GC_ENABLED",
            Event::GcResultRelayed => "GC_RESULT_RELAYED",

            Event::NodeZapped => "NODE_ZAPPED",
            Event::SplitBrainDetected => "SPLIT_BRAIN_DETECTED",
            Event::ArbitrationWon => "ARBITRATION_WON",
            Event::ArbitrationLost => "ARBITRATION_LOST",
            Event::LocalNodeTerminated => "LOCAL_NODE_TERMINATED",
        }
    }

    /// Returns true if this event means the local node cannot continue
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Event::StripeIdMismatch | Event::ArbitrationLost | Event::LocalNodeTerminated
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
