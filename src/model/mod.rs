//! Data model shared by the replication core.
//!
//! Pure value types: identifiers, lifecycle labels, eviction reason codes
//! and the change sets carried by transactions.

mod ids;
mod server_state;
mod transaction;
mod zap;

pub use ids::{
    ClientTransactionId, ConnectionId, GlobalTransactionId, GroupId, NodeId, ObjectId,
    ObjectIdSet, ServerTransactionId, StripeId,
};
pub use server_state::ServerState;
pub use transaction::{DgcResultContext, Dna, DnaKind, GcInfo, ObjectSnapshot, ServerTransaction};
pub use zap::ZapReason;
