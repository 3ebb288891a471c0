//! stripekeeper - replication and failover core for a server stripe
//!
//! One active coordinator holds write authority; passives mirror it. This
//! crate keeps the passives in step (cluster state, object graph sync,
//! relayed transactions) and arbitrates when two nodes both claim to be
//! active.

pub mod arbitration;
pub mod cli;
pub mod model;
pub mod observability;
pub mod persistence;
pub mod replication;
pub mod transport;
