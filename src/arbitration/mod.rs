//! Weight-based arbitration
//!
//! Each node computes a weight vector from local state; vectors compare
//! lexicographically and the higher one wins. Used to break election ties
//! and to decide which of two nodes claiming the active role survives a
//! split brain. This is a heuristic, not a consensus protocol.

mod generators;
mod weights;
mod zap;

pub use generators::{
    ConnectedClientsWeightGenerator, ConsistencyMode, ConsistencyPriorities,
    ConsistencyWeightGenerator, LocalWeightSources, RandomWeightGenerator,
    ServerIdentityWeightGenerator, TransactionRecencyWeightGenerator, UptimeWeightGenerator,
    WeightGenerator, WeightGeneratorFactory,
};
pub use weights::{elect_winner, resolve_split_brain, Enrollment, SplitBrainVerdict, WeightVector};
pub use zap::{HaZapNodeRequestProcessor, NodeTerminator, ProcessTerminator, ZapEventListener};
