//! Weight generators
//!
//! Each generator is a pure, non-blocking function of local server state.
//! The registration order is part of the comparison contract and must be
//! identical on every stripe member; [`WeightGeneratorFactory::standard`]
//! fixes it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::weights::WeightVector;
use crate::model::{GlobalTransactionId, NodeId};

/// Produces one position of the weight vector.
pub trait WeightGenerator: Send + Sync {
    fn name(&self) -> &'static str;
    fn weight(&self) -> i64;
}

/// Consistency mode a node is operating in at arbitration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyMode {
    /// Serving without waiting on any peer.
    NonBlocking,
    /// Serving, availability preferred over consistency.
    Available,
    /// Blocked waiting for a peer for `waited`.
    Blocked { waited: Duration },
}

/// Priority assigned to each consistency mode.
///
/// Must be strictly ordered `non_blocking > available > blocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyPriorities {
    #[serde(default = "default_non_blocking")]
    pub non_blocking: i64,
    #[serde(default = "default_available")]
    pub available: i64,
    #[serde(default = "default_blocked")]
    pub blocked: i64,
}

fn default_non_blocking() -> i64 {
    3
}

fn default_available() -> i64 {
    2
}

fn default_blocked() -> i64 {
    1
}

impl Default for ConsistencyPriorities {
    fn default() -> Self {
        Self {
            non_blocking: default_non_blocking(),
            available: default_available(),
            blocked: default_blocked(),
        }
    }
}

impl ConsistencyPriorities {
    pub fn is_ordered(&self) -> bool {
        self.non_blocking > self.available && self.available > self.blocked
    }

    /// Weight of `mode`. A blocked node loses one point per whole second
    /// waited, so the shortest wait scores highest among blocked nodes.
    pub fn weight_of(&self, mode: ConsistencyMode) -> i64 {
        match mode {
            ConsistencyMode::NonBlocking => self.non_blocking,
            ConsistencyMode::Available => self.available,
            ConsistencyMode::Blocked { waited } => {
                let waited = i64::try_from(waited.as_secs()).unwrap_or(i64::MAX);
                self.blocked
                    .saturating_sub(waited)
                    .min(self.available.saturating_sub(1))
            }
        }
    }
}

type Source<T> = Arc<dyn Fn() -> T + Send + Sync>;

pub struct ConsistencyWeightGenerator {
    priorities: ConsistencyPriorities,
    mode: Source<ConsistencyMode>,
}

impl ConsistencyWeightGenerator {
    pub fn new(
        priorities: ConsistencyPriorities,
        mode: impl Fn() -> ConsistencyMode + Send + Sync + 'static,
    ) -> Self {
        Self {
            priorities,
            mode: Arc::new(mode),
        }
    }
}

impl WeightGenerator for ConsistencyWeightGenerator {
    fn name(&self) -> &'static str {
        "consistency"
    }

    fn weight(&self) -> i64 {
        self.priorities.weight_of((self.mode)())
    }
}

pub struct ConnectedClientsWeightGenerator {
    count: Source<usize>,
}

impl ConnectedClientsWeightGenerator {
    pub fn new(count: impl Fn() -> usize + Send + Sync + 'static) -> Self {
        Self {
            count: Arc::new(count),
        }
    }
}

impl WeightGenerator for ConnectedClientsWeightGenerator {
    fn name(&self) -> &'static str {
        "connected-clients"
    }

    fn weight(&self) -> i64 {
        i64::try_from((self.count)()).unwrap_or(i64::MAX)
    }
}

pub struct TransactionRecencyWeightGenerator {
    last: Source<GlobalTransactionId>,
}

impl TransactionRecencyWeightGenerator {
    pub fn new(last: impl Fn() -> GlobalTransactionId + Send + Sync + 'static) -> Self {
        Self {
            last: Arc::new(last),
        }
    }
}

impl WeightGenerator for TransactionRecencyWeightGenerator {
    fn name(&self) -> &'static str {
        "transaction-recency"
    }

    fn weight(&self) -> i64 {
        i64::try_from((self.last)().value()).unwrap_or(i64::MAX)
    }
}

/// Stable per-node value: the leading 8 bytes of the node's UUID. The same
/// node always produces the same weight, on every member and every run.
pub struct ServerIdentityWeightGenerator {
    weight: i64,
}

impl ServerIdentityWeightGenerator {
    pub fn new(node: NodeId) -> Self {
        let bytes = node.as_uuid().into_bytes();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&bytes[..8]);
        Self {
            weight: i64::from_be_bytes(prefix),
        }
    }
}

impl WeightGenerator for ServerIdentityWeightGenerator {
    fn name(&self) -> &'static str {
        "server-identity"
    }

    fn weight(&self) -> i64 {
        self.weight
    }
}

pub struct UptimeWeightGenerator {
    started: Instant,
}

impl UptimeWeightGenerator {
    pub fn new() -> Self {
        Self::since(Instant::now())
    }

    pub fn since(started: Instant) -> Self {
        Self { started }
    }
}

impl Default for UptimeWeightGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightGenerator for UptimeWeightGenerator {
    fn name(&self) -> &'static str {
        "uptime"
    }

    fn weight(&self) -> i64 {
        self.started.elapsed().as_secs_f64().round() as i64
    }
}

/// Final tie-breaker, drawn from the OS entropy source on every call.
#[derive(Default)]
pub struct RandomWeightGenerator;

impl WeightGenerator for RandomWeightGenerator {
    fn name(&self) -> &'static str {
        "random"
    }

    fn weight(&self) -> i64 {
        OsRng.gen::<i64>()
    }
}

/// Inputs for the standard generator set.
pub struct LocalWeightSources {
    pub node_id: NodeId,
    pub priorities: ConsistencyPriorities,
    pub consistency: Box<dyn Fn() -> ConsistencyMode + Send + Sync>,
    pub connected_clients: Box<dyn Fn() -> usize + Send + Sync>,
    pub last_transaction: Box<dyn Fn() -> GlobalTransactionId + Send + Sync>,
    pub started: Instant,
}

/// Ordered registry of weight generators.
#[derive(Default)]
pub struct WeightGeneratorFactory {
    generators: Vec<Box<dyn WeightGenerator>>,
}

impl WeightGeneratorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard set: consistency, connected clients, transaction
    /// recency, server identity, uptime, random.
    pub fn standard(sources: LocalWeightSources) -> Self {
        let mut factory = Self::new();
        factory.add(ConsistencyWeightGenerator::new(
            sources.priorities,
            sources.consistency,
        ));
        factory.add(ConnectedClientsWeightGenerator::new(sources.connected_clients));
        factory.add(TransactionRecencyWeightGenerator::new(sources.last_transaction));
        factory.add(ServerIdentityWeightGenerator::new(sources.node_id));
        factory.add(UptimeWeightGenerator::since(sources.started));
        factory.add(RandomWeightGenerator);
        factory
    }

    pub fn add(&mut self, generator: impl WeightGenerator + 'static) {
        self.generators.push(Box::new(generator));
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.generators.iter().map(|g| g.name()).collect()
    }

    /// Invokes every generator once, in registration order.
    pub fn generate_weight_sequence(&self) -> WeightVector {
        WeightVector::new(self.generators.iter().map(|g| g.weight()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sources(node_id: NodeId) -> LocalWeightSources {
        LocalWeightSources {
            node_id,
            priorities: ConsistencyPriorities::default(),
            consistency: Box::new(|| ConsistencyMode::NonBlocking),
            connected_clients: Box::new(|| 4),
            last_transaction: Box::new(|| GlobalTransactionId::new(120)),
            started: Instant::now(),
        }
    }

    #[test]
    fn test_standard_order() {
        let factory = WeightGeneratorFactory::standard(sources(NodeId::random()));
        assert_eq!(
            factory.names(),
            vec![
                "consistency",
                "connected-clients",
                "transaction-recency",
                "server-identity",
                "uptime",
                "random"
            ]
        );
    }

    #[test]
    fn test_sequence_positions() {
        let node = NodeId::random();
        let factory = WeightGeneratorFactory::standard(sources(node));
        let w = factory.generate_weight_sequence();
        let w = w.as_slice();
        assert_eq!(w.len(), 6);
        assert_eq!(w[0], 3);
        assert_eq!(w[1], 4);
        assert_eq!(w[2], 120);
        assert_eq!(w[3], ServerIdentityWeightGenerator::new(node).weight());
        assert_eq!(w[4], 0);
    }

    #[test]
    fn test_each_generator_invoked_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut factory = WeightGeneratorFactory::new();
        factory.add(ConnectedClientsWeightGenerator::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            1
        }));
        factory.generate_weight_sequence();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_consistency_priority_order() {
        let p = ConsistencyPriorities::default();
        let non_blocking = p.weight_of(ConsistencyMode::NonBlocking);
        let available = p.weight_of(ConsistencyMode::Available);
        let short = p.weight_of(ConsistencyMode::Blocked {
            waited: Duration::from_secs(1),
        });
        let long = p.weight_of(ConsistencyMode::Blocked {
            waited: Duration::from_secs(30),
        });
        assert!(non_blocking > available);
        assert!(available > short);
        assert!(short > long);
    }

    #[test]
    fn test_custom_priorities() {
        let p = ConsistencyPriorities {
            non_blocking: 100,
            available: 50,
            blocked: 10,
        };
        assert!(p.is_ordered());
        assert_eq!(p.weight_of(ConsistencyMode::Available), 50);
        assert!(!ConsistencyPriorities {
            non_blocking: 1,
            available: 2,
            blocked: 0
        }
        .is_ordered());
    }

    #[test]
    fn test_identity_weight_is_stable() {
        let node = NodeId::random();
        assert_eq!(
            ServerIdentityWeightGenerator::new(node).weight(),
            ServerIdentityWeightGenerator::new(node).weight()
        );
    }
}
