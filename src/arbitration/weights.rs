//! Weight vectors, enrollments and split-brain resolution

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::NodeId;

/// Ordered tuple of weights, one per registered generator.
///
/// Ordering is lexicographic, element by element; higher wins. A vector
/// that is a strict prefix of another compares lower.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WeightVector(Vec<i64>);

impl WeightVector {
    pub fn new(weights: Vec<i64>) -> Self {
        Self(weights)
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<i64> {
        self.0
    }

    /// Strictly greater than `other`.
    pub fn wins_over(&self, other: &WeightVector) -> bool {
        self.cmp(other) == Ordering::Greater
    }
}

impl From<Vec<i64>> for WeightVector {
    fn from(weights: Vec<i64>) -> Self {
        Self(weights)
    }
}

impl fmt::Display for WeightVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|w| w.to_string()).collect();
        write!(f, "({})", parts.join(","))
    }
}

/// A node's bid in an election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub node_id: NodeId,
    /// A node that was not part of the previous cluster.
    pub is_new_candidate: bool,
    pub weights: WeightVector,
}

impl Enrollment {
    pub fn new(node_id: NodeId, is_new_candidate: bool, weights: WeightVector) -> Self {
        Self {
            node_id,
            is_new_candidate,
            weights,
        }
    }

    /// Whether this enrollment beats `other`.
    ///
    /// A new candidate never beats an established node; otherwise the
    /// higher weight vector wins, then the higher node id.
    pub fn wins(&self, other: &Enrollment) -> bool {
        if self.is_new_candidate != other.is_new_candidate {
            return !self.is_new_candidate;
        }
        match self.weights.cmp(&other.weights) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.node_id > other.node_id,
        }
    }
}

/// Picks the election winner, or `None` for no enrollments.
pub fn elect_winner(enrollments: &[Enrollment]) -> Option<&Enrollment> {
    enrollments
        .iter()
        .fold(None, |best: Option<&Enrollment>, e| match best {
            Some(b) if !e.wins(b) => Some(b),
            _ => Some(e),
        })
}

/// Outcome of a split-brain comparison for the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitBrainVerdict {
    /// Local node keeps its role.
    Continue,
    /// Local node must terminate.
    Terminate,
}

/// Decides which of two nodes claiming the active role survives.
///
/// The lower vector terminates. Equal vectors fall back to node id order
/// (the higher id survives) so that exactly one side terminates.
pub fn resolve_split_brain(
    local: NodeId,
    local_weights: &WeightVector,
    peer: NodeId,
    peer_weights: &WeightVector,
) -> SplitBrainVerdict {
    let local_wins = match local_weights.cmp(peer_weights) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => local > peer,
    };
    if local_wins {
        SplitBrainVerdict::Continue
    } else {
        SplitBrainVerdict::Terminate
    }
}
