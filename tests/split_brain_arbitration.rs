//! Split-Brain Arbitration Tests
//!
//! Two nodes that both claim the active role compare weight vectors:
//! - the lexicographically lower vector terminates
//! - the winner survives and tells the loser to back off
//! - a passive zapped by the active terminates and marks its database dirty

mod common;

use common::{small_batches, spawn_node, MemoryObjectStore};
use stripekeeper::model::{ServerState, ZapReason};
use stripekeeper::replication::StateManager;
use stripekeeper::transport::{GroupManager, LocalNetwork};

// =============================================================================
// Dual Active
// =============================================================================

/// (3,10,7) loses to (3,10,9) on the last position.
#[tokio::test]
async fn test_lower_weights_terminate_on_split_brain() {
    let network = LocalNetwork::new();
    let config = small_batches();

    let a = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[3, 10, 7]);
    a.node.start_as_active().await.unwrap();
    network.settle().await;

    let b = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[3, 10, 9]);
    b.node.start_as_active().await.unwrap();
    network.settle().await;

    assert!(a.terminator.is_terminated());
    assert_eq!(a.terminator.reasons().len(), 1);
    assert!(!b.terminator.is_terminated());

    let back_off = network
        .zaps_of(a.id())
        .into_iter()
        .any(|z| z.from == b.id() && z.reason == ZapReason::SplitBrain);
    assert!(back_off, "winner must ask the loser to back off");
}

/// The winner keeps serving as active.
#[tokio::test]
async fn test_winner_stays_active() {
    let network = LocalNetwork::new();
    let config = small_batches();

    let a = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[5, 0]);
    a.node.start_as_active().await.unwrap();
    network.settle().await;

    let b = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[4, 100]);
    b.node.start_as_active().await.unwrap();
    network.settle().await;

    assert!(!a.terminator.is_terminated());
    assert!(b.terminator.is_terminated());
    assert_eq!(a.node.roles.current_state(), ServerState::ActiveCoordinator);
}

/// Identical vectors still produce exactly one survivor.
#[tokio::test]
async fn test_equal_weights_terminate_exactly_one() {
    let network = LocalNetwork::new();
    let config = small_batches();

    let a = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[1, 2, 3]);
    a.node.start_as_active().await.unwrap();
    network.settle().await;

    let b = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[1, 2, 3]);
    b.node.start_as_active().await.unwrap();
    network.settle().await;

    let terminated = [&a, &b]
        .iter()
        .filter(|n| n.terminator.is_terminated())
        .count();
    assert_eq!(terminated, 1);
}

// =============================================================================
// Passive Eviction
// =============================================================================

/// A zapped passive terminates once and persists a dirty database.
#[tokio::test]
async fn test_zapped_passive_marks_db_dirty() {
    let network = LocalNetwork::new();
    let config = small_batches();

    let active = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[1]);
    let passive = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[1]);
    passive.node.start_as_passive(active.id()).unwrap();
    active.node.start_as_active().await.unwrap();
    network.settle().await;

    active
        .node
        .group
        .zap_node(passive.id(), ZapReason::ProgramError, "test eviction");
    network.settle().await;

    assert_eq!(passive.terminator.reasons(), vec![ZapReason::ProgramError]);
    assert!(!passive.node.cluster_state.lock().is_db_clean());
}

/// A passive cannot zap anyone but the active, and only for losing it.
#[tokio::test]
async fn test_passive_zap_is_refused() {
    let network = LocalNetwork::new();
    let config = small_batches();

    let active = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[1]);
    let passive = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[1]);
    passive.node.start_as_passive(active.id()).unwrap();
    active.node.start_as_active().await.unwrap();
    network.settle().await;

    let before = network.zaps().len();
    passive
        .node
        .group
        .zap_node(active.id(), ZapReason::ProgramError, "not allowed");
    network.settle().await;

    assert_eq!(network.zaps().len(), before);
    assert!(!active.terminator.is_terminated());
}
