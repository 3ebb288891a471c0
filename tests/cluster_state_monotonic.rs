//! Cluster State Replication Tests
//!
//! The active pushes every id-sequence advance to its passives and waits
//! for the acknowledgements:
//! - sequences never move backwards, on either side
//! - the full state reaches a passive before it is queried for admission
//! - persisted values survive a restart from the same data directory

mod common;

use std::sync::Arc;

use common::{small_batches, spawn_node, MemoryObjectStore};
use stripekeeper::model::{ConnectionId, GroupId, NodeId};
use stripekeeper::persistence::{ClusterStatePersistor, FileClusterStatePersistor};
use stripekeeper::replication::ClusterState;
use stripekeeper::transport::LocalNetwork;
use tempfile::TempDir;

// =============================================================================
// Replicated Sequences
// =============================================================================

/// Advances reach the passive before the publish returns.
#[tokio::test]
async fn test_object_id_advance_is_replicated() {
    let network = LocalNetwork::new();
    let config = small_batches();
    let active = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[1]);
    let passive = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[1]);
    passive.node.start_as_passive(active.id()).unwrap();
    active.node.start_as_active().await.unwrap();

    active
        .node
        .cluster_state_manager
        .publish_next_available_object_id(100)
        .await
        .unwrap();

    assert_eq!(passive.node.cluster_state.lock().next_available_object_id(), 100);
}

/// A lower value is ignored on both sides.
#[tokio::test]
async fn test_regressive_publish_is_ignored() {
    let network = LocalNetwork::new();
    let config = small_batches();
    let active = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[1]);
    let passive = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[1]);
    passive.node.start_as_passive(active.id()).unwrap();
    active.node.start_as_active().await.unwrap();

    let csm = &active.node.cluster_state_manager;
    csm.publish_next_available_global_transaction_id(40).await.unwrap();
    csm.publish_next_available_global_transaction_id(25).await.unwrap();
    csm.publish_next_available_gc_iteration_id(7).await.unwrap();
    csm.publish_next_available_gc_iteration_id(3).await.unwrap();
    network.settle().await;

    for node in [&active, &passive] {
        let state = node.node.cluster_state.lock();
        assert_eq!(state.next_available_global_txn_id(), 40);
        assert_eq!(state.next_available_gc_iteration_id(), 7);
    }
    assert!(network.zaps().is_empty());
}

/// Connection set changes are mirrored on the passive.
#[tokio::test]
async fn test_connection_changes_are_replicated() {
    let network = LocalNetwork::new();
    let config = small_batches();
    let active = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[1]);
    let passive = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[1]);
    passive.node.start_as_passive(active.id()).unwrap();
    active.node.start_as_active().await.unwrap();

    let client = NodeId::random();
    let first = ConnectionId::new(1, client);
    let second = ConnectionId::new(2, client);
    let csm = &active.node.cluster_state_manager;
    csm.connection_created(first).await.unwrap();
    csm.connection_created(second).await.unwrap();
    csm.connection_destroyed(first).await.unwrap();

    assert_eq!(passive.node.cluster_state.lock().connections(), vec![second]);
}

/// Going active assigns a stripe id and the passive adopts it.
#[tokio::test]
async fn test_passive_adopts_stripe_id() {
    let network = LocalNetwork::new();
    let config = small_batches();
    let active = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[1]);
    let passive = spawn_node(&network, &config, MemoryObjectStore::new(u64::MAX), &[1]);
    passive.node.start_as_passive(active.id()).unwrap();
    active.node.start_as_active().await.unwrap();
    network.settle().await;

    let stripe = active.node.cluster_state.lock().stripe_id();
    assert!(!stripe.is_null());
    assert_eq!(passive.node.cluster_state.lock().stripe_id(), stripe);
}

// =============================================================================
// Persistence
// =============================================================================

/// Sequences and flags survive a reload from disk.
#[test]
fn test_state_survives_reload() {
    let dir = TempDir::new().unwrap();
    let group = GroupId::new(2);
    {
        let persistor: Arc<dyn ClusterStatePersistor> =
            Arc::new(FileClusterStatePersistor::open(dir.path()).unwrap());
        let mut state = ClusterState::load(persistor, group).unwrap();
        assert!(state.set_next_available_object_id(500));
        assert!(!state.set_next_available_object_id(10));
        state.sync_object_id_to_disk().unwrap();
        state.generate_stripe_id_if_needed().unwrap();
        state.set_db_clean(false).unwrap();
    }

    let persistor: Arc<dyn ClusterStatePersistor> =
        Arc::new(FileClusterStatePersistor::open(dir.path()).unwrap());
    let state = ClusterState::load(persistor, group).unwrap();
    assert_eq!(state.next_available_object_id(), 500);
    assert!(!state.stripe_id().is_null());
    assert!(!state.is_db_clean());
}

/// An unsynced advance is not persisted.
#[test]
fn test_unsynced_sequence_is_lost_on_reload() {
    let dir = TempDir::new().unwrap();
    let group = GroupId::new(0);
    {
        let persistor: Arc<dyn ClusterStatePersistor> =
            Arc::new(FileClusterStatePersistor::open(dir.path()).unwrap());
        let mut state = ClusterState::load(persistor, group).unwrap();
        state.set_next_available_connection_id(9);
        assert!(state.has_dirty_sequences());
    }

    let persistor: Arc<dyn ClusterStatePersistor> =
        Arc::new(FileClusterStatePersistor::open(dir.path()).unwrap());
    let state = ClusterState::load(persistor, group).unwrap();
    assert_eq!(state.next_available_connection_id(), 0);
}
