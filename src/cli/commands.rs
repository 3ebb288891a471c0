//! CLI command implementations
//!
//! Offline tools over a node's data directory. None of them join a group.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use crate::arbitration::{ConsistencyMode, LocalWeightSources, WeightGeneratorFactory};
use crate::model::{NodeId, ServerState};
use crate::observability::init_logging;
use crate::persistence::{ClusterStatePersistor, FileClusterStatePersistor, LogKey};
use crate::replication::{
    ClusterState, GlobalTransactionStore, HaConfig, ServerGlobalTransactionManager,
};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Name of the config file `init` writes into the data directory.
pub const CONFIG_FILE_NAME: &str = "stripekeeper.json";

/// Main CLI entry point
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    init_logging(&cli.log);
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    let data = match cmd {
        Command::Init { data_dir, group_id } => init(&data_dir, group_id)?,
        Command::Inspect { data_dir } => inspect(&data_dir)?,
        Command::Weights { config, node_id } => weights(&config, node_id.map(NodeId::new))?,
    };
    write_response(data)
}

fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates `data_dir` with a default config and a fresh cluster state.
pub fn init(data_dir: &Path, group_id: u32) -> CliResult<Value> {
    let config_file = config_path(data_dir);
    if config_file.exists() {
        return Err(CliError::already_initialized(data_dir));
    }
    std::fs::create_dir_all(data_dir).map_err(|e| {
        CliError::config_error(format!("failed to create {}: {}", data_dir.display(), e))
    })?;

    let config = HaConfig {
        group_id,
        ..HaConfig::with_data_dir(data_dir)
    };
    config.save(&config_file)?;

    let persistor = Arc::new(FileClusterStatePersistor::open(data_dir)?);
    let state_file = persistor.path().to_path_buf();
    let mut state = ClusterState::load(persistor, config.group())?;
    state.set_current_state(ServerState::Start)?;
    state.set_db_clean(true)?;

    Ok(json!({
        "initialized": true,
        "config": config_file.display().to_string(),
        "state": state_file.display().to_string(),
    }))
}

/// Persisted cluster state, as stored.
pub fn inspect(data_dir: &Path) -> CliResult<Value> {
    if !config_path(data_dir).exists() {
        return Err(CliError::not_initialized(data_dir));
    }
    let persistor = FileClusterStatePersistor::open(data_dir)?;
    let global_transactions = persistor.log_entries(LogKey::GlobalTransactions)?;
    Ok(json!({
        "path": persistor.path().display().to_string(),
        "state": persistor.entries(),
        "global_transactions": global_transactions.len(),
    }))
}

/// The weight vector a node restarting from this data directory would
/// present, generator by generator.
pub fn weights(config_file: &Path, node_id: Option<NodeId>) -> CliResult<Value> {
    let config = HaConfig::load(config_file)?;
    let persistor: Arc<dyn ClusterStatePersistor> =
        Arc::new(FileClusterStatePersistor::open(&config.data_dir)?);
    let state = ClusterState::load(Arc::clone(&persistor), config.group())?;
    let gtx = GlobalTransactionStore::load(persistor)?;

    let node_id = node_id.unwrap_or_else(NodeId::random);
    let mode = if state.current_state() == ServerState::ActiveCoordinator {
        ConsistencyMode::NonBlocking
    } else {
        ConsistencyMode::Available
    };
    let clients = state.connections().len();
    let last = gtx.last_global_id();

    let factory = WeightGeneratorFactory::standard(LocalWeightSources {
        node_id,
        priorities: config.consistency_priorities,
        consistency: Box::new(move || mode),
        connected_clients: Box::new(move || clients),
        last_transaction: Box::new(move || last),
        started: Instant::now(),
    });
    let vector = factory.generate_weight_sequence();

    Ok(json!({
        "node": node_id.to_string(),
        "generators": factory.names(),
        "weights": vector.as_slice(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_then_inspect() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("node");
        let out = init(&data_dir, 3).unwrap();
        assert_eq!(out["initialized"], json!(true));

        let inspected = inspect(&data_dir).unwrap();
        assert_eq!(inspected["state"]["current_state"], json!("START-STATE"));
        assert_eq!(inspected["state"]["db_clean"], json!(true));
        assert_eq!(inspected["global_transactions"], json!(0));
    }

    #[test]
    fn test_init_twice_fails() {
        let dir = TempDir::new().unwrap();
        init(dir.path(), 0).unwrap();
        assert!(init(dir.path(), 0).is_err());
    }

    #[test]
    fn test_inspect_uninitialized_fails() {
        let dir = TempDir::new().unwrap();
        assert!(inspect(dir.path()).is_err());
    }

    #[test]
    fn test_weights_has_one_entry_per_generator() {
        let dir = TempDir::new().unwrap();
        init(dir.path(), 0).unwrap();
        let out = weights(&config_path(dir.path()), None).unwrap();
        let names = out["generators"].as_array().unwrap().len();
        let weights = out["weights"].as_array().unwrap().len();
        assert_eq!(names, 6);
        assert_eq!(weights, names);
    }
}
