//! CLI argument definitions using clap
//!
//! Commands:
//! - stripekeeper init --data-dir <dir>
//! - stripekeeper inspect --data-dir <dir>
//! - stripekeeper weights --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Stripekeeper - replication and failover core for a server stripe
#[derive(Parser, Debug)]
#[command(name = "stripekeeper")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Default log filter, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "warn")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize a data directory with a default config and fresh state
    Init {
        /// Data directory to create
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,

        /// Replication group the node belongs to
        #[arg(long, default_value_t = 0)]
        group_id: u32,
    },

    /// Print the persisted cluster state
    Inspect {
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },

    /// Print the local weight vector used for arbitration
    Weights {
        /// Path to configuration file
        #[arg(long, default_value = "./data/stripekeeper.json")]
        config: PathBuf,

        /// Node identity to weigh; random if absent
        #[arg(long)]
        node_id: Option<uuid::Uuid>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
