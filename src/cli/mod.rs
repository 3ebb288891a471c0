//! CLI module for stripekeeper
//!
//! Offline tooling over a node's data directory:
//! - init: write a default config and a fresh cluster state
//! - inspect: print the persisted cluster state
//! - weights: print the arbitration weight vector

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{init, inspect, run, run_command, weights, CONFIG_FILE_NAME};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_response};
