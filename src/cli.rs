//! CLI definitions for nodefleet.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// nodefleet CLI.
#[derive(Parser)]
#[command(name = "nodefleet")]
#[command(about = "Fleet management server for network-booted testbed nodes")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "NODEFLEET_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start the process group and supervise it in the foreground
    Serve,

    /// Ask a running supervisor to shut down
    Stop {
        /// Kill the supervisor if it has not exited after the shutdown timeout
        #[arg(long)]
        force: bool,
    },

    /// Ask a running supervisor to re-read the feature spec
    Reload,

    /// Show whether a supervisor is running
    Status,

    /// Validate the configuration file
    CheckConfig,

    /// Run one server process (started by the supervisor)
    #[command(hide = true)]
    Process {
        /// Process name: db, main, blocking or hub
        name: String,
    },
}
