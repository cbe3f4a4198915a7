//! nodefleet - fleet management server for network-booted testbed nodes
//!
//! Main entry point: the supervisor, the control commands and the
//! per-process entry the supervisor re-executes.

mod cli;
mod commands;

use std::path::Path;

use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nodefleet_config::ConfigLoader;

use crate::cli::{Cli, Commands};

/// Initialize tracing with console and file output.
///
/// Every process of the group logs to its own daily rotated file under
/// `log_dir`, prefixed with the process name.
fn init_tracing(log_dir: &Path, prefix: &str) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(14)
        .build(log_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The writer flushes until the guard is dropped at exit.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_ansi(true))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = ConfigLoader::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => {
            init_tracing(&config.daemon.log_dir, "nodefleet")?;
            commands::serve(config, cli.config)
        }
        Commands::Process { name } => {
            init_tracing(&config.daemon.log_dir, &name)?;
            commands::process(config, &name)
        }
        Commands::Stop { force } => commands::stop(&config, force),
        Commands::Reload => commands::reload(&config),
        Commands::Status => commands::status(&config),
        Commands::CheckConfig => commands::check_config(&config),
    }
}
