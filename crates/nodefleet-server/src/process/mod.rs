//! The four cooperating server processes.
//!
//! ```text
//!            ┌──────┐
//!            │  db  │ level 0
//!            └──┬───┘
//!               │ db API
//!            ┌──┴───┐   blocking API (serialized)  ┌──────────┐
//!  clients ─►│ main │─────────────────────────────►│ blocking │ level 2
//!   (hub)    └──┬───┘                              └──────────┘
//!               │ cs / ns APIs            level 1
//!            ┌──┴───┐
//!            │ hub  │ level 2, TCP front door
//!            └──────┘
//! ```

mod blocking;
mod db;
mod hub;
mod main;

pub use blocking::BlockingProcess;
pub use db::DbProcess;
pub use hub::HubProcess;
pub use main::MainProcess;

use nodefleet_config::NodefleetConfig;
use nodefleet_daemon::{run_process, DaemonError, Launcher, ProcessContext, ProcessManager};

pub const DB: &str = "db";
pub const MAIN: &str = "main";
pub const BLOCKING: &str = "blocking";
pub const HUB: &str = "hub";

/// Processes to supervise with their levels.
pub fn process_table(config: &NodefleetConfig) -> Vec<(&'static str, u8)> {
    let mut table = vec![(DB, 0), (MAIN, 1), (BLOCKING, 2)];
    if config.hub.enabled {
        table.push((HUB, 2));
    }
    table
}

/// Channels the supervisor creates between processes.
pub fn links(config: &NodefleetConfig) -> Vec<(&'static str, &'static str)> {
    let mut links = vec![(DB, MAIN), (MAIN, BLOCKING)];
    if config.hub.enabled {
        links.push((MAIN, HUB));
    }
    links
}

/// Supervisor for the whole group.
pub fn build_manager(config: &NodefleetConfig, launcher: Launcher) -> ProcessManager {
    let manager = process_table(config)
        .into_iter()
        .fold(ProcessManager::new(config.daemon.clone(), launcher), |m, (name, level)| {
            m.with_process(name, level)
        });
    links(config)
        .into_iter()
        .fold(manager, |m, (a, b)| m.with_link(a, b))
}

/// Run the process called `name` in this OS process.
pub fn run_named(name: &str, ctx: ProcessContext, listen_signals: bool) -> Result<(), DaemonError> {
    match name {
        DB => run_process(DbProcess::new(), ctx, listen_signals),
        MAIN => run_process(MainProcess::new(), ctx, listen_signals),
        BLOCKING => run_process(BlockingProcess::new(), ctx, listen_signals),
        HUB => run_process(HubProcess::new(), ctx, listen_signals),
        other => Err(DaemonError::UnknownProcess(other.to_string())),
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
