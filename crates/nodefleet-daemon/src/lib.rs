//! # nodefleet Daemon
//!
//! Process supervision for the nodefleet server.
//!
//! ## Features
//!
//! - PID file management (prevents duplicate instances)
//! - Signal forwarding into the event loop (SIGTERM/SIGINT shut down,
//!   SIGHUP re-reads the feature spec)
//! - Process group supervision with socket-pair channels between children
//! - Whole-group restart inside a restart budget
//!
//! ## Usage
//!
//! ```rust,ignore
//! use nodefleet_daemon::{Launcher, ProcessManager};
//! use nodefleet_runloop::EventLoop;
//!
//! let ev = EventLoop::new("supervisor");
//! let manager = ProcessManager::new(config.daemon.clone(), Launcher::current_exe()?)
//!     .with_process("db", 0)
//!     .with_process("main", 1)
//!     .with_link("db", "main");
//! manager.run(&ev)?;
//! ```
//!
//! Inside a child, [`run_process`] drives a [`ServerProcess`] with the
//! channels the supervisor passed down.

pub mod error;
pub mod manager;
pub mod pid;
pub mod process;
pub mod signal;

// Re-exports
pub use error::DaemonError;
pub use manager::{ChildStatus, Launcher, ManagerState, ProcessManager, ProcessSpec, RestartTracker};
pub use nodefleet_config::DaemonConfig;
pub use pid::PidFile;
pub use process::{run_process, ChannelMap, ProcessContext, ServerProcess, CHANNELS_ENV};
pub use signal::{send_signal_to_pid, DaemonSignal, SignalHandler};
