//! Daemon-related errors.

use std::path::PathBuf;
use std::time::Duration;

use nodefleet_config::ConfigError;
use nodefleet_runloop::RunLoopError;
use thiserror::Error;

/// Errors that can occur while supervising or running server processes.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// PID file exists and its process is alive.
    #[error("Daemon already running (PID file: {path}, PID: {pid})")]
    AlreadyRunning { path: PathBuf, pid: u32 },

    /// Failed to create PID file.
    #[error("Failed to create PID file at {path}: {reason}")]
    PidFileCreation { path: PathBuf, reason: String },

    /// Failed to read PID file.
    #[error("Failed to read PID file at {path}: {reason}")]
    PidFileRead { path: PathBuf, reason: String },

    /// Failed to remove PID file.
    #[error("Failed to remove PID file at {path}: {reason}")]
    PidFileRemoval { path: PathBuf, reason: String },

    /// Failed to set up signal handlers.
    #[error("Failed to set up signal handlers: {0}")]
    SignalSetup(String),

    /// Failed to start a child process.
    #[error("Failed to spawn process {name}: {reason}")]
    Spawn { name: String, reason: String },

    /// A process expected a channel that was not passed to it.
    #[error("Process {process} has no channel to {peer}")]
    MissingChannel { process: String, peer: String },

    /// The channel description in the environment is malformed.
    #[error("Invalid channel map: {0}")]
    InvalidChannelMap(String),

    /// A process failed while preparing.
    #[error("Process {name} failed to prepare: {reason}")]
    Prepare { name: String, reason: String },

    /// Unknown process kind.
    #[error("Unknown process: {0}")]
    UnknownProcess(String),

    /// Too many restarts.
    #[error("Maximum restart count ({max}) exceeded within {window:?}")]
    MaxRestartsExceeded { max: u32, window: Duration },

    /// A child exited and restarts are disabled.
    #[error("Process {name} exited: {status}")]
    ProcessExited { name: String, status: String },

    /// Sending a signal failed.
    #[error("Failed to send {signal} to PID {pid}: {reason}")]
    Signal { signal: String, pid: u32, reason: String },

    /// Event loop failure inside a process.
    #[error("Event loop error: {0}")]
    RunLoop(#[from] RunLoopError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    /// Prepare failure with any displayable cause.
    pub fn prepare(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        DaemonError::Prepare {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_running_display() {
        let err = DaemonError::AlreadyRunning {
            path: PathBuf::from("/run/nodefleet.pid"),
            pid: 42,
        };
        let display = err.to_string();
        assert!(display.contains("/run/nodefleet.pid"));
        assert!(display.contains("42"));
    }

    #[test]
    fn test_missing_channel_display() {
        let err = DaemonError::MissingChannel {
            process: "main".into(),
            peer: "db".into(),
        };
        assert_eq!(err.to_string(), "Process main has no channel to db");
    }

    #[test]
    fn test_prepare_helper() {
        let err = DaemonError::prepare("hub", "address in use");
        assert!(err.to_string().contains("hub"));
        assert!(err.to_string().contains("address in use"));
    }

    #[test]
    fn test_from_runloop_error() {
        let err: DaemonError = RunLoopError::Reentrant.into();
        assert!(matches!(err, DaemonError::RunLoop(_)));
    }
}
