//! Error types for the server processes and their workflows.

use std::path::PathBuf;
use std::time::Duration;

use nodefleet_config::ConfigError;
use nodefleet_daemon::DaemonError;
use nodefleet_rpc::{RemoteError, RpcError};
use nodefleet_runloop::RunLoopError;
use nodefleet_workqueue::{QueueError, TaskFailure};
use thiserror::Error;

/// Errors raised by orchestration code.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A call to a sibling process failed.
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// An offloaded task failed.
    #[error("Blocking task failed: {0}")]
    Task(#[from] TaskFailure),

    /// The offload worker could not be started or stopped.
    #[error("Blocking worker error: {0}")]
    Queue(#[from] QueueError),

    /// An external command exited unsuccessfully.
    #[error("Command {command} exited with status {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },

    /// The mount lock could not be taken in time.
    #[error("Lock {path} not acquired within {waited:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// Opening or locking the lock file failed.
    #[error("Lock {path} failed: {reason}")]
    Lock { path: PathBuf, reason: String },

    /// No such node is known.
    #[error("Unknown node {0}")]
    UnknownNode(String),

    /// Process lifecycle error.
    #[error("Daemon error: {0}")]
    Daemon(#[from] DaemonError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Event loop error.
    #[error("Event loop error: {0}")]
    RunLoop(#[from] RunLoopError),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Convert into the error shipped back to an RPC caller.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            ServerError::Rpc(RpcError::Remote(remote)) => remote.clone(),
            ServerError::Task(failure) => task_to_remote(failure.clone()),
            ServerError::UnknownNode(_) => RemoteError::new("unknown_node", self.to_string()),
            _ => RemoteError::internal(self.to_string()),
        }
    }
}

/// Ship a task failure back to an RPC caller, traceback included.
pub(crate) fn task_to_remote(failure: TaskFailure) -> RemoteError {
    match failure {
        TaskFailure::Failed { message, traceback } => {
            let error = RemoteError::new("task_failed", message);
            match traceback {
                Some(tb) => error.with_traceback(tb),
                None => error,
            }
        }
        TaskFailure::Panicked { message } => RemoteError::new("task_panicked", message),
        other => RemoteError::new("task_failed", other.to_string()),
    }
}

impl From<ServerError> for RemoteError {
    fn from(e: ServerError) -> Self {
        e.to_remote()
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_passes_through() {
        let remote = RemoteError::new("bad_args", "missing mac");
        let e = ServerError::Rpc(RpcError::Remote(remote.clone()));
        assert_eq!(e.to_remote(), remote);
    }

    #[test]
    fn test_task_failure_keeps_traceback() {
        let e = ServerError::Task(TaskFailure::failed_with("pull failed", "at step 3"));
        let remote = e.to_remote();
        assert!(remote.is("task_failed"));
        assert_eq!(remote.traceback.as_deref(), Some("at step 3"));
    }

    #[test]
    fn test_other_errors_are_internal() {
        let e = ServerError::Lock {
            path: PathBuf::from("/run/nodefleet/images.lock"),
            reason: "permission denied".to_string(),
        };
        let remote: RemoteError = e.into();
        assert!(remote.is("internal"));
        assert!(remote.message.contains("permission denied"));
    }
}
