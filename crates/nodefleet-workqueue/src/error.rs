//! Offload errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use nodefleet_runloop::RunLoopError;

/// Why an offloaded task produced no output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum TaskFailure {
    /// The handler returned an error.
    #[error("Task failed: {message}")]
    Failed {
        message: String,
        #[serde(default)]
        traceback: Option<String>,
    },

    /// The handler panicked. The worker keeps serving.
    #[error("Task panicked: {message}")]
    Panicked { message: String },

    /// The task did not finish in time.
    #[error("Task timed out after {after_ms}ms")]
    TimedOut { after_ms: u64 },

    /// The worker is gone; the task will never complete.
    #[error("Worker is gone")]
    WorkerGone,
}

impl TaskFailure {
    /// Handler failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        TaskFailure::Failed {
            message: message.into(),
            traceback: None,
        }
    }

    /// Handler failure with captured context (e.g. command stderr).
    pub fn failed_with(message: impl Into<String>, traceback: impl Into<String>) -> Self {
        TaskFailure::Failed {
            message: message.into(),
            traceback: Some(traceback.into()),
        }
    }
}

/// Result of an offloaded task.
pub type TaskResult<T> = Result<T, TaskFailure>;

/// Errors starting or stopping an offload worker.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The worker thread could not be started.
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// The completion pipe could not be registered.
    #[error("Event loop error: {0}")]
    RunLoop(#[from] RunLoopError),

    /// The worker thread panicked outside a task.
    #[error("Worker error: {0}")]
    WorkerError(String),
}

/// Result type for offload management.
pub type QueueResult<T> = Result<T, QueueError>;
