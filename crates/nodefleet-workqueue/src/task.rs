//! Task identity and the handler contract.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskFailure;

/// Identifier of an offloaded task, unique per offload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A unit of blocking work.
pub trait BlockingTask: Send + 'static {
    /// What the task produces.
    type Output: Send + 'static;

    /// Short description used in logs.
    fn label(&self) -> String;
}

/// Executes blocking tasks on the worker thread.
///
/// Handlers may block freely, or await `tokio` I/O (processes, timers) on
/// the worker's own runtime.
#[async_trait]
pub trait BlockingHandler<Req: BlockingTask>: Send + Sync + 'static {
    /// Execute a task.
    async fn handle(&self, req: Req) -> Result<Req::Output, TaskFailure>;
}

/// Snapshot of a task queued on or running on the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub label: String,
    pub submitted_at: DateTime<Utc>,
}
