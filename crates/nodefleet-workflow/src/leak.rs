//! Detection of workflows dropped before finishing.

use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::workflow::WorkflowState;

/// Describes a workflow reclaimed while not done.
///
/// This is always a programming error: some continuation was dropped
/// without advancing the pipeline, so its remaining steps and end callbacks
/// will never run.
#[derive(Debug, Clone, Serialize)]
pub struct LeakReport {
    pub id: Uuid,
    pub name: String,
    pub state: WorkflowState,
    pub current_step: Option<String>,
    pub remaining_steps: Vec<String>,
    pub pending_end_callbacks: usize,
    pub created_at: DateTime<Utc>,
}

/// Receives leak reports.
pub type LeakHook = Rc<dyn Fn(&LeakReport)>;

/// Default leak hook: log the report at error level.
pub fn log_leak(report: &LeakReport) {
    error!(
        workflow = %report.id,
        state = ?report.state,
        current = ?report.current_step,
        remaining = ?report.remaining_steps,
        end_callbacks = report.pending_end_callbacks,
        "Workflow {} dropped before completion",
        report.name
    );
}
