//! Offload configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Offload worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Worker thread name.
    #[serde(default = "default_worker_name")]
    pub worker_name: String,

    /// Worker-side limit on a single task in seconds (0 = none).
    #[serde(default)]
    pub task_timeout_secs: u64,

    /// Log a warning when a task takes longer than this many seconds.
    #[serde(default = "default_slow_task_secs")]
    pub slow_task_secs: u64,
}

fn default_worker_name() -> String {
    "blocking".to_string()
}

fn default_slow_task_secs() -> u64 {
    30
}

impl QueueConfig {
    /// Create a configuration with the given worker name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            worker_name: name.into(),
            ..Default::default()
        }
    }

    /// Worker-side task limit, if any.
    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }

    /// Threshold for slow-task warnings.
    pub fn slow_task(&self) -> Duration {
        Duration::from_secs(self.slow_task_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_name: default_worker_name(),
            task_timeout_secs: 0,
            slow_task_secs: default_slow_task_secs(),
        }
    }
}
