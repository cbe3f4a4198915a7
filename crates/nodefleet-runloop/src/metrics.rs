//! Event loop metrics collection.

use std::cell::Cell;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Event loop metrics.
///
/// The loop is single-threaded, so plain cells are enough.
#[derive(Debug, Default)]
pub struct LoopMetrics {
    iterations: Cell<u64>,
    events_dispatched: Cell<u64>,
    timers_fired: Cell<u64>,
    wakeups: Cell<u64>,
    wait_time_us: Cell<u64>,
    process_time_us: Cell<u64>,
    start_time: Cell<Option<Instant>>,
}

fn bump(cell: &Cell<u64>, by: u64) {
    cell.set(cell.get().saturating_add(by));
}

impl LoopMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the first run of the loop.
    pub fn mark_start(&self) {
        if self.start_time.get().is_none() {
            self.start_time.set(Some(Instant::now()));
        }
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .get()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Record a poll/dispatch pass.
    pub fn record_iteration(&self) {
        bump(&self.iterations, 1);
    }

    /// Record a source callback.
    pub fn record_dispatch(&self) {
        bump(&self.events_dispatched, 1);
    }

    /// Record a timed event firing.
    pub fn record_timer(&self) {
        bump(&self.timers_fired, 1);
    }

    /// Record time spent blocked in poll.
    pub fn record_wait(&self, duration_us: u64, woke_on_io: bool) {
        bump(&self.wait_time_us, duration_us);
        if woke_on_io {
            bump(&self.wakeups, 1);
        }
    }

    /// Record time spent running callbacks.
    pub fn record_process_time(&self, duration_us: u64) {
        bump(&self.process_time_us, duration_us);
    }

    /// Get a snapshot of the metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            uptime_secs: self.uptime_secs(),
            iterations: self.iterations.get(),
            events_dispatched: self.events_dispatched.get(),
            timers_fired: self.timers_fired.get(),
            wakeups: self.wakeups.get(),
            wait_time_us: self.wait_time_us.get(),
            process_time_us: self.process_time_us.get(),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub iterations: u64,
    pub events_dispatched: u64,
    pub timers_fired: u64,
    pub wakeups: u64,
    pub wait_time_us: u64,
    pub process_time_us: u64,
}

impl MetricsSnapshot {
    /// Calculate average wait per wakeup in milliseconds.
    pub fn avg_wait_time_ms(&self) -> f64 {
        if self.wakeups == 0 {
            return 0.0;
        }
        (self.wait_time_us as f64 / self.wakeups as f64) / 1000.0
    }

    /// Calculate average callback time per pass in milliseconds.
    pub fn avg_process_time_ms(&self) -> f64 {
        if self.iterations == 0 {
            return 0.0;
        }
        (self.process_time_us as f64 / self.iterations as f64) / 1000.0
    }
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
