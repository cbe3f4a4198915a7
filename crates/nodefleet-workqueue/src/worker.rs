//! The worker thread.
//!
//! The worker owns a current-thread `tokio` runtime and executes one task at
//! a time. Results are parked in a shared map and the task ID is posted to
//! the owning loop through its completion pipe.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nodefleet_runloop::WakeupSender;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{TaskFailure, TaskResult};
use crate::task::{BlockingHandler, BlockingTask, TaskId};

/// Results waiting to be collected by the loop.
pub(crate) type ResultSlots<T> = Arc<Mutex<HashMap<TaskId, TaskResult<T>>>>;

/// A task travelling to the worker.
pub(crate) struct Job<Req> {
    pub(crate) id: TaskId,
    pub(crate) req: Req,
}

/// Counters shared between the worker thread and its owner.
#[derive(Debug, Default)]
pub struct Worker {
    running: AtomicBool,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_panicked: AtomicU64,
}

impl Worker {
    /// Check if the worker is executing a task right now.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get completed task count.
    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed.load(Ordering::SeqCst)
    }

    /// Get failed task count, panics included.
    pub fn tasks_failed(&self) -> u64 {
        self.tasks_failed.load(Ordering::SeqCst)
    }

    /// Get panicked task count.
    pub fn tasks_panicked(&self) -> u64 {
        self.tasks_panicked.load(Ordering::SeqCst)
    }

    fn record<T>(&self, result: &TaskResult<T>) {
        match result {
            Ok(_) => {
                self.tasks_completed.fetch_add(1, Ordering::SeqCst);
            }
            Err(failure) => {
                self.tasks_failed.fetch_add(1, Ordering::SeqCst);
                if matches!(failure, TaskFailure::Panicked { .. }) {
                    self.tasks_panicked.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }
}

/// Point-in-time offload statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    pub outstanding: usize,
    pub running: bool,
}

impl WorkerStats {
    pub(crate) fn from_worker(worker: &Worker, outstanding: usize) -> Self {
        Self {
            completed: worker.tasks_completed(),
            failed: worker.tasks_failed(),
            panicked: worker.tasks_panicked(),
            outstanding,
            running: worker.is_running(),
        }
    }
}

fn build_runtime() -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Worker thread body. Returns when the job channel closes or the loop
/// side has gone away.
pub(crate) fn run<Req, H>(
    config: QueueConfig,
    handler: H,
    mut jobs: UnboundedReceiver<Job<Req>>,
    slots: ResultSlots<Req::Output>,
    done: WakeupSender,
    worker: Arc<Worker>,
) where
    Req: BlockingTask,
    H: BlockingHandler<Req>,
{
    let name = config.worker_name.clone();
    let mut runtime = match build_runtime() {
        Ok(rt) => Some(rt),
        Err(e) => {
            error!("{}: failed to build worker runtime: {}", name, e);
            None
        }
    };
    info!("{}: worker started", name);

    while let Some(job) = jobs.blocking_recv() {
        let label = job.req.label();
        debug!("{}: executing {} ({})", name, job.id, label);
        let started = Instant::now();
        worker.running.store(true, Ordering::SeqCst);

        let result = match runtime.as_ref() {
            Some(rt) => execute(rt, &handler, job.req, &config),
            None => Err(TaskFailure::failed("worker runtime unavailable")),
        };
        worker.running.store(false, Ordering::SeqCst);
        worker.record(&result);

        let elapsed = started.elapsed();
        match &result {
            Ok(_) => debug!("{}: {} done in {:?}", name, job.id, elapsed),
            Err(TaskFailure::Panicked { message }) => {
                error!("{}: {} ({}) panicked: {}", name, job.id, label, message);
                // The runtime may have been left mid-poll; start from a clean one.
                runtime = build_runtime().ok();
            }
            Err(failure) => warn!("{}: {} ({}) failed: {}", name, job.id, label, failure),
        }
        if elapsed > config.slow_task() {
            warn!("{}: {} ({}) took {:?}", name, job.id, label, elapsed);
        }

        slots.lock().insert(job.id, result);
        if let Err(e) = done.notify(job.id.0) {
            warn!("{}: owner gone, stopping worker: {}", name, e);
            break;
        }
    }

    info!(
        "{}: worker stopped ({} completed, {} failed)",
        name,
        worker.tasks_completed(),
        worker.tasks_failed()
    );
}

fn execute<Req, H>(rt: &Runtime, handler: &H, req: Req, config: &QueueConfig) -> TaskResult<Req::Output>
where
    Req: BlockingTask,
    H: BlockingHandler<Req>,
{
    let limit = config.task_timeout();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        rt.block_on(async {
            match limit {
                Some(limit) => match tokio::time::timeout(limit, handler.handle(req)).await {
                    Ok(result) => result,
                    Err(_) => Err(TaskFailure::TimedOut {
                        after_ms: limit.as_millis() as u64,
                    }),
                },
                None => handler.handle(req).await,
            }
        })
    }));
    match outcome {
        Ok(result) => result,
        Err(panic) => Err(TaskFailure::Panicked {
            message: panic_message(panic.as_ref()),
        }),
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
