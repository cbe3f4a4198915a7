//! Loop-side submitter.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nodefleet_runloop::{wakeup_pipe, EventLoop, Promise, Resolver, SourceId, TimerHandle};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult, TaskFailure, TaskResult};
use crate::task::{BlockingHandler, BlockingTask, TaskId, TaskInfo};
use crate::worker::{self, Job, ResultSlots, Worker, WorkerStats};

struct Outstanding<T> {
    label: String,
    submitted_at: DateTime<Utc>,
    resolver: Resolver<TaskResult<T>>,
    deadline: Option<TimerHandle>,
}

struct OffloadInner<Req: BlockingTask> {
    name: String,
    ev: EventLoop,
    jobs: RefCell<Option<UnboundedSender<Job<Req>>>>,
    outstanding: RefCell<HashMap<TaskId, Outstanding<Req::Output>>>,
    slots: ResultSlots<Req::Output>,
    next_id: Cell<u64>,
    worker: Arc<Worker>,
    thread: RefCell<Option<JoinHandle<()>>>,
    source: Cell<Option<SourceId>>,
}

impl<Req: BlockingTask> OffloadInner<Req> {
    /// Collect the parked result for `id`. Each task resolves exactly once.
    fn complete(&self, id: TaskId) {
        let result = self.slots.lock().remove(&id);
        let Some(result) = result else {
            warn!("{}: completion for {} without a result", self.name, id);
            return;
        };
        let entry = self.outstanding.borrow_mut().remove(&id);
        match entry {
            Some(entry) => {
                if let Some(deadline) = &entry.deadline {
                    deadline.cancel();
                }
                debug!("{}: {} ({}) resolved", self.name, id, entry.label);
                entry.resolver.resolve(result);
            }
            None => debug!("{}: late result for {} dropped", self.name, id),
        }
    }

    fn expire(&self, id: TaskId, after: Duration) {
        let entry = self.outstanding.borrow_mut().remove(&id);
        if let Some(entry) = entry {
            warn!("{}: {} ({}) timed out after {:?}", self.name, id, entry.label, after);
            entry.resolver.resolve(Err(TaskFailure::TimedOut {
                after_ms: after.as_millis() as u64,
            }));
        }
    }
}

/// Runs blocking work on a dedicated thread and reports completions back
/// to the owning event loop as promises.
///
/// Tasks execute one at a time in submission order. Clones share the worker.
pub struct Offload<Req: BlockingTask> {
    inner: Rc<OffloadInner<Req>>,
}

impl<Req: BlockingTask> Clone for Offload<Req> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Req: BlockingTask> Offload<Req> {
    /// Start a worker with default settings.
    pub fn spawn<H>(ev: &EventLoop, name: impl Into<String>, handler: H) -> QueueResult<Self>
    where
        H: BlockingHandler<Req>,
    {
        Self::spawn_with_config(ev, QueueConfig::named(name), handler)
    }

    /// Start the worker thread and register its completion pipe with `ev`.
    pub fn spawn_with_config<H>(ev: &EventLoop, config: QueueConfig, handler: H) -> QueueResult<Self>
    where
        H: BlockingHandler<Req>,
    {
        let name = config.worker_name.clone();
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let slots: ResultSlots<Req::Output> = Arc::new(Mutex::new(HashMap::new()));
        let worker = Arc::new(Worker::default());

        let inner = Rc::new(OffloadInner {
            name: name.clone(),
            ev: ev.clone(),
            jobs: RefCell::new(Some(job_tx)),
            outstanding: RefCell::new(HashMap::new()),
            slots: slots.clone(),
            next_id: Cell::new(1),
            worker: worker.clone(),
            thread: RefCell::new(None),
            source: Cell::new(None),
        });

        let weak: Weak<OffloadInner<Req>> = Rc::downgrade(&inner);
        let (done_tx, done_rx) = wakeup_pipe(format!("{}-done", name), move |_ev, token| {
            if let Some(inner) = weak.upgrade() {
                inner.complete(TaskId(token));
            }
            Ok(())
        })?;
        inner.source.set(Some(ev.register(done_rx)));

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker::run(config, handler, job_rx, slots, done_tx, worker));
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                if let Some(id) = inner.source.take() {
                    ev.remove(id);
                }
                return Err(QueueError::Spawn(e));
            }
        };
        *inner.thread.borrow_mut() = Some(thread);
        info!("{}: offload worker spawned", name);

        Ok(Self { inner })
    }

    /// Get the worker name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Check if the worker still accepts tasks.
    pub fn is_running(&self) -> bool {
        self.inner.jobs.borrow().is_some()
    }

    /// Queue a task. The promise resolves on the loop thread once the
    /// worker finishes it.
    pub fn submit(&self, req: Req) -> (TaskId, Promise<TaskResult<Req::Output>>) {
        self.submit_inner(req, None)
    }

    /// Queue a task that fails with [`TaskFailure::TimedOut`] unless it
    /// completes within `timeout`. The worker still runs it; the late
    /// result is discarded.
    pub fn submit_with_timeout(
        &self,
        req: Req,
        timeout: Duration,
    ) -> (TaskId, Promise<TaskResult<Req::Output>>) {
        self.submit_inner(req, Some(timeout))
    }

    fn submit_inner(
        &self,
        req: Req,
        timeout: Option<Duration>,
    ) -> (TaskId, Promise<TaskResult<Req::Output>>) {
        let inner = &self.inner;
        let id = TaskId(inner.next_id.get());
        inner.next_id.set(id.0 + 1);
        let label = req.label();
        let (resolver, promise) = Promise::pending(format!("{}:{}", inner.name, id));

        let sent = match inner.jobs.borrow().as_ref() {
            Some(jobs) => jobs.send(Job { id, req }).is_ok(),
            None => false,
        };
        if !sent {
            warn!("{}: {} ({}) rejected, worker is gone", inner.name, id, label);
            resolver.resolve(Err(TaskFailure::WorkerGone));
            return (id, promise);
        }

        let deadline = timeout.map(|after| {
            let weak = Rc::downgrade(inner);
            inner.ev.plan_after(after, move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.expire(id, after);
                }
            })
        });
        debug!("{}: queued {} ({})", inner.name, id, label);
        inner.outstanding.borrow_mut().insert(
            id,
            Outstanding {
                label,
                submitted_at: Utc::now(),
                resolver,
                deadline,
            },
        );
        (id, promise)
    }

    /// Number of tasks not yet resolved.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.borrow().len()
    }

    /// Outstanding tasks, oldest first.
    pub fn outstanding_tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self
            .inner
            .outstanding
            .borrow()
            .iter()
            .map(|(id, entry)| TaskInfo {
                id: *id,
                label: entry.label.clone(),
                submitted_at: entry.submitted_at,
            })
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Get worker statistics.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats::from_worker(&self.inner.worker, self.outstanding())
    }

    /// Stop accepting tasks, let the worker drain its queue and join it.
    ///
    /// Results the worker produced are delivered; anything still
    /// unresolved fails with [`TaskFailure::WorkerGone`]. Idempotent.
    pub fn shutdown(&self) -> QueueResult<()> {
        let inner = &self.inner;
        if inner.jobs.borrow_mut().take().is_none() {
            return Ok(());
        }
        info!("{}: shutting down offload ({} outstanding)", inner.name, self.outstanding());

        let joined = match inner.thread.borrow_mut().take() {
            Some(thread) => thread
                .join()
                .map_err(|_| QueueError::WorkerError(format!("{} thread panicked", inner.name))),
            None => Ok(()),
        };

        let mut parked: Vec<TaskId> = inner.slots.lock().keys().copied().collect();
        parked.sort();
        for id in parked {
            inner.complete(id);
        }

        let mut leftovers: Vec<_> = inner.outstanding.borrow_mut().drain().collect();
        leftovers.sort_by_key(|(id, _)| *id);
        for (id, entry) in leftovers {
            if let Some(deadline) = &entry.deadline {
                deadline.cancel();
            }
            debug!("{}: {} ({}) abandoned at shutdown", inner.name, id, entry.label);
            entry.resolver.resolve(Err(TaskFailure::WorkerGone));
        }

        if let Some(id) = inner.source.take() {
            inner.ev.remove(id);
        }
        joined
    }
}

impl<Req: BlockingTask> std::fmt::Debug for Offload<Req> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Offload")
            .field("name", &self.inner.name)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
#[path = "offload_tests.rs"]
mod tests;
