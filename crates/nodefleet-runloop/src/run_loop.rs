//! Event loop core implementation.
//!
//! The loop owns a set of pollable sources and a queue of timed events. Each
//! pass polls every source with a timeout bounded by the earliest timed
//! event, dispatches one event to each ready source, then fires the timed
//! events that came due.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::metrics::LoopMetrics;
use crate::source::{EventSource, SourceId};
use crate::timer::{TimerHandle, TimerQueue};

/// A source shared between the loop and its owner.
pub type SharedSource = Rc<RefCell<dyn EventSource>>;

/// Registered source bookkeeping.
pub(crate) struct SourceEntry {
    pub(crate) name: String,
    pub(crate) source: SharedSource,
}

pub(crate) struct LoopInner {
    pub(crate) name: String,
    pub(crate) sources: RefCell<BTreeMap<SourceId, SourceEntry>>,
    pub(crate) timers: RefCell<TimerQueue>,
    /// Sources removed while their own callback was running.
    pub(crate) closing: RefCell<Vec<SharedSource>>,
    pub(crate) next_source_id: Cell<u64>,
    pub(crate) dispatching: Cell<bool>,
    pub(crate) stop_requested: Cell<bool>,
    pub(crate) metrics: LoopMetrics,
}

/// Outcome of [`EventLoop::run_until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The predicate became true.
    Satisfied,
    /// No sources and no timed events remain.
    Exhausted,
    /// [`EventLoop::stop`] was called.
    Stopped,
}

/// Single-threaded event loop handle.
///
/// Cloning is cheap; every clone drives the same loop. The handle is not
/// `Send`: each process (or worker context) owns its own loop.
#[derive(Clone)]
pub struct EventLoop {
    pub(crate) inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Create a new event loop.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(LoopInner {
                name: name.into(),
                sources: RefCell::new(BTreeMap::new()),
                timers: RefCell::new(TimerQueue::new()),
                closing: RefCell::new(Vec::new()),
                next_source_id: Cell::new(0),
                dispatching: Cell::new(false),
                stop_requested: Cell::new(false),
                metrics: LoopMetrics::new(),
            }),
        }
    }

    /// Get the loop name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get metrics.
    pub fn metrics(&self) -> &LoopMetrics {
        &self.inner.metrics
    }

    /// Check if a callback is executing right now.
    pub fn is_dispatching(&self) -> bool {
        self.inner.dispatching.get()
    }

    // ========================================================================
    // Source Management
    // ========================================================================

    /// Register a source. It is polled from the next pass on.
    pub fn register<S>(&self, source: S) -> SourceId
    where
        S: EventSource + 'static,
    {
        let shared: SharedSource = Rc::new(RefCell::new(source));
        self.register_shared(shared)
    }

    /// Register a source that the caller keeps a handle to.
    pub fn register_shared(&self, source: SharedSource) -> SourceId {
        let next = self.inner.next_source_id.get() + 1;
        self.inner.next_source_id.set(next);
        let id = SourceId(next);

        let name = source.borrow().name().to_string();
        debug!("{}: registered source {} ({})", self.inner.name, name, id);
        self.inner
            .sources
            .borrow_mut()
            .insert(id, SourceEntry { name, source });
        id
    }

    /// Unregister a source and close it.
    ///
    /// Returns `false` if the source was not registered. A source removing
    /// itself from inside its callback is closed once the callback returns.
    pub fn remove(&self, id: SourceId) -> bool {
        let entry = self.inner.sources.borrow_mut().remove(&id);
        let Some(entry) = entry else {
            return false;
        };

        debug!("{}: removing source {} ({})", self.inner.name, entry.name, id);
        match entry.source.try_borrow_mut() {
            Ok(mut source) => source.close(),
            Err(_) => self.inner.closing.borrow_mut().push(entry.source.clone()),
        }
        true
    }

    /// Check if a source is registered.
    pub fn contains(&self, id: SourceId) -> bool {
        self.inner.sources.borrow().contains_key(&id)
    }

    /// Number of registered sources.
    pub fn source_count(&self) -> usize {
        self.inner.sources.borrow().len()
    }

    // ========================================================================
    // Timed Events
    // ========================================================================

    /// Plan a callback at `due`, optionally repeating every `repeat`.
    pub fn plan_event<F>(&self, due: Instant, callback: F, repeat: Option<Duration>) -> TimerHandle
    where
        F: FnMut(&EventLoop) + 'static,
    {
        self.inner
            .timers
            .borrow_mut()
            .plan(due, Box::new(callback), repeat)
    }

    /// Plan a one-shot callback after `delay`.
    pub fn plan_after<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnMut(&EventLoop) + 'static,
    {
        self.plan_event(Instant::now() + delay, callback, None)
    }

    /// Plan a callback every `interval`, first firing one interval from now.
    pub fn plan_repeating<F>(&self, interval: Duration, callback: F) -> TimerHandle
    where
        F: FnMut(&EventLoop) + 'static,
    {
        self.plan_event(Instant::now() + interval, callback, Some(interval))
    }

    /// Number of pending timed events.
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow_mut().len()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Ask the running loop to return at the end of the current pass.
    pub fn stop(&self) {
        info!("{}: stop requested", self.inner.name);
        self.inner.stop_requested.set(true);
    }

    /// Check if nothing can ever wake the loop again.
    pub fn is_idle(&self) -> bool {
        self.inner.sources.borrow().is_empty() && self.pending_timers() == 0
    }

    /// Remove and close every source and drop every timed event.
    ///
    /// Breaks reference cycles between sources and the loop handles they hold.
    pub fn shutdown(&self) {
        let ids: Vec<SourceId> = self.inner.sources.borrow().keys().copied().collect();
        for id in ids {
            self.remove(id);
        }
        let dropped = self.inner.timers.borrow_mut().clear();
        if dropped > 0 {
            debug!("{}: dropped {} timed events on shutdown", self.inner.name, dropped);
        }
    }
}

#[cfg(test)]
#[path = "run_loop_tests.rs"]
mod tests;
