//! Timed events merged into the loop's poll cycle.
//!
//! Timed events live in a min-heap ordered by due time. Events due at the
//! same instant fire in planning order. A repeating event is re-enqueued
//! right after it fires with `due += interval`, so a late loop catches up
//! instead of drifting.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::run_loop::EventLoop;

/// Callback invoked when a timed event fires.
pub type TimerCallback = Box<dyn FnMut(&EventLoop)>;

struct TimerState {
    id: u64,
    valid: Cell<bool>,
    fire_count: Cell<u64>,
    repeat: Option<Duration>,
}

/// Handle to a planned timed event.
///
/// Dropping the handle does not cancel the event.
#[derive(Clone)]
pub struct TimerHandle {
    state: Rc<TimerState>,
}

impl TimerHandle {
    /// Get the timer ID.
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Check if the timer is still pending (not fired one-shot, not cancelled).
    pub fn is_valid(&self) -> bool {
        self.state.valid.get()
    }

    /// Check if the timer repeats.
    pub fn is_repeating(&self) -> bool {
        self.state.repeat.is_some()
    }

    /// Number of times the callback ran.
    pub fn fire_count(&self) -> u64 {
        self.state.fire_count.get()
    }

    /// Cancel the timer. A cancelled timer never fires again.
    pub fn cancel(&self) {
        if self.state.valid.replace(false) {
            debug!("Timer {} cancelled", self.state.id);
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.state.id)
            .field("valid", &self.state.valid.get())
            .field("fire_count", &self.state.fire_count.get())
            .finish()
    }
}

/// A timed event: due time, callback and optional repeat interval.
pub(crate) struct TimedEvent {
    due: Instant,
    seq: u64,
    callback: TimerCallback,
    state: Rc<TimerState>,
}

impl TimedEvent {
    pub(crate) fn is_valid(&self) -> bool {
        self.state.valid.get()
    }

    /// Run the callback, then report whether the event must be re-enqueued.
    pub(crate) fn fire(&mut self, ev: &EventLoop) -> bool {
        self.state.fire_count.set(self.state.fire_count.get() + 1);
        if self.state.repeat.is_none() {
            self.state.valid.set(false);
        }
        (self.callback)(ev);
        self.state.repeat.is_some() && self.state.valid.get()
    }
}

impl PartialEq for TimedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimedEvent {}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEvent {
    // Reversed: BinaryHeap is a max-heap, the earliest event must be on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue of timed events.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimedEvent>,
    next_seq: u64,
    next_id: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Plan a new event.
    pub(crate) fn plan(
        &mut self,
        due: Instant,
        callback: TimerCallback,
        repeat: Option<Duration>,
    ) -> TimerHandle {
        self.next_id += 1;
        let state = Rc::new(TimerState {
            id: self.next_id,
            valid: Cell::new(true),
            fire_count: Cell::new(0),
            repeat,
        });
        let handle = TimerHandle {
            state: state.clone(),
        };
        self.push(TimedEvent {
            due,
            seq: 0,
            callback,
            state,
        });
        handle
    }

    fn push(&mut self, mut event: TimedEvent) {
        self.next_seq += 1;
        event.seq = self.next_seq;
        self.heap.push(event);
    }

    /// Put a fired repeating event back with its next due time.
    pub(crate) fn reschedule(&mut self, mut event: TimedEvent) {
        if let Some(interval) = event.state.repeat {
            event.due += interval;
            self.push(event);
        }
    }

    /// Drop cancelled events sitting on the heap.
    fn purge(&mut self) {
        if self.heap.iter().any(|e| !e.is_valid()) {
            self.heap.retain(|e| e.is_valid());
        }
    }

    /// Due time of the earliest pending event.
    pub(crate) fn next_due(&mut self) -> Option<Instant> {
        self.purge();
        self.heap.peek().map(|e| e.due)
    }

    /// Remove every event due at or before `now`, oldest first.
    pub(crate) fn drain_due(&mut self, now: Instant) -> Vec<TimedEvent> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|e| e.due <= now) {
            if let Some(event) = self.heap.pop() {
                if event.is_valid() {
                    due.push(event);
                }
            }
        }
        due
    }

    /// Cancel and drop every event. Returns how many were pending.
    pub(crate) fn clear(&mut self) -> usize {
        let count = self.heap.iter().filter(|e| e.is_valid()).count();
        for event in self.heap.drain() {
            event.state.valid.set(false);
        }
        count
    }

    /// Number of pending (valid) events.
    pub(crate) fn len(&mut self) -> usize {
        self.purge();
        self.heap.len()
    }
}

#[cfg(test)]
#[path = "timer_tests.rs"]
mod tests;
