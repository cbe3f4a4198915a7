//! End-to-end tests for the event loop: timers, sources, promises and
//! cross-thread wakeups driven together.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nodefleet_runloop::{
    wakeup_pipe, EventLoop, EventSource, Promise, RunLoopResult, RunOutcome, SourceStatus,
};

// ============================================================================
// Test Helpers
// ============================================================================

/// Source that counts bytes, one per event.
struct Counter {
    stream: UnixStream,
    count: Rc<Cell<usize>>,
}

impl EventSource for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn on_ready(&mut self, _ev: &EventLoop) -> RunLoopResult<SourceStatus> {
        use std::io::Read;
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte)? {
            0 => Ok(SourceStatus::Remove),
            _ => {
                self.count.set(self.count.get() + 1);
                Ok(SourceStatus::Keep)
            }
        }
    }
}

// ============================================================================
// Timers
// ============================================================================

#[test]
fn test_repeating_timer_fires_about_ten_times_in_half_a_second() {
    let ev = EventLoop::new("timer-test");
    let fires = Rc::new(Cell::new(0u32));
    let fires_in = fires.clone();
    let timer = ev.plan_repeating(Duration::from_millis(50), move |_| {
        fires_in.set(fires_in.get() + 1);
    });

    ev.plan_after(Duration::from_millis(500), move |ev| {
        timer.cancel();
        ev.stop();
    });

    assert_eq!(ev.run_until(|| false).unwrap(), RunOutcome::Stopped);
    let fired = fires.get();
    assert!((9..=11).contains(&fired), "fired {fired} times");
}

#[test]
fn test_timer_wait_bounds_poll() {
    let ev = EventLoop::new("timer-test");
    let (_tx, rx) = UnixStream::pair().unwrap();
    rx.set_nonblocking(true).unwrap();
    ev.register(Counter {
        stream: rx,
        count: Rc::new(Cell::new(0)),
    });

    let fired_at = Rc::new(Cell::new(None));
    let fired_in = fired_at.clone();
    let start = Instant::now();
    ev.plan_after(Duration::from_millis(20), move |_| fired_in.set(Some(Instant::now())));

    let fired_check = fired_at.clone();
    ev.run_until(move || fired_check.get().is_some()).unwrap();
    let elapsed = fired_at.get().unwrap() - start;
    assert!(elapsed >= Duration::from_millis(20));
    assert!(elapsed < Duration::from_secs(2));
}

// ============================================================================
// Sources and timers together
// ============================================================================

#[test]
fn test_busy_source_does_not_starve_timers() {
    let ev = EventLoop::new("mixed");
    let (mut tx, rx) = UnixStream::pair().unwrap();
    rx.set_nonblocking(true).unwrap();
    let count = Rc::new(Cell::new(0));
    ev.register(Counter {
        stream: rx,
        count: count.clone(),
    });
    tx.write_all(&[0u8; 64]).unwrap();

    let timer_fired = Rc::new(Cell::new(false));
    let timer_in = timer_fired.clone();
    ev.plan_after(Duration::ZERO, move |_| timer_in.set(true));

    ev.run_once().unwrap();
    assert!(timer_fired.get());
    assert_eq!(count.get(), 1);

    let count_check = count.clone();
    ev.run_until(move || count_check.get() == 64).unwrap();
    drop(tx);
    assert_eq!(ev.run_until(|| false).unwrap(), RunOutcome::Exhausted);
}

// ============================================================================
// Promises and wakeups
// ============================================================================

#[test]
fn test_promise_resolved_from_worker_thread() {
    let ev = EventLoop::new("promise");
    let (resolver, promise) = Promise::<u64>::pending("square");
    let (sender, source) = wakeup_pipe("results", move |_, token| {
        resolver.resolve(token);
        Ok(())
    })
    .unwrap();
    ev.register(source);

    let worker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        sender.notify(12 * 12).unwrap();
    });

    let seen = Rc::new(RefCell::new(None));
    let seen_in = seen.clone();
    promise.then(move |v| *seen_in.borrow_mut() = Some(v));

    let seen_check = seen.clone();
    let outcome = ev.run_until(move || seen_check.borrow().is_some()).unwrap();
    worker.join().unwrap();

    assert_eq!(outcome, RunOutcome::Satisfied);
    assert_eq!(*seen.borrow(), Some(144));
}

#[test]
fn test_metrics_track_passes() {
    let ev = EventLoop::new("metrics");
    ev.plan_after(Duration::from_millis(1), |_| {});
    ev.plan_after(Duration::from_millis(2), |_| {});
    ev.run().unwrap();

    let snapshot = ev.metrics().snapshot();
    assert!(snapshot.iterations >= 1);
    assert_eq!(snapshot.timers_fired, 2);
    assert_eq!(snapshot.events_dispatched, 0);
}
