use super::*;

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;

struct Job(&'static str, u64);

impl BlockingTask for Job {
    type Output = String;

    fn label(&self) -> String {
        self.0.to_string()
    }
}

/// Sleeps for the requested milliseconds and echoes the label.
#[derive(Default)]
struct Sleeper {
    seen: Arc<Mutex<Vec<&'static str>>>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl BlockingHandler<Job> for Sleeper {
    async fn handle(&self, req: Job) -> Result<String, TaskFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(req.1));
        self.seen.lock().push(req.0);
        match req.0 {
            "panic" => panic!("worker task panicked"),
            "fail" => Err(TaskFailure::failed_with("failed", "exit status 1")),
            label => Ok(label.to_string()),
        }
    }
}

fn collect(
    promise: Promise<TaskResult<String>>,
) -> Rc<RefCell<Option<TaskResult<String>>>> {
    let slot = Rc::new(RefCell::new(None));
    let inner = slot.clone();
    promise.then(move |result| *inner.borrow_mut() = Some(result));
    slot
}

fn wait_for(ev: &EventLoop, slot: &Rc<RefCell<Option<TaskResult<String>>>>) -> TaskResult<String> {
    let check = slot.clone();
    ev.run_until(move || check.borrow().is_some()).unwrap();
    slot.borrow_mut().take().unwrap()
}

#[test]
fn test_submit_resolves_on_loop() {
    let ev = EventLoop::new("offload");
    let offload = Offload::spawn(&ev, "blocking", Sleeper::default()).unwrap();

    let (id, promise) = offload.submit(Job("pull", 10));
    assert_eq!(id, TaskId(1));
    assert_eq!(offload.outstanding(), 1);

    let result = wait_for(&ev, &collect(promise));
    assert_eq!(result.unwrap(), "pull");
    assert_eq!(offload.outstanding(), 0);
    assert_eq!(offload.stats().completed, 1);

    offload.shutdown().unwrap();
    ev.shutdown();
}

#[test]
fn test_tasks_run_in_submission_order() {
    let ev = EventLoop::new("offload");
    let handler = Sleeper::default();
    let seen = handler.seen.clone();
    let offload = Offload::spawn(&ev, "blocking", handler).unwrap();

    let resolved = Rc::new(RefCell::new(Vec::new()));
    for (label, ms) in [("a", 30), ("b", 1), ("c", 10)] {
        let resolved = resolved.clone();
        offload
            .submit(Job(label, ms))
            .1
            .then(move |r| resolved.borrow_mut().push(r.unwrap()));
    }

    let check = resolved.clone();
    ev.run_until(move || check.borrow().len() == 3).unwrap();
    assert_eq!(*resolved.borrow(), vec!["a", "b", "c"]);
    assert_eq!(*seen.lock(), vec!["a", "b", "c"]);

    offload.shutdown().unwrap();
    ev.shutdown();
}

#[test]
fn test_panic_is_reported_and_worker_survives() {
    let ev = EventLoop::new("offload");
    let offload = Offload::spawn(&ev, "blocking", Sleeper::default()).unwrap();

    let first = collect(offload.submit(Job("panic", 0)).1);
    let second = collect(offload.submit(Job("after", 0)).1);

    match wait_for(&ev, &first) {
        Err(TaskFailure::Panicked { message }) => assert!(message.contains("panicked")),
        other => panic!("expected a panic, got {:?}", other),
    }
    assert_eq!(wait_for(&ev, &second).unwrap(), "after");

    let stats = offload.stats();
    assert_eq!(stats.panicked, 1);
    assert_eq!(stats.completed, 1);

    offload.shutdown().unwrap();
    ev.shutdown();
}

#[test]
fn test_handler_failure_carries_context() {
    let ev = EventLoop::new("offload");
    let offload = Offload::spawn(&ev, "blocking", Sleeper::default()).unwrap();

    let result = wait_for(&ev, &collect(offload.submit(Job("fail", 0)).1));
    assert_eq!(result, Err(TaskFailure::failed_with("failed", "exit status 1")));

    offload.shutdown().unwrap();
    ev.shutdown();
}

#[test]
fn test_submit_with_timeout_discards_late_result() {
    let ev = EventLoop::new("offload");
    let offload = Offload::spawn(&ev, "blocking", Sleeper::default()).unwrap();

    let started = Instant::now();
    let slow = collect(offload.submit_with_timeout(Job("slow", 200), Duration::from_millis(30)).1);
    assert_eq!(wait_for(&ev, &slow), Err(TaskFailure::TimedOut { after_ms: 30 }));
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(offload.outstanding(), 0);

    // The worker finishes the slow task first; its result is dropped.
    let next = collect(offload.submit(Job("next", 0)).1);
    assert_eq!(wait_for(&ev, &next).unwrap(), "next");
    assert!(slow.borrow().is_none());

    offload.shutdown().unwrap();
    ev.shutdown();
}

#[test]
fn test_shutdown_drains_queue() {
    let ev = EventLoop::new("offload");
    let handler = Sleeper::default();
    let calls = handler.calls.clone();
    let offload = Offload::spawn(&ev, "blocking", handler).unwrap();

    let a = collect(offload.submit(Job("a", 20)).1);
    let b = collect(offload.submit(Job("b", 0)).1);
    offload.shutdown().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(a.borrow_mut().take().unwrap().unwrap(), "a");
    assert_eq!(b.borrow_mut().take().unwrap().unwrap(), "b");
    assert!(!offload.is_running());
    ev.shutdown();
}

#[test]
fn test_submit_after_shutdown_fails() {
    let ev = EventLoop::new("offload");
    let offload = Offload::spawn(&ev, "blocking", Sleeper::default()).unwrap();
    offload.shutdown().unwrap();
    offload.shutdown().unwrap();

    let (_, promise) = offload.submit(Job("late", 0));
    assert_eq!(promise.take(), Some(Err(TaskFailure::WorkerGone)));
    ev.shutdown();
}

#[test]
fn test_outstanding_tasks_listing() {
    let ev = EventLoop::new("offload");
    let offload = Offload::spawn(&ev, "blocking", Sleeper::default()).unwrap();

    let first = collect(offload.submit(Job("one", 50)).1);
    let _second = offload.submit(Job("two", 0));
    let tasks = offload.outstanding_tasks();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].label, "one");
    assert_eq!(tasks[1].id, TaskId(2));

    wait_for(&ev, &first).unwrap();
    offload.shutdown().unwrap();
    ev.shutdown();
}
