use super::*;

fn noop() -> TimerCallback {
    Box::new(|_| {})
}

#[test]
fn test_queue_orders_by_due_time() {
    let mut queue = TimerQueue::new();
    let now = Instant::now();

    let late = queue.plan(now + Duration::from_millis(30), noop(), None);
    let early = queue.plan(now + Duration::from_millis(10), noop(), None);

    assert_eq!(queue.next_due(), Some(now + Duration::from_millis(10)));

    let due = queue.drain_due(now + Duration::from_millis(40));
    let ids: Vec<u64> = due.iter().map(|e| e.state.id).collect();
    assert_eq!(ids, vec![early.id(), late.id()]);
}

#[test]
fn test_same_due_time_keeps_planning_order() {
    let mut queue = TimerQueue::new();
    let due_at = Instant::now();

    let first = queue.plan(due_at, noop(), None);
    let second = queue.plan(due_at, noop(), None);
    let third = queue.plan(due_at, noop(), None);

    let ids: Vec<u64> = queue.drain_due(due_at).iter().map(|e| e.state.id).collect();
    assert_eq!(ids, vec![first.id(), second.id(), third.id()]);
}

#[test]
fn test_cancelled_events_are_skipped() {
    let mut queue = TimerQueue::new();
    let now = Instant::now();

    let handle = queue.plan(now, noop(), None);
    assert_eq!(queue.len(), 1);

    handle.cancel();
    assert!(!handle.is_valid());
    assert_eq!(queue.len(), 0);
    assert!(queue.next_due().is_none());
    assert!(queue.drain_due(now).is_empty());
}

#[test]
fn test_not_yet_due_stays_queued() {
    let mut queue = TimerQueue::new();
    let now = Instant::now();

    queue.plan(now + Duration::from_secs(60), noop(), None);

    assert!(queue.drain_due(now).is_empty());
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_reschedule_adds_interval_to_previous_due() {
    let mut queue = TimerQueue::new();
    let start = Instant::now();
    let interval = Duration::from_millis(50);

    let handle = queue.plan(start, noop(), Some(interval));
    assert!(handle.is_repeating());

    let mut due = queue.drain_due(start + Duration::from_millis(120));
    assert_eq!(due.len(), 1);
    queue.reschedule(due.remove(0));

    // Catch-up: next due time derives from the previous one, not from "now".
    assert_eq!(queue.next_due(), Some(start + interval));
}
