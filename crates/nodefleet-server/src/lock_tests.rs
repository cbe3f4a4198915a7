use super::*;

use std::cell::Cell;
use tempfile::TempDir;

fn lock_in(dir: &TempDir, timeout: Duration) -> MountLock {
    MountLock::new(dir.path().join("locks").join("images.lock"), Duration::from_millis(10), timeout)
}

#[test]
fn test_try_acquire_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let lock = lock_in(&dir, Duration::from_secs(1));

    let guard = lock.try_acquire().unwrap().expect("free lock");
    assert!(lock.try_acquire().unwrap().is_none());
    drop(guard);
    assert!(lock.try_acquire().unwrap().is_some());
}

#[test]
fn test_acquire_waits_for_release() {
    let dir = TempDir::new().unwrap();
    let lock = lock_in(&dir, Duration::from_secs(2));
    let ev = EventLoop::new("lock");

    let held = lock.try_acquire().unwrap().unwrap();
    let holder = Rc::new(RefCell::new(Some(held)));
    let release = holder.clone();
    ev.plan_after(Duration::from_millis(50), move |_| {
        release.borrow_mut().take();
    });

    let acquired = Rc::new(Cell::new(false));
    let flag = acquired.clone();
    let started = Instant::now();
    lock.acquire(&ev).then(move |result| {
        assert!(result.is_ok());
        flag.set(true);
    });
    assert!(!acquired.get());

    let check = acquired.clone();
    ev.run_until(move || check.get()).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(holder.borrow().is_none());
}

#[test]
fn test_acquire_times_out() {
    let dir = TempDir::new().unwrap();
    let lock = lock_in(&dir, Duration::from_millis(60));
    let ev = EventLoop::new("lock");
    let _held = lock.try_acquire().unwrap().unwrap();

    let outcome = Rc::new(RefCell::new(None));
    let slot = outcome.clone();
    lock.acquire(&ev).then(move |result| *slot.borrow_mut() = Some(result));
    ev.run().unwrap();

    match outcome.borrow_mut().take().unwrap() {
        Err(ServerError::LockTimeout { waited, .. }) => assert_eq!(waited, Duration::from_millis(60)),
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn test_unwritable_lock_path() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, "").unwrap();
    let lock = MountLock::new(blocker.join("images.lock"), Duration::from_millis(10), Duration::from_secs(1));
    assert!(matches!(lock.try_acquire(), Err(ServerError::Lock { .. })));
}
