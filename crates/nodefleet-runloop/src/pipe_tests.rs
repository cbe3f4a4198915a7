use super::*;
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn test_tokens_delivered_in_order() {
    let ev = EventLoop::new("pipe-test");
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_in = seen.clone();
    let (sender, source) = wakeup_pipe("tokens", move |_, token| {
        seen_in.borrow_mut().push(token);
        Ok(())
    })
    .unwrap();
    ev.register(source);

    sender.notify(3).unwrap();
    sender.notify(1).unwrap();
    sender.notify(2).unwrap();

    let seen_check = seen.clone();
    ev.run_until(move || seen_check.borrow().len() == 3).unwrap();
    assert_eq!(*seen.borrow(), vec![3, 1, 2]);
}

#[test]
fn test_one_token_per_pass() {
    let ev = EventLoop::new("pipe-test");
    let count = Rc::new(RefCell::new(0u32));
    let count_in = count.clone();
    let (sender, source) = wakeup_pipe("tokens", move |_, _| {
        *count_in.borrow_mut() += 1;
        Ok(())
    })
    .unwrap();
    ev.register(source);

    sender.notify(10).unwrap();
    sender.notify(11).unwrap();

    ev.run_once().unwrap();
    assert_eq!(*count.borrow(), 1);
    ev.run_once().unwrap();
    assert_eq!(*count.borrow(), 2);
}

#[test]
fn test_sender_from_other_thread() {
    let ev = EventLoop::new("pipe-test");
    let got = Rc::new(RefCell::new(None));
    let got_in = got.clone();
    let (sender, source) = wakeup_pipe("thread", move |_, token| {
        *got_in.borrow_mut() = Some(token);
        Ok(())
    })
    .unwrap();
    ev.register(source);

    let handle = std::thread::spawn(move || sender.notify(42).unwrap());
    let got_check = got.clone();
    ev.run_until(move || got_check.borrow().is_some()).unwrap();
    handle.join().unwrap();
    assert_eq!(*got.borrow(), Some(42));
}

#[test]
fn test_source_removed_when_senders_dropped() {
    let ev = EventLoop::new("pipe-test");
    let (sender, source) = wakeup_pipe("eof", |_, _| Ok(())).unwrap();
    ev.register(source);
    drop(sender);

    let outcome = ev.run_until(|| false).unwrap();
    assert_eq!(outcome, crate::RunOutcome::Exhausted);
    assert_eq!(ev.source_count(), 0);
}

#[test]
fn test_handler_error_is_fatal() {
    let ev = EventLoop::new("pipe-test");
    let (sender, source) = wakeup_pipe("failing", |_, token| {
        Err(crate::RunLoopError::source_error("failing", format!("bad token {token}")))
    })
    .unwrap();
    ev.register(source);
    sender.notify(7).unwrap();

    let err = ev.run().unwrap_err();
    assert!(err.to_string().contains("bad token 7"));
}
