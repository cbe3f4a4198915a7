use super::*;

use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn test_signal_display() {
    assert_eq!(DaemonSignal::Shutdown.to_string(), "SHUTDOWN");
    assert_eq!(DaemonSignal::Reload.to_string(), "RELOAD");
}

#[test]
fn test_token_mapping() {
    for signal in [DaemonSignal::Shutdown, DaemonSignal::Reload] {
        assert_eq!(DaemonSignal::from_token(signal.token()), Some(signal));
    }
    assert_eq!(DaemonSignal::from_token(0), None);
}

#[test]
fn test_injected_signals_reach_loop_in_order() {
    let ev = EventLoop::new("signals");
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let handler = SignalHandler::detached(&ev, move |_, signal| sink.borrow_mut().push(signal)).unwrap();
    assert!(!handler.is_listening());

    handler.request(DaemonSignal::Reload).unwrap();
    handler.request(DaemonSignal::Shutdown).unwrap();

    let check = seen.clone();
    ev.run_until(move || check.borrow().len() == 2).unwrap();
    assert_eq!(*seen.borrow(), vec![DaemonSignal::Reload, DaemonSignal::Shutdown]);
}

#[test]
fn test_injection_from_other_thread() {
    let ev = EventLoop::new("signals");
    let stopped = Rc::new(RefCell::new(false));
    let flag = stopped.clone();
    let handler = SignalHandler::detached(&ev, move |ev, signal| {
        if signal == DaemonSignal::Shutdown {
            *flag.borrow_mut() = true;
            ev.stop();
        }
    })
    .unwrap();

    let sender = handler.sender();
    std::thread::spawn(move || sender.notify(DaemonSignal::Shutdown.token()).unwrap())
        .join()
        .unwrap();

    ev.run().unwrap();
    assert!(*stopped.borrow());
}

#[test]
fn test_drop_removes_source() {
    let ev = EventLoop::new("signals");
    let handler = SignalHandler::detached(&ev, |_, _| {}).unwrap();
    assert_eq!(ev.source_count(), 1);
    drop(handler);
    assert_eq!(ev.source_count(), 0);
}

#[test]
fn test_sighup_is_forwarded() {
    use nix::sys::signal::{raise, Signal};

    let ev = EventLoop::new("signals");
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let handler = SignalHandler::install(&ev, move |_, signal| sink.borrow_mut().push(signal)).unwrap();
    assert!(handler.is_listening());

    raise(Signal::SIGHUP).unwrap();
    let check = seen.clone();
    ev.run_until(move || !check.borrow().is_empty()).unwrap();
    assert_eq!(seen.borrow()[0], DaemonSignal::Reload);
    drop(handler);
}
