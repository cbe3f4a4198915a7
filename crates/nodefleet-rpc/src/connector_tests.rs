use super::*;
use std::cell::Cell;

use nodefleet_runloop::{RunLoopError, RunOutcome};
use serde_json::json;

use crate::service::{MethodTable, ReplyHandle, Service};

// ============================================================================
// Test Helpers
// ============================================================================

/// Raw peer driven by the test itself.
struct Peer {
    stream: UnixStream,
    decoder: FrameDecoder,
}

impl Peer {
    fn new(stream: UnixStream) -> Self {
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        Self {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    fn send(&mut self, frame: &Frame) {
        self.stream.write_all(&encode_frame(frame).unwrap()).unwrap();
    }

    fn recv(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.decoder.next_frame().unwrap() {
                return frame;
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).unwrap();
            assert!(n > 0, "connector hung up");
            self.decoder.push(&buf[..n]);
        }
    }

    fn recv_call(&mut self) -> (SessionId, CallId, String, Value) {
        match self.recv() {
            Frame::Call {
                session,
                call,
                method,
                args,
            } => (session, call, method, args),
            other => panic!("expected a call, got {:?}", other),
        }
    }
}

struct Counter {
    total: i64,
    cleanups: Rc<Cell<u32>>,
    parked: Rc<RefCell<Vec<ReplyHandle>>>,
}

impl Counter {
    fn add(&mut self, _ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let n: i64 = crate::service::parse_args(args)?;
        self.total += n;
        Reply::json(self.total)
    }

    fn fail(&mut self, _ctx: &mut CallContext, _args: Value) -> Result<Reply, RemoteError> {
        Err(RemoteError::new("io", "disk on fire").with_traceback("at Counter::fail"))
    }

    fn park(&mut self, ctx: &mut CallContext, _args: Value) -> Result<Reply, RemoteError> {
        self.parked.borrow_mut().push(ctx.defer());
        Ok(Reply::Deferred)
    }

    fn forget(&mut self, _ctx: &mut CallContext, _args: Value) -> Result<Reply, RemoteError> {
        Ok(Reply::Deferred)
    }

    fn oversized(&mut self, _ctx: &mut CallContext, _args: Value) -> Result<Reply, RemoteError> {
        Reply::json("x".repeat(crate::frame::MAX_FRAME_LEN + 1))
    }
}

impl Service for Counter {
    const API: &'static str = "counter";

    fn methods() -> MethodTable<Self> {
        MethodTable::new()
            .with("add", Counter::add)
            .with("fail", Counter::fail)
            .with("park", Counter::park)
            .with("forget", Counter::forget)
            .with("oversized", Counter::oversized)
    }

    fn cleanup(&mut self) {
        self.cleanups.set(self.cleanups.get() + 1);
    }
}

struct Pair {
    ev: EventLoop,
    server: Connector,
    client: Connector,
    cleanups: Rc<Cell<u32>>,
    parked: Rc<RefCell<Vec<ReplyHandle>>>,
}

fn pair() -> Pair {
    let ev = EventLoop::new("rpc-test");
    let (a, b) = UnixStream::pair().unwrap();
    let server = Connector::new(&ev, a, ConnectorOptions::new("server")).unwrap();
    let client = Connector::new(&ev, b, ConnectorOptions::new("client")).unwrap();

    let cleanups = Rc::new(Cell::new(0));
    let parked = Rc::new(RefCell::new(Vec::new()));
    let (c, p) = (cleanups.clone(), parked.clone());
    server.configure(LocalService::new().register(move || Counter {
        total: 0,
        cleanups: c.clone(),
        parked: p.clone(),
    }));

    Pair {
        ev,
        server,
        client,
        cleanups,
        parked,
    }
}

fn raw_client(serialized: bool) -> (EventLoop, Connector, Peer) {
    let ev = EventLoop::new("rpc-test");
    let (a, b) = UnixStream::pair().unwrap();
    let options = ConnectorOptions::new("client").serialize_reqs(serialized);
    let client = Connector::new(&ev, a, options).unwrap();
    (ev, client, Peer::new(b))
}

fn collect<T: 'static>(promise: Promise<T>) -> Rc<RefCell<Option<T>>> {
    let slot = Rc::new(RefCell::new(None));
    let slot_in = slot.clone();
    promise.then(move |v| *slot_in.borrow_mut() = Some(v));
    slot
}

// ============================================================================
// Calls
// ============================================================================

#[test]
fn test_call_sync_round_trip() {
    let p = pair();
    let proxy = p.client.create_session("counter").unwrap();

    assert_eq!(proxy.call_sync::<_, i64>("add", 2).unwrap(), 2);
    assert_eq!(proxy.call_sync::<_, i64>("add", 5).unwrap(), 7);

    let stats = p.client.stats();
    assert_eq!(stats.calls_sent, 2);
    assert_eq!(stats.replies_received, 2);
    assert_eq!(p.server.stats().calls_served, 2);
    p.ev.shutdown();
}

#[test]
fn test_sessions_have_separate_state() {
    let p = pair();
    let first = p.client.create_session("counter").unwrap();
    let second = p.client.create_session("counter").unwrap();
    assert_ne!(first.session_id(), second.session_id());

    assert_eq!(first.call_sync::<_, i64>("add", 10).unwrap(), 10);
    assert_eq!(second.call_sync::<_, i64>("add", 1).unwrap(), 1);
    p.ev.shutdown();
}

#[test]
fn test_remote_error_is_typed() {
    let p = pair();
    let proxy = p.client.create_session("counter").unwrap();

    let err = proxy.call_sync::<_, Value>("fail", ()).unwrap_err();
    let remote = err.remote().unwrap();
    assert_eq!(remote.kind, "io");
    assert_eq!(remote.traceback.as_deref(), Some("at Counter::fail"));

    let err = proxy.call_sync::<_, Value>("nope", ()).unwrap_err();
    assert!(err.remote().unwrap().is("unknown_method"));

    let err = proxy.call_sync::<_, i64>("add", "not a number").unwrap_err();
    assert!(err.remote().unwrap().is("bad_args"));
    p.ev.shutdown();
}

#[test]
fn test_unsendable_reply_is_replaced_by_an_error() {
    let p = pair();
    let proxy = p.client.create_session("counter").unwrap();

    let err = proxy.call_sync::<_, Value>("oversized", ()).unwrap_err();
    assert!(err.remote().unwrap().is("internal"));
    assert!(p.server.is_connected());
    assert_eq!(proxy.call_sync::<_, i64>("add", 3).unwrap(), 3);
    p.ev.shutdown();
}

#[test]
fn test_unknown_api() {
    let p = pair();
    let proxy = p.client.create_session("db").unwrap();
    let err = proxy.call_sync::<_, Value>("select", ()).unwrap_err();
    assert!(err.remote().unwrap().is("unknown_api"));
    p.ev.shutdown();
}

#[test]
fn test_async_calls_resolve_out_of_order() {
    let (ev, client, mut peer) = raw_client(false);
    let proxy = client.create_session("counter").unwrap();
    assert!(matches!(peer.recv(), Frame::Open { .. }));

    let first = collect(proxy.call_async::<_, String>("op", "first"));
    let second = collect(proxy.call_async::<_, String>("op", "second"));
    let (session, call_1, _, _) = peer.recv_call();
    let (_, call_2, _, _) = peer.recv_call();

    peer.send(&Frame::Reply {
        session,
        call: call_2,
        result: Ok(json!("two")),
    });
    let second_check = second.clone();
    ev.run_until(move || second_check.borrow().is_some()).unwrap();
    assert!(first.borrow().is_none());

    peer.send(&Frame::Reply {
        session,
        call: call_1,
        result: Ok(json!("one")),
    });
    let first_check = first.clone();
    ev.run_until(move || first_check.borrow().is_some()).unwrap();

    assert_eq!(first.borrow_mut().take().unwrap().unwrap(), "one");
    assert_eq!(second.borrow_mut().take().unwrap().unwrap(), "two");
    ev.shutdown();
}

// ============================================================================
// Deferred replies
// ============================================================================

#[test]
fn test_deferred_reply() {
    let p = pair();
    let proxy = p.client.create_session("counter").unwrap();
    let result = collect(proxy.call_async::<_, String>("park", ()));

    let parked = p.parked.clone();
    p.ev.run_until(move || !parked.borrow().is_empty()).unwrap();
    assert!(result.borrow().is_none());

    let handle = p.parked.borrow_mut().pop().unwrap();
    assert_eq!(handle.method(), "park");
    handle.ok("later");

    let result_check = result.clone();
    p.ev.run_until(move || result_check.borrow().is_some()).unwrap();
    assert_eq!(result.borrow_mut().take().unwrap().unwrap(), "later");
    p.ev.shutdown();
}

#[test]
fn test_dropped_reply_handle_answers_with_error() {
    let p = pair();
    let proxy = p.client.create_session("counter").unwrap();
    let result = collect(proxy.call_async::<_, Value>("park", ()));

    let parked = p.parked.clone();
    p.ev.run_until(move || !parked.borrow().is_empty()).unwrap();
    p.parked.borrow_mut().clear();

    let result_check = result.clone();
    p.ev.run_until(move || result_check.borrow().is_some()).unwrap();
    let err = result.borrow_mut().take().unwrap().unwrap_err();
    assert!(err.remote().unwrap().is("reply_dropped"));
    p.ev.shutdown();
}

#[test]
fn test_deferred_without_handle_is_answered() {
    let p = pair();
    let proxy = p.client.create_session("counter").unwrap();
    let err = proxy.call_sync::<_, Value>("forget", ()).unwrap_err();
    assert!(err.remote().unwrap().is("reply_dropped"));
    p.ev.shutdown();
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_disconnect_fails_pending_calls() {
    let (ev, client, mut peer) = raw_client(false);
    let proxy = client.create_session("counter").unwrap();
    peer.recv();

    let a = collect(proxy.call_async::<_, Value>("op", 1));
    let b = collect(proxy.call_async::<_, Value>("op", 2));
    assert_eq!(client.pending_calls(), 2);
    drop(peer);

    assert_eq!(ev.run_until(|| false).unwrap(), RunOutcome::Exhausted);
    assert!(a.borrow_mut().take().unwrap().unwrap_err().is_disconnected());
    assert!(b.borrow_mut().take().unwrap().unwrap_err().is_disconnected());
    assert!(!client.is_connected());
    assert_eq!(client.pending_calls(), 0);

    // Calls on a dead connector fail at once.
    let late = collect(proxy.call_async::<_, Value>("op", 3));
    assert!(late.borrow_mut().take().unwrap().unwrap_err().is_disconnected());
    assert!(client.create_session("counter").is_err());
}

#[test]
fn test_timeout_then_late_reply_dropped() {
    let (ev, client, mut peer) = raw_client(false);
    let proxy = client.create_session("counter").unwrap();
    peer.recv();

    let result = collect(proxy.call_async_with_timeout::<_, Value>(
        "slow",
        (),
        Duration::from_millis(20),
    ));
    let (session, call, method, _) = peer.recv_call();
    assert_eq!(method, "slow");

    let result_check = result.clone();
    ev.run_until(move || result_check.borrow().is_some()).unwrap();
    assert!(result.borrow_mut().take().unwrap().unwrap_err().is_timeout());

    peer.send(&Frame::Reply {
        session,
        call,
        result: Ok(json!("too late")),
    });
    let client_check = client.clone();
    ev.run_until(move || client_check.stats().late_replies == 1)
        .unwrap();
    assert_eq!(client.stats().replies_received, 0);
    ev.shutdown();
}

#[test]
fn test_call_sync_inside_callback_is_rejected() {
    let p = pair();
    let proxy = p.client.create_session("counter").unwrap();
    let seen = Rc::new(RefCell::new(None));
    let seen_in = seen.clone();
    let inner = proxy.clone();
    p.ev.plan_after(Duration::ZERO, move |_| {
        *seen_in.borrow_mut() = Some(inner.call_sync::<_, i64>("add", 1));
    });

    let seen_check = seen.clone();
    p.ev.run_until(move || seen_check.borrow().is_some()).unwrap();
    let result = seen.borrow_mut().take().unwrap();
    assert!(matches!(result, Err(RpcError::RunLoop(RunLoopError::Reentrant))));
    assert_eq!(p.client.pending_calls(), 0);
    p.ev.shutdown();
}

// ============================================================================
// Session teardown
// ============================================================================

#[test]
fn test_cleanup_once_on_session_close() {
    let p = pair();
    let proxy = p.client.create_session("counter").unwrap();
    proxy.call_sync::<_, i64>("add", 1).unwrap();

    proxy.close();
    proxy.close();
    let server = p.server.clone();
    p.ev.run_until(move || server.stats().sessions_served == 0)
        .unwrap();
    assert_eq!(p.cleanups.get(), 1);

    p.client.close();
    p.ev.run_until(|| false).unwrap();
    assert_eq!(p.cleanups.get(), 1);
}

#[test]
fn test_cleanup_once_on_disconnect() {
    let p = pair();
    let first = p.client.create_session("counter").unwrap();
    let second = p.client.create_session("counter").unwrap();
    first.call_sync::<_, i64>("add", 1).unwrap();
    second.call_sync::<_, i64>("add", 1).unwrap();
    assert_eq!(p.server.stats().sessions_served, 2);

    p.client.close();
    assert_eq!(p.ev.run_until(|| false).unwrap(), RunOutcome::Exhausted);
    assert_eq!(p.cleanups.get(), 2);
    assert!(!p.server.is_connected());
}
