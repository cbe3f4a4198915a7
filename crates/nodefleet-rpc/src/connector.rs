//! RPC connector over a local stream channel.
//!
//! A connector is registered with the event loop as a source. Each readable
//! event decodes and handles exactly one frame: incoming calls are answered
//! by the configured [`LocalService`], replies resolve the matching pending
//! call. Outgoing bytes go through an outbox that is flushed eagerly and,
//! when the kernel buffer is full, on writability.
//!
//! A serialized connector keeps at most one call on the wire. Further calls
//! wait in a FIFO and the next one is sent only after the current reply has
//! been dispatched (or the call has timed out).

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::{Rc, Weak};
use std::time::Duration;

use nodefleet_runloop::{
    EventLoop, EventSource, Promise, Resolver, RunLoopResult, SourceId, SourceStatus, TimerHandle,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::error::{RemoteError, RpcError, RpcResult};
use crate::frame::{encode_frame, CallId, Frame, FrameDecoder, SessionId};
use crate::proxy::Proxy;
use crate::service::{CallContext, LocalService, Reply, SessionHandler};

const READ_CHUNK: usize = 16 * 1024;

/// A bidirectional byte stream a connector can run on.
pub trait Channel: Read + Write + AsRawFd {
    /// Switch the descriptor to non-blocking mode.
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Shut down both directions.
    fn shutdown(&self) -> io::Result<()>;
}

impl Channel for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }

    fn shutdown(&self) -> io::Result<()> {
        UnixStream::shutdown(self, std::net::Shutdown::Both)
    }
}

impl Channel for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Both)
    }
}

/// Connector options.
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// Name used in logs and errors.
    pub name: String,
    /// Keep at most one outgoing call on the wire.
    pub serialize_reqs: bool,
}

impl ConnectorOptions {
    /// Unserialized connector options.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            serialize_reqs: false,
        }
    }

    /// Enable or disable call serialization.
    pub fn serialize_reqs(mut self, serialize: bool) -> Self {
        self.serialize_reqs = serialize;
        self
    }
}

/// Connector counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectorStats {
    pub calls_sent: u64,
    pub replies_received: u64,
    pub late_replies: u64,
    pub calls_served: u64,
    pub queued: usize,
    pub pending: usize,
    pub sessions_served: usize,
}

#[derive(Default)]
struct Counters {
    calls_sent: Cell<u64>,
    replies_received: Cell<u64>,
    late_replies: Cell<u64>,
    calls_served: Cell<u64>,
}

fn bump(cell: &Cell<u64>) {
    cell.set(cell.get() + 1);
}

struct PendingCall {
    session: SessionId,
    method: String,
    resolver: Resolver<RpcResult<Value>>,
    timer: Option<TimerHandle>,
}

struct QueuedCall {
    call: CallId,
    session: SessionId,
    method: String,
    args: Value,
}

struct InboundSession {
    api: String,
    handler: Option<Rc<RefCell<Box<dyn SessionHandler>>>>,
}

// ============================================================================
// Link: state shared by the connector, its proxies and its loop source
// ============================================================================

pub(crate) struct Link {
    name: String,
    serialize: bool,
    fd: RawFd,
    channel: RefCell<Box<dyn Channel>>,
    decoder: RefCell<FrameDecoder>,
    outbox: RefCell<Vec<u8>>,
    pending: RefCell<BTreeMap<CallId, PendingCall>>,
    queue: RefCell<VecDeque<QueuedCall>>,
    in_flight: Cell<Option<CallId>>,
    outbound: RefCell<HashSet<SessionId>>,
    inbound: RefCell<HashMap<SessionId, InboundSession>>,
    local: RefCell<Option<LocalService>>,
    next_call: Cell<CallId>,
    next_session: Cell<SessionId>,
    closed: Cell<bool>,
    counters: Counters,
}

impl Link {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    fn disconnected(&self) -> RpcError {
        RpcError::Disconnected(self.name.clone())
    }

    // ------------------------------------------------------------------------
    // Outgoing
    // ------------------------------------------------------------------------

    /// Queue a frame and try to write it out.
    fn send_frame(&self, frame: &Frame) -> RpcResult<()> {
        if self.closed.get() {
            debug!("{}: dropping {} frame, connector closed", self.name, frame.kind());
            return Err(self.disconnected());
        }
        let bytes = encode_frame(frame)?;
        trace!("{}: sending {} frame ({} bytes)", self.name, frame.kind(), bytes.len());
        self.outbox.borrow_mut().extend_from_slice(&bytes);
        if let Err(e) = self.flush() {
            warn!("{}: write failed: {}", self.name, e);
            self.teardown("write failed");
        }
        Ok(())
    }

    /// Write as much of the outbox as the channel accepts.
    fn flush(&self) -> io::Result<()> {
        let mut outbox = self.outbox.borrow_mut();
        let mut channel = self.channel.borrow_mut();
        while !outbox.is_empty() {
            match channel.write(&outbox) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    outbox.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub(crate) fn send_reply(&self, session: SessionId, call: CallId, result: Result<Value, RemoteError>) {
        let frame = Frame::Reply {
            session,
            call,
            result,
        };
        if let Err(e) = self.send_frame(&frame) {
            if !e.is_disconnected() {
                error!("{}: failed to send reply to call {}: {}", self.name, call, e);
                // The caller must still hear back.
                let fallback = Frame::Reply {
                    session,
                    call,
                    result: Err(RemoteError::internal(e.to_string())),
                };
                if let Err(e) = self.send_frame(&fallback) {
                    error!("{}: call {} left unanswered: {}", self.name, call, e);
                }
            }
        }
    }

    pub(crate) fn open_session(&self, api: &str) -> RpcResult<SessionId> {
        if self.closed.get() {
            return Err(self.disconnected());
        }
        let session = self.next_session.get() + 1;
        self.next_session.set(session);
        self.send_frame(&Frame::Open {
            session,
            api: api.to_string(),
        })?;
        self.outbound.borrow_mut().insert(session);
        debug!("{}: opened session {} on API {}", self.name, session, api);
        Ok(session)
    }

    pub(crate) fn close_session(&self, session: SessionId) {
        if !self.outbound.borrow_mut().remove(&session) {
            return;
        }
        let orphaned: Vec<PendingCall> = {
            let mut pending = self.pending.borrow_mut();
            let calls: Vec<CallId> = pending
                .iter()
                .filter(|(_, p)| p.session == session)
                .map(|(call, _)| *call)
                .collect();
            calls.into_iter().filter_map(|call| pending.remove(&call)).collect()
        };
        self.queue.borrow_mut().retain(|q| q.session != session);
        if self
            .in_flight
            .get()
            .is_some_and(|call| !self.pending.borrow().contains_key(&call))
        {
            self.in_flight.set(None);
        }

        let _ = self.send_frame(&Frame::Close { session });
        debug!("{}: closed session {} ({} calls orphaned)", self.name, session, orphaned.len());
        for call in orphaned {
            if let Some(timer) = &call.timer {
                timer.cancel();
            }
            call.resolver.resolve(Err(self.disconnected()));
        }
        self.pump();
    }

    /// Register a call and send it, or queue it behind the one in flight.
    pub(crate) fn submit_call(
        self: &Rc<Self>,
        ev: &EventLoop,
        session: SessionId,
        method: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Promise<RpcResult<Value>> {
        let (resolver, promise) = Promise::pending(format!("{}:{}", self.name, method));
        if self.closed.get() {
            resolver.resolve(Err(self.disconnected()));
            return promise;
        }

        let call = self.next_call.get() + 1;
        self.next_call.set(call);

        let timer = timeout.map(|timeout| {
            let link: Weak<Link> = Rc::downgrade(self);
            ev.plan_after(timeout, move |_| {
                if let Some(link) = link.upgrade() {
                    link.expire(call, timeout);
                }
            })
        });
        self.pending.borrow_mut().insert(
            call,
            PendingCall {
                session,
                method: method.to_string(),
                resolver,
                timer,
            },
        );

        let busy = self.in_flight.get().is_some() || !self.queue.borrow().is_empty();
        if self.serialize && busy {
            debug!("{}: queueing call {} ({})", self.name, call, method);
            self.queue.borrow_mut().push_back(QueuedCall {
                call,
                session,
                method: method.to_string(),
                args,
            });
        } else {
            self.transmit(call, session, method, args);
        }
        promise
    }

    /// Put a call on the wire. Returns false if it failed locally.
    fn transmit(&self, call: CallId, session: SessionId, method: &str, args: Value) -> bool {
        if self.serialize {
            self.in_flight.set(Some(call));
        }
        let frame = Frame::Call {
            session,
            call,
            method: method.to_string(),
            args,
        };
        match self.send_frame(&frame) {
            Ok(()) => {
                bump(&self.counters.calls_sent);
                true
            }
            Err(e) => {
                if self.in_flight.get() == Some(call) {
                    self.in_flight.set(None);
                }
                let entry = self.pending.borrow_mut().remove(&call);
                if let Some(entry) = entry {
                    if let Some(timer) = &entry.timer {
                        timer.cancel();
                    }
                    entry.resolver.resolve(Err(e));
                }
                false
            }
        }
    }

    /// Send the next queued call if nothing is in flight.
    fn pump(&self) {
        if !self.serialize || self.in_flight.get().is_some() || self.closed.get() {
            return;
        }
        loop {
            let next = self.queue.borrow_mut().pop_front();
            let Some(next) = next else {
                return;
            };
            if !self.pending.borrow().contains_key(&next.call) {
                continue;
            }
            if self.transmit(next.call, next.session, &next.method, next.args) {
                return;
            }
        }
    }

    /// Deadline of a call passed.
    fn expire(&self, call: CallId, timeout: Duration) {
        let entry = self.pending.borrow_mut().remove(&call);
        let Some(entry) = entry else {
            return;
        };
        self.queue.borrow_mut().retain(|q| q.call != call);
        if self.in_flight.get() == Some(call) {
            self.in_flight.set(None);
        }
        warn!("{}: call {} ({}) timed out after {:?}", self.name, call, entry.method, timeout);
        entry.resolver.resolve(Err(RpcError::Timeout {
            method: entry.method.clone(),
            timeout,
        }));
        self.pump();
    }

    // ------------------------------------------------------------------------
    // Incoming
    // ------------------------------------------------------------------------

    fn on_readable(self: &Rc<Self>) -> RunLoopResult<SourceStatus> {
        if self.closed.get() {
            return Ok(SourceStatus::Remove);
        }

        if !self.decoder.borrow().has_frame() {
            let mut buf = [0u8; READ_CHUNK];
            let read = self.channel.borrow_mut().read(&mut buf);
            match read {
                Ok(0) => {
                    self.teardown("peer closed the channel");
                    return Ok(SourceStatus::Remove);
                }
                Ok(n) => self.decoder.borrow_mut().push(&buf[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    return Ok(SourceStatus::Keep);
                }
                Err(e) => {
                    warn!("{}: read failed: {}", self.name, e);
                    self.teardown("read failed");
                    return Ok(SourceStatus::Remove);
                }
            }
        }

        let next = self.decoder.borrow_mut().next_frame();
        match next {
            Ok(Some(frame)) => self.handle_frame(frame),
            Ok(None) => {}
            Err(e) => {
                error!("{}: undecodable frame: {}", self.name, e);
                self.teardown("protocol error");
            }
        }

        if self.closed.get() {
            Ok(SourceStatus::Remove)
        } else {
            Ok(SourceStatus::Keep)
        }
    }

    fn handle_frame(self: &Rc<Self>, frame: Frame) {
        trace!("{}: received {} frame", self.name, frame.kind());
        match frame {
            Frame::Open { session, api } => self.handle_open(session, api),
            Frame::Call {
                session,
                call,
                method,
                args,
            } => self.handle_call(session, call, method, args),
            Frame::Reply { call, result, .. } => self.handle_reply(call, result),
            Frame::Close { session } => self.handle_close(session),
        }
    }

    fn handle_open(&self, session: SessionId, api: String) {
        let handler = self.local.borrow().as_ref().and_then(|local| local.open(&api));
        match handler {
            Some(_) => debug!("{}: peer opened session {} on API {}", self.name, session, api),
            None => warn!("{}: peer opened session {} on unknown API {}", self.name, session, api),
        }
        self.inbound.borrow_mut().insert(
            session,
            InboundSession {
                api,
                handler: handler.map(|h| Rc::new(RefCell::new(h))),
            },
        );
    }

    fn handle_call(self: &Rc<Self>, session: SessionId, call: CallId, method: String, args: Value) {
        bump(&self.counters.calls_served);
        let target = self
            .inbound
            .borrow()
            .get(&session)
            .map(|s| (s.api.clone(), s.handler.clone()));

        let mut ctx = CallContext::new(self.clone(), session, call, method.clone());
        let result = match target {
            None => Err(RemoteError::new(
                "unknown_session",
                format!("session {} is not open", session),
            )),
            Some((api, None)) => Err(RemoteError::unknown_api(&api)),
            Some((_, Some(handler))) => match handler.try_borrow_mut() {
                Ok(mut handler) => handler.dispatch(&method, &mut ctx, args),
                Err(_) => Err(RemoteError::new(
                    "session_busy",
                    format!("session {} is already handling a call", session),
                )),
            },
        };

        match result {
            Ok(Reply::Now(value)) => ctx.finish(Ok(value)),
            Ok(Reply::Deferred) if ctx.is_deferred() => {}
            Ok(Reply::Deferred) => {
                error!("{}: {} deferred without taking a reply handle", self.name, method);
                ctx.finish(Err(RemoteError::reply_dropped(&method)));
            }
            Err(e) => {
                debug!("{}: call {} ({}) failed: {}", self.name, call, method, e);
                ctx.finish(Err(e));
            }
        }
    }

    fn handle_reply(&self, call: CallId, result: Result<Value, RemoteError>) {
        if self.serialize && self.in_flight.get() != Some(call) {
            // Only the call on the wire may be answered; anything else is stale.
            warn!("{}: reply for call {} which is not in flight, dropped", self.name, call);
            bump(&self.counters.late_replies);
            return;
        }
        let entry = self.pending.borrow_mut().remove(&call);
        let Some(entry) = entry else {
            debug!("{}: late reply for call {} dropped", self.name, call);
            bump(&self.counters.late_replies);
            return;
        };
        if self.in_flight.get() == Some(call) {
            self.in_flight.set(None);
        }
        if let Some(timer) = &entry.timer {
            timer.cancel();
        }
        bump(&self.counters.replies_received);
        entry.resolver.resolve(result.map_err(RpcError::Remote));
        self.pump();
    }

    fn handle_close(&self, session: SessionId) {
        let closed = self.inbound.borrow_mut().remove(&session);
        if let Some(closed) = closed {
            debug!("{}: peer closed session {} ({})", self.name, session, closed.api);
            Self::cleanup_session(&self.name, session, closed);
        }
    }

    fn cleanup_session(name: &str, session: SessionId, closed: InboundSession) {
        let Some(handler) = closed.handler else {
            return;
        };
        match handler.try_borrow_mut() {
            Ok(mut handler) => handler.cleanup(),
            Err(_) => error!("{}: session {} closed while handling a call, cleanup skipped", name, session),
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Fail every pending call and clean up every served session. Idempotent.
    pub(crate) fn teardown(&self, reason: &str) {
        if self.closed.replace(true) {
            return;
        }
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        let sessions = std::mem::take(&mut *self.inbound.borrow_mut());
        self.queue.borrow_mut().clear();
        self.in_flight.set(None);
        self.outbox.borrow_mut().clear();
        self.outbound.borrow_mut().clear();

        if pending.is_empty() {
            info!("{}: disconnected ({})", self.name, reason);
        } else {
            warn!(
                "{}: disconnected ({}), failing {} pending calls",
                self.name,
                reason,
                pending.len()
            );
        }

        for (_, call) in pending {
            if let Some(timer) = &call.timer {
                timer.cancel();
            }
            call.resolver.resolve(Err(self.disconnected()));
        }

        let mut sessions: Vec<_> = sessions.into_iter().collect();
        sessions.sort_by_key(|(id, _)| *id);
        for (id, session) in sessions {
            Self::cleanup_session(&self.name, id, session);
        }
    }

    fn shutdown_channel(&self) {
        if let Ok(channel) = self.channel.try_borrow() {
            if let Err(e) = channel.shutdown() {
                trace!("{}: shutdown: {}", self.name, e);
            }
        }
    }

    fn stats(&self) -> ConnectorStats {
        ConnectorStats {
            calls_sent: self.counters.calls_sent.get(),
            replies_received: self.counters.replies_received.get(),
            late_replies: self.counters.late_replies.get(),
            calls_served: self.counters.calls_served.get(),
            queued: self.queue.borrow().len(),
            pending: self.pending.borrow().len(),
            sessions_served: self.inbound.borrow().len(),
        }
    }
}

/// Loop-side view of a link.
struct LinkSource {
    link: Rc<Link>,
}

impl EventSource for LinkSource {
    fn name(&self) -> &str {
        &self.link.name
    }

    fn raw_fd(&self) -> RawFd {
        self.link.fd
    }

    fn on_ready(&mut self, _ev: &EventLoop) -> RunLoopResult<SourceStatus> {
        self.link.on_readable()
    }

    fn has_buffered(&self) -> bool {
        !self.link.closed.get() && self.link.decoder.borrow().has_frame()
    }

    fn wants_write(&self) -> bool {
        !self.link.outbox.borrow().is_empty()
    }

    fn on_writable(&mut self, _ev: &EventLoop) -> RunLoopResult<SourceStatus> {
        if let Err(e) = self.link.flush() {
            warn!("{}: write failed: {}", self.link.name, e);
            self.link.teardown("write failed");
            return Ok(SourceStatus::Remove);
        }
        Ok(SourceStatus::Keep)
    }

    fn close(&mut self) {
        self.link.teardown("removed from the event loop");
        self.link.shutdown_channel();
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Handle to a connector registered with an event loop.
#[derive(Clone)]
pub struct Connector {
    link: Rc<Link>,
    ev: EventLoop,
    source: SourceId,
}

impl Connector {
    /// Wrap `channel` and register it with the loop.
    pub fn new<C>(ev: &EventLoop, channel: C, options: ConnectorOptions) -> RpcResult<Self>
    where
        C: Channel + 'static,
    {
        channel.set_nonblocking(true)?;
        let fd = channel.as_raw_fd();
        let link = Rc::new(Link {
            name: options.name,
            serialize: options.serialize_reqs,
            fd,
            channel: RefCell::new(Box::new(channel)),
            decoder: RefCell::new(FrameDecoder::new()),
            outbox: RefCell::new(Vec::new()),
            pending: RefCell::new(BTreeMap::new()),
            queue: RefCell::new(VecDeque::new()),
            in_flight: Cell::new(None),
            outbound: RefCell::new(HashSet::new()),
            inbound: RefCell::new(HashMap::new()),
            local: RefCell::new(None),
            next_call: Cell::new(0),
            next_session: Cell::new(0),
            closed: Cell::new(false),
            counters: Counters::default(),
        });
        let source = ev.register(LinkSource { link: link.clone() });
        info!(
            "Connector {} registered (serialized: {})",
            link.name, link.serialize
        );
        Ok(Self {
            link,
            ev: ev.clone(),
            source,
        })
    }

    /// Get the connector name.
    pub fn name(&self) -> &str {
        &self.link.name
    }

    /// Check if calls are serialized.
    pub fn is_serialized(&self) -> bool {
        self.link.serialize
    }

    /// Check if the channel is still up.
    pub fn is_connected(&self) -> bool {
        !self.link.is_closed()
    }

    /// Install the APIs answered for sessions the peer opens.
    pub fn configure(&self, service: LocalService) {
        info!("{}: serving APIs {:?}", self.link.name, service.apis());
        *self.link.local.borrow_mut() = Some(service);
    }

    /// Open a session against a remote API.
    pub fn create_session(&self, api: &str) -> RpcResult<Proxy> {
        let session = self.link.open_session(api)?;
        Ok(Proxy::new(self.link.clone(), self.ev.clone(), session, api))
    }

    /// Get counters.
    pub fn stats(&self) -> ConnectorStats {
        self.link.stats()
    }

    /// Number of calls waiting for a reply (queued ones included).
    pub fn pending_calls(&self) -> usize {
        self.link.pending.borrow().len()
    }

    /// Loop source identifier.
    pub fn source_id(&self) -> SourceId {
        self.source
    }

    /// Close the channel. Pending calls fail with a disconnection error.
    pub fn close(&self) {
        self.link.teardown("closed locally");
        self.ev.remove(self.source);
        self.link.shutdown_channel();
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.link.name)
            .field("serialized", &self.link.serialize)
            .field("connected", &!self.link.is_closed())
            .finish()
    }
}

#[cfg(test)]
#[path = "connector_tests.rs"]
mod tests;
