//! Typed client side of a session.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use nodefleet_runloop::{EventLoop, Promise, RunLoopError, RunOutcome};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use crate::connector::Link;
use crate::error::{RpcError, RpcResult};
use crate::frame::SessionId;

/// Calls methods of a remote API over one session.
///
/// Clones share the session.
#[derive(Clone)]
pub struct Proxy {
    link: Rc<Link>,
    ev: EventLoop,
    session: SessionId,
    api: Rc<str>,
}

impl Proxy {
    pub(crate) fn new(link: Rc<Link>, ev: EventLoop, session: SessionId, api: &str) -> Self {
        Self {
            link,
            ev,
            session,
            api: Rc::from(api),
        }
    }

    /// Get the remote API name.
    pub fn api(&self) -> &str {
        &self.api
    }

    /// Get the session ID.
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Get the connector name.
    pub fn connector_name(&self) -> &str {
        self.link.name()
    }

    /// Check if the underlying connector is still up.
    pub fn is_connected(&self) -> bool {
        !self.link.is_closed()
    }

    /// Start a call; the promise resolves once the reply is dispatched.
    pub fn call_async<A, R>(&self, method: &str, args: A) -> Promise<RpcResult<R>>
    where
        A: Serialize,
        R: DeserializeOwned + 'static,
    {
        self.start(method, args, None)
    }

    /// Start a call that fails with [`RpcError::Timeout`] unless answered
    /// within `timeout`. A reply arriving after the deadline is discarded.
    pub fn call_async_with_timeout<A, R>(
        &self,
        method: &str,
        args: A,
        timeout: Duration,
    ) -> Promise<RpcResult<R>>
    where
        A: Serialize,
        R: DeserializeOwned + 'static,
    {
        self.start(method, args, Some(timeout))
    }

    /// Call and drive the loop until the reply arrives.
    ///
    /// Must not be used from inside a loop callback.
    pub fn call_sync<A, R>(&self, method: &str, args: A) -> RpcResult<R>
    where
        A: Serialize,
        R: DeserializeOwned + 'static,
    {
        self.call_sync_inner(method, args, None)
    }

    /// Synchronous call with a deadline.
    pub fn call_sync_with_timeout<A, R>(&self, method: &str, args: A, timeout: Duration) -> RpcResult<R>
    where
        A: Serialize,
        R: DeserializeOwned + 'static,
    {
        self.call_sync_inner(method, args, Some(timeout))
    }

    /// Close the session. Its pending calls fail with a disconnection error.
    pub fn close(&self) {
        self.link.close_session(self.session);
    }

    fn start<A, R>(&self, method: &str, args: A, timeout: Option<Duration>) -> Promise<RpcResult<R>>
    where
        A: Serialize,
        R: DeserializeOwned + 'static,
    {
        let args = match serde_json::to_value(args) {
            Ok(args) => args,
            Err(e) => return Promise::resolved(Err(RpcError::Codec(e))),
        };
        self.link
            .submit_call(&self.ev, self.session, method, args, timeout)
            .map(|reply| reply.and_then(|value| serde_json::from_value(value).map_err(RpcError::from)))
    }

    fn call_sync_inner<A, R>(&self, method: &str, args: A, timeout: Option<Duration>) -> RpcResult<R>
    where
        A: Serialize,
        R: DeserializeOwned + 'static,
    {
        if self.ev.is_dispatching() {
            error!("{}: synchronous call to {} from inside a callback", self.link.name(), method);
            return Err(RpcError::RunLoop(RunLoopError::Reentrant));
        }

        let slot: Rc<RefCell<Option<RpcResult<R>>>> = Rc::new(RefCell::new(None));
        let slot_in = slot.clone();
        self.start::<A, R>(method, args, timeout)
            .then(move |result| *slot_in.borrow_mut() = Some(result));

        let outcome = self.ev.run_until(|| slot.borrow().is_some())?;
        let result = slot.borrow_mut().take();
        match (result, outcome) {
            (Some(result), _) => result,
            (None, RunOutcome::Stopped) => {
                debug!("{}: loop stopped while waiting for {}", self.link.name(), method);
                // Keep the stop request for the outer run.
                self.ev.stop();
                Err(RpcError::Stopped)
            }
            (None, _) => Err(RpcError::LoopExhausted),
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("connector", &self.link.name())
            .field("api", &self.api)
            .field("session", &self.session)
            .finish()
    }
}
