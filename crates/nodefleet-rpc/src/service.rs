//! Typed service interfaces.
//!
//! A process exposes an API by implementing [`Service`]: a constant API name
//! plus a table mapping wire method names to plain functions. The table is
//! built once when the service is registered in a [`LocalService`]; every
//! session opened against the API gets its own service instance from the
//! registered factory.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::connector::Link;
use crate::error::RemoteError;
use crate::frame::{CallId, SessionId};

/// Handler signature stored in a [`MethodTable`].
pub type Method<S> = fn(&mut S, &mut CallContext, Value) -> Result<Reply, RemoteError>;

/// What a handler produced.
#[derive(Debug)]
pub enum Reply {
    /// The answer is ready.
    Now(Value),
    /// The handler took a [`ReplyHandle`] and answers later.
    Deferred,
}

impl Reply {
    /// Serialize a ready answer.
    pub fn json<T: Serialize>(value: T) -> Result<Reply, RemoteError> {
        serde_json::to_value(value)
            .map(Reply::Now)
            .map_err(|e| RemoteError::internal(format!("failed to encode reply: {}", e)))
    }

    /// An empty ready answer.
    pub fn unit() -> Result<Reply, RemoteError> {
        Ok(Reply::Now(Value::Null))
    }
}

/// Decode call arguments into the method's parameter type.
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, RemoteError> {
    serde_json::from_value(args).map_err(RemoteError::bad_args)
}

/// Method name to handler lookup for one API.
pub struct MethodTable<S> {
    methods: HashMap<&'static str, Method<S>>,
}

impl<S> MethodTable<S> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Add a method.
    pub fn with(mut self, name: &'static str, method: Method<S>) -> Self {
        self.methods.insert(name, method);
        self
    }

    /// Look up a method.
    pub fn get(&self, name: &str) -> Option<Method<S>> {
        self.methods.get(name).copied()
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Number of methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<S> Default for MethodTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// A typed API surface.
pub trait Service: 'static {
    /// Name clients open sessions against.
    const API: &'static str;

    /// Build the method table. Called once per registration.
    fn methods() -> MethodTable<Self>
    where
        Self: Sized;

    /// Release session resources. Runs exactly once, when the session is
    /// closed by the peer or the connector goes away.
    fn cleanup(&mut self) {}
}

/// Type-erased per-session handler.
pub(crate) trait SessionHandler {
    fn dispatch(
        &mut self,
        method: &str,
        ctx: &mut CallContext,
        args: Value,
    ) -> Result<Reply, RemoteError>;

    fn cleanup(&mut self);
}

struct ServiceSession<S: Service> {
    service: S,
    table: Rc<MethodTable<S>>,
}

impl<S: Service> SessionHandler for ServiceSession<S> {
    fn dispatch(
        &mut self,
        method: &str,
        ctx: &mut CallContext,
        args: Value,
    ) -> Result<Reply, RemoteError> {
        match self.table.get(method) {
            Some(handler) => handler(&mut self.service, ctx, args),
            None => Err(RemoteError::unknown_method(S::API, method)),
        }
    }

    fn cleanup(&mut self) {
        self.service.cleanup();
    }
}

type SessionFactory = Box<dyn Fn() -> Box<dyn SessionHandler>>;

/// Registry of the APIs a connector answers.
#[derive(Default)]
pub struct LocalService {
    factories: HashMap<&'static str, SessionFactory>,
}

impl LocalService {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service; `factory` builds the instance for each session.
    pub fn register<S, F>(mut self, factory: F) -> Self
    where
        S: Service,
        F: Fn() -> S + 'static,
    {
        let table = Rc::new(S::methods());
        debug!("Registered API {} ({} methods)", S::API, table.len());
        self.factories.insert(
            S::API,
            Box::new(move || {
                Box::new(ServiceSession {
                    service: factory(),
                    table: table.clone(),
                })
            }),
        );
        self
    }

    /// Registered API names, sorted.
    pub fn apis(&self) -> Vec<&'static str> {
        let mut apis: Vec<_> = self.factories.keys().copied().collect();
        apis.sort_unstable();
        apis
    }

    pub(crate) fn open(&self, api: &str) -> Option<Box<dyn SessionHandler>> {
        self.factories.get(api).map(|factory| factory())
    }
}

impl std::fmt::Debug for LocalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalService")
            .field("apis", &self.apis())
            .finish()
    }
}

// ============================================================================
// Call context and deferred replies
// ============================================================================

/// Context of one incoming call.
pub struct CallContext {
    link: Rc<Link>,
    session: SessionId,
    call: CallId,
    method: String,
    answered: Rc<Cell<bool>>,
    deferred: bool,
}

impl CallContext {
    pub(crate) fn new(link: Rc<Link>, session: SessionId, call: CallId, method: String) -> Self {
        Self {
            link,
            session,
            call,
            method,
            answered: Rc::new(Cell::new(false)),
            deferred: false,
        }
    }

    /// Session the call belongs to.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Call identifier.
    pub fn call_id(&self) -> CallId {
        self.call
    }

    /// Method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Name of the connector the call arrived on.
    pub fn connector_name(&self) -> &str {
        self.link.name()
    }

    /// Take over the reply. The handler must then return [`Reply::Deferred`].
    pub fn defer(&mut self) -> ReplyHandle {
        self.deferred = true;
        ReplyHandle {
            link: self.link.clone(),
            session: self.session,
            call: self.call,
            method: self.method.clone(),
            answered: self.answered.clone(),
        }
    }

    pub(crate) fn is_deferred(&self) -> bool {
        self.deferred
    }

    /// Send the handler's immediate result, unless a handle already answered.
    pub(crate) fn finish(&self, result: Result<Value, RemoteError>) {
        if self.answered.replace(true) {
            warn!(
                "{}: call {} ({}) answered twice, immediate result ignored",
                self.link.name(),
                self.call,
                self.method
            );
            return;
        }
        self.link.send_reply(self.session, self.call, result);
    }
}

/// Sends the answer of a deferred call.
///
/// Dropping the handle unanswered sends a `reply_dropped` error so the caller
/// is never left waiting.
pub struct ReplyHandle {
    link: Rc<Link>,
    session: SessionId,
    call: CallId,
    method: String,
    answered: Rc<Cell<bool>>,
}

impl ReplyHandle {
    /// Method being answered.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Send the result.
    pub fn send(self, result: Result<Value, RemoteError>) {
        self.deliver(result);
    }

    /// Send a successful answer.
    pub fn ok<T: Serialize>(self, value: T) {
        let result = serde_json::to_value(value)
            .map_err(|e| RemoteError::internal(format!("failed to encode reply: {}", e)));
        self.deliver(result);
    }

    /// Send an error.
    pub fn err(self, error: RemoteError) {
        self.deliver(Err(error));
    }

    fn deliver(&self, result: Result<Value, RemoteError>) {
        if self.answered.replace(true) {
            warn!(
                "{}: call {} ({}) already answered",
                self.link.name(),
                self.call,
                self.method
            );
            return;
        }
        self.link.send_reply(self.session, self.call, result);
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        if !self.answered.get() {
            warn!(
                "{}: deferred reply to {} dropped unanswered",
                self.link.name(),
                self.method
            );
            self.deliver(Err(RemoteError::reply_dropped(&self.method)));
        }
    }
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
