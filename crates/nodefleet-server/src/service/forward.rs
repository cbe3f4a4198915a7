//! Hub-side relay of client and node sessions to the main process.
//!
//! Each session a TCP client opens at the hub gets its own upstream session
//! against the same API on main, created on the first call. Calls are
//! forwarded one to one and answered when main answers; closing the client
//! session closes the upstream one.

use std::marker::PhantomData;

use nodefleet_rpc::{CallContext, Connector, MethodTable, Proxy, RemoteError, Reply, RpcError, Service};
use serde_json::Value;
use tracing::{debug, warn};

use super::cs::CS_API;
use super::ns::NS_API;

/// An API the hub relays, with the methods it lets through.
pub trait ForwardedApi: 'static {
    const API: &'static str;
    const METHODS: &'static [&'static str];
}

/// The `cs` surface.
pub struct ClientApi;

impl ForwardedApi for ClientApi {
    const API: &'static str = CS_API;
    const METHODS: &'static [&'static str] = &[
        "register_node",
        "mount_image",
        "umount_image",
        "umount_all",
        "list_nodes",
        "node_status",
        "list_images",
        "run_command",
        "stats",
    ];
}

/// The `ns` surface.
pub struct NodeApi;

impl ForwardedApi for NodeApi {
    const API: &'static str = NS_API;
    const METHODS: &'static [&'static str] = &["heartbeat", "get_image"];
}

/// One relayed session.
pub struct ForwardService<A: ForwardedApi> {
    upstream: Connector,
    session: Option<Proxy>,
    forwarded: u64,
    _api: PhantomData<A>,
}

impl<A: ForwardedApi> ForwardService<A> {
    pub fn new(upstream: Connector) -> Self {
        Self {
            upstream,
            session: None,
            forwarded: 0,
            _api: PhantomData,
        }
    }

    fn proxy(&mut self) -> Result<Proxy, RemoteError> {
        if let Some(proxy) = &self.session {
            return Ok(proxy.clone());
        }
        let proxy = self
            .upstream
            .create_session(A::API)
            .map_err(|e| RemoteError::new("upstream", e.to_string()))?;
        debug!("hub: opened upstream {} session {}", A::API, proxy.session_id());
        self.session = Some(proxy.clone());
        Ok(proxy)
    }

    fn forward(&mut self, ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let proxy = self.proxy()?;
        self.forwarded += 1;
        let method = ctx.method().to_string();
        let reply = ctx.defer();
        proxy
            .call_async::<Value, Value>(&method, args)
            .then(move |result| match result {
                Ok(value) => reply.ok(value),
                Err(RpcError::Remote(remote)) => reply.err(remote),
                Err(e) => {
                    warn!("hub: {} {} failed upstream: {}", A::API, method, e);
                    reply.err(RemoteError::new("upstream", e.to_string()))
                }
            });
        Ok(Reply::Deferred)
    }
}

impl<A: ForwardedApi> Service for ForwardService<A> {
    const API: &'static str = A::API;

    fn methods() -> MethodTable<Self> {
        A::METHODS
            .iter()
            .copied()
            .fold(MethodTable::new(), |table, name| table.with(name, Self::forward))
    }

    fn cleanup(&mut self) {
        if let Some(proxy) = self.session.take() {
            debug!("hub: closing upstream {} session after {} calls", A::API, self.forwarded);
            proxy.close();
        }
    }
}
