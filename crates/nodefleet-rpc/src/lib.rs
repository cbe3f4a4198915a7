//! # nodefleet RPC
//!
//! Remote procedure calls between nodefleet processes.
//!
//! A [`Connector`] wraps a local stream channel (a Unix socket pair between
//! sibling processes, or a TCP stream at the hub) and registers itself with
//! the process's [`EventLoop`](nodefleet_runloop::EventLoop). Either side
//! may open sessions against the APIs the other side serves.
//!
//! ```text
//!   caller process                                  serving process
//!  ┌────────────────┐   open / call frames    ┌──────────────────────┐
//!  │ Proxy ─────────┼────────────────────────►│ LocalService          │
//!  │  call_async()  │                         │  └─ Service per API   │
//!  │  call_sync()   │◄────────────────────────┼─ Reply / ReplyHandle  │
//!  └────────────────┘      reply frames       └──────────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`Connector`]: the channel, registered as a loop source
//! - [`Proxy`]: typed calls within a session
//! - [`Service`] / [`MethodTable`]: compile-time API surfaces
//! - [`ReplyHandle`]: answers a call after the handler returned
//! - [`Frame`]: the wire protocol

mod connector;
mod error;
mod frame;
mod proxy;
mod service;

pub use connector::{Channel, Connector, ConnectorOptions, ConnectorStats};
pub use error::{RemoteError, RpcError, RpcResult};
pub use frame::{encode_frame, CallId, Frame, FrameDecoder, SessionId, MAX_FRAME_LEN};
pub use proxy::Proxy;
pub use service::{
    parse_args, CallContext, LocalService, Method, MethodTable, Reply, ReplyHandle, Service,
};
