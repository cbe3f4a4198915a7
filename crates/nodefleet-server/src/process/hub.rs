//! TCP front door relaying client sessions to main.

use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use nodefleet_daemon::{DaemonError, ProcessContext, ServerProcess};
use nodefleet_rpc::{Connector, ConnectorOptions, LocalService};
use nodefleet_runloop::{EventLoop, EventSource, RunLoopError, RunLoopResult, SourceId, SourceStatus};
use tracing::{debug, info, warn};

use super::{HUB, MAIN};
use crate::service::{ClientApi, ForwardService, NodeApi};

type Clients = Rc<RefCell<Vec<Connector>>>;

/// Accepts client connections; each gets a connector serving the relayed
/// `cs` and `ns` APIs.
struct HubListener {
    name: String,
    listener: TcpListener,
    upstream: Connector,
    clients: Clients,
    max_connections: usize,
}

impl HubListener {
    fn admit(&self, ev: &EventLoop, stream: std::net::TcpStream, peer: SocketAddr) -> RunLoopResult<()> {
        let mut clients = self.clients.borrow_mut();
        clients.retain(|c| c.is_connected());
        if clients.len() >= self.max_connections {
            warn!("hub: refusing {}, {} clients connected", peer, clients.len());
            return Ok(());
        }
        let connector = Connector::new(ev, stream, ConnectorOptions::new(format!("hub<-{}", peer)))
            .map_err(|e| RunLoopError::source_error(&self.name, e))?;
        let (cs, ns) = (self.upstream.clone(), self.upstream.clone());
        connector.configure(
            LocalService::new()
                .register(move || ForwardService::<ClientApi>::new(cs.clone()))
                .register(move || ForwardService::<NodeApi>::new(ns.clone())),
        );
        info!("hub: client {} connected", peer);
        clients.push(connector);
        Ok(())
    }
}

impl EventSource for HubListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn on_ready(&mut self, ev: &EventLoop) -> RunLoopResult<SourceStatus> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                self.admit(ev, stream, peer)?;
                Ok(SourceStatus::Keep)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(SourceStatus::Keep),
            Err(e) => Err(RunLoopError::source_error(&self.name, e)),
        }
    }

    fn close(&mut self) {
        debug!("hub: listener closed");
    }
}

#[derive(Default)]
pub struct HubProcess {
    listener: Option<TcpListener>,
    source: Option<(EventLoop, SourceId)>,
    local_addr: Option<SocketAddr>,
    upstream: Option<Connector>,
    clients: Clients,
}

impl HubProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve on an already bound listener instead of the configured address.
    pub fn with_listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Clients currently connected.
    pub fn client_count(&self) -> usize {
        self.clients.borrow().iter().filter(|c| c.is_connected()).count()
    }
}

impl ServerProcess for HubProcess {
    fn name(&self) -> &str {
        HUB
    }

    fn level(&self) -> u8 {
        2
    }

    fn prepare(&mut self, ctx: &mut ProcessContext) -> Result<(), DaemonError> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => TcpListener::bind(ctx.config().hub.addr())?,
        };
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let stream = ctx.take_channel(HUB, MAIN)?;
        let upstream = Connector::new(ctx.ev(), stream, ConnectorOptions::new("hub->main"))
            .map_err(|e| DaemonError::prepare(HUB, e))?;

        let source = ctx.ev().register(HubListener {
            name: format!("hub listener {}", local_addr),
            listener,
            upstream: upstream.clone(),
            clients: self.clients.clone(),
            max_connections: ctx.config().hub.max_connections,
        });
        info!("hub: listening on {}", local_addr);

        self.source = Some((ctx.ev().clone(), source));
        self.local_addr = Some(local_addr);
        self.upstream = Some(upstream);
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some((ev, source)) = self.source.take() {
            ev.remove(source);
        }
        for client in self.clients.borrow_mut().drain(..) {
            client.close();
        }
        if let Some(upstream) = self.upstream.take() {
            upstream.close();
        }
    }
}
