//! Server process contract and the in-child runner.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use nodefleet_config::{FeatureSpec, NodefleetConfig};
use nodefleet_runloop::EventLoop;
use tracing::{error, info, warn};

use crate::error::DaemonError;
use crate::signal::{DaemonSignal, SignalHandler};

/// Environment variable carrying the inherited channel descriptors.
pub const CHANNELS_ENV: &str = "NODEFLEET_CHANNELS";

/// One of the cooperating server processes.
///
/// The supervisor starts processes by ascending level; inside the child,
/// [`run_process`] calls `prepare` once, drives the loop, then calls
/// `cleanup` once.
pub trait ServerProcess {
    /// Process name, also the name peers use for their channel to it.
    fn name(&self) -> &str;

    /// Startup order; lower levels start first and stop last.
    fn level(&self) -> u8;

    /// Wire up connectors and register sources with the loop.
    fn prepare(&mut self, ctx: &mut ProcessContext) -> Result<(), DaemonError>;

    /// Release resources. Runs after the loop has stopped.
    fn cleanup(&mut self);

    /// Apply a re-read feature spec.
    fn reload(&mut self, _features: &FeatureSpec) {}
}

/// Peer name to inherited descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMap {
    entries: BTreeMap<String, RawFd>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: impl Into<String>, fd: RawFd) {
        self.entries.insert(peer.into(), fd);
    }

    pub fn get(&self, peer: &str) -> Option<RawFd> {
        self.entries.get(peer).copied()
    }

    pub fn fds(&self) -> Vec<RawFd> {
        self.entries.values().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode as `peer=fd,peer=fd`.
    pub fn encode(&self) -> String {
        self.entries
            .iter()
            .map(|(peer, fd)| format!("{}={}", peer, fd))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Decode the [`encode`](Self::encode) format.
    pub fn decode(value: &str) -> Result<Self, DaemonError> {
        let mut map = Self::new();
        for entry in value.split(',').filter(|e| !e.is_empty()) {
            let (peer, fd) = entry
                .split_once('=')
                .ok_or_else(|| DaemonError::InvalidChannelMap(entry.to_string()))?;
            let fd: RawFd = fd
                .parse()
                .map_err(|_| DaemonError::InvalidChannelMap(entry.to_string()))?;
            if peer.is_empty() || fd < 0 {
                return Err(DaemonError::InvalidChannelMap(entry.to_string()));
            }
            map.insert(peer, fd);
        }
        Ok(map)
    }
}

/// What a process gets to prepare itself with.
pub struct ProcessContext {
    ev: EventLoop,
    config: Rc<NodefleetConfig>,
    channels: BTreeMap<String, UnixStream>,
    features: FeatureSpec,
}

impl ProcessContext {
    /// Context without channels.
    pub fn new(ev: &EventLoop, config: Rc<NodefleetConfig>) -> Self {
        Self {
            ev: ev.clone(),
            config,
            channels: BTreeMap::new(),
            features: FeatureSpec::default(),
        }
    }

    /// Context adopting the descriptors listed in [`CHANNELS_ENV`].
    pub fn from_env(ev: &EventLoop, config: Rc<NodefleetConfig>) -> Result<Self, DaemonError> {
        let map = match std::env::var(CHANNELS_ENV) {
            Ok(value) => ChannelMap::decode(&value)?,
            Err(_) => ChannelMap::new(),
        };
        let mut ctx = Self::new(ev, config);
        for (peer, fd) in map.entries {
            // SAFETY: the supervisor passed this descriptor to us alone and
            // nothing else in this process refers to it.
            let stream = unsafe { UnixStream::from_raw_fd(fd) };
            ctx.channels.insert(peer, stream);
        }
        Ok(ctx)
    }

    /// Add a channel to a peer.
    pub fn with_channel(mut self, peer: impl Into<String>, stream: UnixStream) -> Self {
        self.channels.insert(peer.into(), stream);
        self
    }

    /// Use this feature spec.
    pub fn with_features(mut self, features: FeatureSpec) -> Self {
        self.features = features;
        self
    }

    pub fn ev(&self) -> &EventLoop {
        &self.ev
    }

    pub fn config(&self) -> &NodefleetConfig {
        &self.config
    }

    pub fn shared_config(&self) -> Rc<NodefleetConfig> {
        self.config.clone()
    }

    pub fn features(&self) -> &FeatureSpec {
        &self.features
    }

    /// Peers with an unclaimed channel.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Claim the channel to `peer`.
    pub fn take_channel(&mut self, process: &str, peer: &str) -> Result<UnixStream, DaemonError> {
        self.channels
            .remove(peer)
            .ok_or_else(|| DaemonError::MissingChannel {
                process: process.to_string(),
                peer: peer.to_string(),
            })
    }
}

/// Run a process inside its own OS process: prepare, serve until a
/// shutdown signal or loop exhaustion, clean up.
///
/// With `listen_signals` unset only injected signals are seen.
pub fn run_process<P>(process: P, mut ctx: ProcessContext, listen_signals: bool) -> Result<(), DaemonError>
where
    P: ServerProcess + 'static,
{
    let ev = ctx.ev.clone();
    let name = process.name().to_string();
    let process = Rc::new(RefCell::new(process));
    info!("{}: preparing (level {})", name, process.borrow().level());

    // The borrow must end before cleanup borrows again.
    let prepared = process.borrow_mut().prepare(&mut ctx);
    if let Err(e) = prepared {
        error!("{}: prepare failed: {}", name, e);
        process.borrow_mut().cleanup();
        return Err(e);
    }
    for peer in ctx.channel_names() {
        warn!("{}: channel to {} left unused", name, peer);
    }

    let spec_file = ctx.config.features.spec_file.clone();
    let reloading = process.clone();
    let on_signal = move |ev: &EventLoop, signal: DaemonSignal| match signal {
        DaemonSignal::Shutdown => {
            info!("{}: shutdown requested", ev.name());
            ev.stop();
        }
        DaemonSignal::Reload => match FeatureSpec::load_or_default(&spec_file) {
            Ok(features) => {
                info!("{}: feature spec reloaded ({:?} enabled)", ev.name(), features.enabled());
                reloading.borrow_mut().reload(&features);
            }
            Err(e) => warn!("{}: feature spec reload failed: {}", ev.name(), e),
        },
    };
    let signals = if listen_signals {
        SignalHandler::install(&ev, on_signal)?
    } else {
        SignalHandler::detached(&ev, on_signal)?
    };

    info!("{}: running", name);
    let result = ev.run();
    drop(signals);

    process.borrow_mut().cleanup();
    ev.shutdown();
    match result {
        Ok(()) => {
            info!("{}: stopped", name);
            Ok(())
        }
        Err(e) => {
            error!("{}: event loop failed: {}", name, e);
            Err(e.into())
        }
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
