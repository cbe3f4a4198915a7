//! Blocking work vocabulary and the clients that submit it.
//!
//! Everything that may block (image pulls, mount commands, file writes)
//! is phrased as a [`BlockingRequest`]. Orchestration code only sees the
//! [`BlockingClient`] seam: in the main process requests travel over the
//! serialized connector to the blocking process, in tests they can go
//! straight to an [`Offload`].

mod executor;

pub use executor::BlockingExecutor;

use std::path::PathBuf;
use std::time::Duration;

use nodefleet_rpc::Proxy;
use nodefleet_runloop::Promise;
use nodefleet_workqueue::{BlockingTask, Offload};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// API name of the blocking process.
pub const BLOCKING_API: &str = "blocking";

/// One unit of blocking work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BlockingRequest {
    /// Fetch a container image.
    PullImage { image: String },
    /// Mount `source` on `target`, creating `target` first.
    Mount { source: PathBuf, target: PathBuf },
    /// Unmount `target`.
    Umount { target: PathBuf },
    /// Run a command line; a non-zero exit is reported, not raised.
    RunCommand {
        argv: Vec<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Replace a file atomically.
    WriteFile { path: PathBuf, content: String },
}

impl BlockingRequest {
    pub fn command(argv: &[String]) -> Self {
        BlockingRequest::RunCommand {
            argv: argv.to_vec(),
            timeout_secs: None,
        }
    }
}

impl BlockingTask for BlockingRequest {
    type Output = CommandOutput;

    fn label(&self) -> String {
        match self {
            BlockingRequest::PullImage { image } => format!("pull {}", image),
            BlockingRequest::Mount { target, .. } => format!("mount {}", target.display()),
            BlockingRequest::Umount { target } => format!("umount {}", target.display()),
            BlockingRequest::RunCommand { argv, .. } => format!("run {}", argv.join(" ")),
            BlockingRequest::WriteFile { path, .. } => format!("write {}", path.display()),
        }
    }
}

/// Exit status and captured output of blocking work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub status: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Submits blocking work and hands back its eventual result.
pub trait BlockingClient {
    fn run(&self, req: BlockingRequest) -> Promise<ServerResult<CommandOutput>>;
}

impl BlockingClient for Offload<BlockingRequest> {
    fn run(&self, req: BlockingRequest) -> Promise<ServerResult<CommandOutput>> {
        let (_, promise) = self.submit(req);
        promise.map(|result| result.map_err(ServerError::from))
    }
}

/// Blocking client talking to the blocking process.
#[derive(Debug, Clone)]
pub struct RemoteBlocking {
    proxy: Proxy,
    timeout: Option<Duration>,
}

impl RemoteBlocking {
    pub fn new(proxy: Proxy, timeout: Option<Duration>) -> Self {
        Self { proxy, timeout }
    }
}

impl BlockingClient for RemoteBlocking {
    fn run(&self, req: BlockingRequest) -> Promise<ServerResult<CommandOutput>> {
        let promise = match self.timeout {
            Some(timeout) => self.proxy.call_async_with_timeout("run", req, timeout),
            None => self.proxy.call_async("run", req),
        };
        promise.map(|result| result.map_err(ServerError::from))
    }
}

#[cfg(test)]
#[path = "blocking_tests.rs"]
mod tests;
