//! The `ns` API nodes call during and after boot.

use std::path::PathBuf;

use nodefleet_rpc::{parse_args, CallContext, MethodTable, RemoteError, Reply, Service};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServerError;
use crate::orchestrator::Orchestrator;

/// API name of the node surface.
pub const NS_API: &str = "ns";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatArgs {
    pub mac: String,
    #[serde(default)]
    pub ip: Option<String>,
}

/// Where a node finds its root filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeImage {
    pub image: String,
    pub mount_point: PathBuf,
    pub mounted: bool,
}

pub struct NodeService {
    orch: Orchestrator,
}

impl NodeService {
    pub fn new(orch: Orchestrator) -> Self {
        Self { orch }
    }

    fn heartbeat(&mut self, _ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let args: HeartbeatArgs = parse_args(args)?;
        if !self.orch.status().heartbeat(&args.mac, args.ip.as_deref()) {
            return Err(ServerError::UnknownNode(args.mac).to_remote());
        }
        Reply::unit()
    }

    fn get_image(&mut self, _ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let mac: String = parse_args(args)?;
        let image = self
            .orch
            .status()
            .get(&mac)
            .ok_or_else(|| ServerError::UnknownNode(mac.clone()).to_remote())?
            .image
            .ok_or_else(|| RemoteError::new("no_image", format!("node {} has no image", mac)))?;
        let mounter = self.orch.mounter();
        Reply::json(NodeImage {
            mount_point: mounter.mount_point(&image),
            mounted: mounter.is_mounted(&image),
            image,
        })
    }
}

impl Service for NodeService {
    const API: &'static str = NS_API;

    fn methods() -> MethodTable<Self> {
        MethodTable::new()
            .with("heartbeat", NodeService::heartbeat)
            .with("get_image", NodeService::get_image)
    }
}

#[cfg(test)]
#[path = "ns_tests.rs"]
mod tests;
