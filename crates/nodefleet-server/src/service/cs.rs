//! The `cs` client API served by the main process.

use std::path::PathBuf;

use nodefleet_rpc::{parse_args, CallContext, MethodTable, RemoteError, Reply, Service};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::db::Row;
use crate::error::ServerError;
use crate::mounter::MountEnv;
use crate::orchestrator::Orchestrator;
use crate::registrar::RegisterRequest;

/// API name of the client surface.
pub const CS_API: &str = "cs";

/// Answer to `register_node`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReply {
    /// False when a registration for the node was already running.
    pub accepted: bool,
    #[serde(default)]
    pub node_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageArgs {
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandArgs {
    pub argv: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
struct MountReply {
    image: String,
    target: PathBuf,
    changed: bool,
    users: usize,
}

#[derive(Debug, Clone, Serialize)]
struct UmountAllReply {
    unmounted: Vec<String>,
    failed: Vec<(String, String)>,
}

/// One client session.
pub struct ClientService {
    orch: Orchestrator,
}

impl ClientService {
    pub fn new(orch: Orchestrator) -> Self {
        Self { orch }
    }

    fn register_node(&mut self, ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let req: RegisterRequest = parse_args(args)?;
        let Some(wf) = self.orch.registrar().register(req) else {
            return Reply::json(RegisterReply {
                accepted: false,
                node_id: None,
            });
        };
        let reply = ctx.defer();
        wf.on_end(move |env| match &env.error {
            Some(e) => reply.err(RemoteError::new("registration_failed", e.clone())),
            None => reply.ok(RegisterReply {
                accepted: true,
                node_id: env.node_id,
            }),
        });
        Ok(Reply::Deferred)
    }

    fn mount_image(&mut self, ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let args: ImageArgs = parse_args(args)?;
        let reply = ctx.defer();
        self.orch
            .mounter()
            .mount(&args.image)
            .on_end(move |env| answer_mount(reply, env));
        Ok(Reply::Deferred)
    }

    fn umount_image(&mut self, ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let args: ImageArgs = parse_args(args)?;
        let reply = ctx.defer();
        self.orch
            .mounter()
            .umount(&args.image)
            .on_end(move |env| answer_mount(reply, env));
        Ok(Reply::Deferred)
    }

    fn umount_all(&mut self, ctx: &mut CallContext, _args: Value) -> Result<Reply, RemoteError> {
        let reply = ctx.defer();
        self.orch.mounter().umount_all().on_end(move |env| {
            reply.ok(UmountAllReply {
                unmounted: env.unmounted.clone(),
                failed: env.failed.clone(),
            })
        });
        Ok(Reply::Deferred)
    }

    fn list_nodes(&mut self, _ctx: &mut CallContext, _args: Value) -> Result<Reply, RemoteError> {
        Reply::json(self.orch.status().list())
    }

    fn node_status(&mut self, _ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let mac: String = parse_args(args)?;
        match self.orch.status().get(&mac) {
            Some(status) => Reply::json(status),
            None => Err(ServerError::UnknownNode(mac).to_remote()),
        }
    }

    fn list_images(&mut self, ctx: &mut CallContext, _args: Value) -> Result<Reply, RemoteError> {
        let reply = ctx.defer();
        self.orch
            .db()
            .select("images", Row::new())
            .then(move |rows| match rows {
                Ok(rows) => reply.ok(rows),
                Err(e) => reply.err(e.to_remote()),
            });
        Ok(Reply::Deferred)
    }

    fn run_command(&mut self, ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let args: CommandArgs = parse_args(args)?;
        if args.argv.is_empty() {
            return Err(RemoteError::bad_args("empty command"));
        }
        info!("{}: running {:?}", ctx.connector_name(), args.argv);
        let reply = ctx.defer();
        self.orch
            .run_command(args.argv, args.timeout_secs)
            .then(move |output| match output {
                Ok(output) => reply.ok(output),
                Err(e) => reply.err(e.to_remote()),
            });
        Ok(Reply::Deferred)
    }

    fn stats(&mut self, _ctx: &mut CallContext, _args: Value) -> Result<Reply, RemoteError> {
        Reply::json(self.orch.stats())
    }
}

fn answer_mount(reply: nodefleet_rpc::ReplyHandle, env: &mut MountEnv) {
    match &env.error {
        Some(e) => reply.err(RemoteError::new("mount_failed", e.clone())),
        None => reply.ok(MountReply {
            image: env.image.clone(),
            target: env.target.clone(),
            changed: env.changed,
            users: env.users,
        }),
    }
}

impl Service for ClientService {
    const API: &'static str = CS_API;

    fn methods() -> MethodTable<Self> {
        MethodTable::new()
            .with("register_node", ClientService::register_node)
            .with("mount_image", ClientService::mount_image)
            .with("umount_image", ClientService::umount_image)
            .with("umount_all", ClientService::umount_all)
            .with("list_nodes", ClientService::list_nodes)
            .with("node_status", ClientService::node_status)
            .with("list_images", ClientService::list_images)
            .with("run_command", ClientService::run_command)
            .with("stats", ClientService::stats)
    }

    fn cleanup(&mut self) {
        debug!("cs: session closed");
    }
}
