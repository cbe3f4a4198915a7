//! The `blocking` API served by the blocking process.

use nodefleet_rpc::{parse_args, CallContext, MethodTable, RemoteError, Reply, Service};
use nodefleet_workqueue::Offload;
use serde_json::Value;
use tracing::debug;

use crate::blocking::{BlockingRequest, BLOCKING_API};
use crate::error::task_to_remote;

/// Hands each call to the offload worker and answers when it completes.
pub struct BlockingService {
    offload: Offload<BlockingRequest>,
}

impl BlockingService {
    pub fn new(offload: Offload<BlockingRequest>) -> Self {
        Self { offload }
    }

    fn run(&mut self, ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let req: BlockingRequest = parse_args(args)?;
        let reply = ctx.defer();
        let (id, promise) = self.offload.submit(req);
        debug!("{}: call {} queued as {}", ctx.connector_name(), ctx.call_id(), id);
        promise.then(move |result| match result {
            Ok(output) => reply.ok(output),
            Err(failure) => reply.err(task_to_remote(failure)),
        });
        Ok(Reply::Deferred)
    }

    fn stats(&mut self, _ctx: &mut CallContext, _args: Value) -> Result<Reply, RemoteError> {
        Reply::json(self.offload.stats())
    }

    fn outstanding(&mut self, _ctx: &mut CallContext, _args: Value) -> Result<Reply, RemoteError> {
        Reply::json(self.offload.outstanding_tasks())
    }
}

impl Service for BlockingService {
    const API: &'static str = BLOCKING_API;

    fn methods() -> MethodTable<Self> {
        MethodTable::new()
            .with("run", BlockingService::run)
            .with("stats", BlockingService::stats)
            .with("outstanding", BlockingService::outstanding)
    }
}
