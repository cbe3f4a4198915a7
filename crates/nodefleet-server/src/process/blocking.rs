//! Runs the blocking worker and serves its queue to main.

use nodefleet_daemon::{DaemonError, ProcessContext, ServerProcess};
use nodefleet_rpc::{Connector, ConnectorOptions, LocalService};
use nodefleet_workqueue::{Offload, QueueConfig};
use tracing::{info, warn};

use super::{BLOCKING, MAIN};
use crate::blocking::{BlockingExecutor, BlockingRequest};
use crate::service::BlockingService;

#[derive(Default)]
pub struct BlockingProcess {
    offload: Option<Offload<BlockingRequest>>,
    connector: Option<Connector>,
}

impl BlockingProcess {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServerProcess for BlockingProcess {
    fn name(&self) -> &str {
        BLOCKING
    }

    fn level(&self) -> u8 {
        2
    }

    fn prepare(&mut self, ctx: &mut ProcessContext) -> Result<(), DaemonError> {
        let config = ctx.config();
        let queue = QueueConfig {
            worker_name: "blocking-worker".to_string(),
            task_timeout_secs: config.blocking.task_timeout_secs,
            slow_task_secs: config.blocking.slow_task_secs,
        };
        let executor = BlockingExecutor::new(config.images.clone(), &config.blocking);
        let offload = Offload::spawn_with_config(ctx.ev(), queue, executor)
            .map_err(|e| DaemonError::prepare(BLOCKING, e))?;

        let stream = ctx.take_channel(BLOCKING, MAIN)?;
        let connector = Connector::new(ctx.ev(), stream, ConnectorOptions::new("blocking<-main"))
            .map_err(|e| DaemonError::prepare(BLOCKING, e))?;
        let served = offload.clone();
        connector.configure(LocalService::new().register(move || BlockingService::new(served.clone())));

        self.offload = Some(offload);
        self.connector = Some(connector);
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(connector) = self.connector.take() {
            connector.close();
        }
        if let Some(offload) = self.offload.take() {
            let stats = offload.stats();
            if let Err(e) = offload.shutdown() {
                warn!("blocking: worker shutdown failed: {}", e);
            }
            info!(
                "blocking: {} tasks completed, {} failed, {} panicked",
                stats.completed, stats.failed, stats.panicked
            );
        }
    }
}
