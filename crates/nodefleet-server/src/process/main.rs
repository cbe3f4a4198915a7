//! The main process: owns the orchestrator and answers clients.

use std::rc::Rc;

use nodefleet_config::FeatureSpec;
use nodefleet_daemon::{DaemonError, ProcessContext, ServerProcess};
use nodefleet_rpc::{Connector, ConnectorOptions, LocalService};
use tracing::info;

use super::{BLOCKING, DB, HUB, MAIN};
use crate::blocking::{RemoteBlocking, BLOCKING_API};
use crate::db::{DbClient, DB_API};
use crate::orchestrator::Orchestrator;
use crate::service::{ClientService, NodeService};

#[derive(Default)]
pub struct MainProcess {
    orch: Option<Orchestrator>,
    connectors: Vec<Connector>,
}

impl MainProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn orchestrator(&self) -> Option<&Orchestrator> {
        self.orch.as_ref()
    }

    fn connect(&mut self, ctx: &mut ProcessContext, peer: &str, options: ConnectorOptions) -> Result<Connector, DaemonError> {
        let stream = ctx.take_channel(MAIN, peer)?;
        let connector = Connector::new(ctx.ev(), stream, options).map_err(|e| DaemonError::prepare(MAIN, e))?;
        self.connectors.push(connector.clone());
        Ok(connector)
    }
}

impl ServerProcess for MainProcess {
    fn name(&self) -> &str {
        MAIN
    }

    fn level(&self) -> u8 {
        1
    }

    fn prepare(&mut self, ctx: &mut ProcessContext) -> Result<(), DaemonError> {
        let config = ctx.shared_config();

        let to_db = self.connect(ctx, DB, ConnectorOptions::new("main->db"))?;
        let db = DbClient::new(to_db.create_session(DB_API).map_err(|e| DaemonError::prepare(MAIN, e))?);

        let options = ConnectorOptions::new("main->blocking").serialize_reqs(config.rpc.serialize_blocking);
        let to_blocking = self.connect(ctx, BLOCKING, options)?;
        let proxy = to_blocking
            .create_session(BLOCKING_API)
            .map_err(|e| DaemonError::prepare(MAIN, e))?;
        let blocking = Rc::new(RemoteBlocking::new(proxy, config.rpc.blocking_call_timeout()));

        let orch = Orchestrator::new(ctx.ev(), &config, db, blocking);
        orch.apply_features(ctx.features());
        orch.start_sweeper();

        if config.hub.enabled {
            let from_hub = self.connect(ctx, HUB, ConnectorOptions::new("main<-hub"))?;
            let (cs, ns) = (orch.clone(), orch.clone());
            from_hub.configure(
                LocalService::new()
                    .register(move || ClientService::new(cs.clone()))
                    .register(move || NodeService::new(ns.clone())),
            );
        }

        self.orch = Some(orch);
        Ok(())
    }

    fn reload(&mut self, features: &FeatureSpec) {
        if let Some(orch) = &self.orch {
            orch.apply_features(features);
        }
    }

    fn cleanup(&mut self) {
        if let Some(orch) = self.orch.take() {
            let stats = orch.stats();
            info!(
                "main: {} nodes known, {} registered, {} images mounted",
                stats.nodes,
                stats.registered,
                stats.mounted.len()
            );
            orch.shutdown();
        }
        for connector in self.connectors.drain(..) {
            connector.close();
        }
    }
}
