//! State owned by the main process.
//!
//! Everything the client and node APIs touch hangs off one [`Orchestrator`]:
//! database and blocking clients, node status, the image mounter, the
//! service restarters and the registrar. Services receive a clone; there is
//! no process-wide registry.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nodefleet_config::{FeatureSpec, NodefleetConfig};
use nodefleet_runloop::{EventLoop, Promise, TimerHandle};
use serde::Serialize;
use tracing::{debug, info};

use crate::blocking::{BlockingClient, BlockingRequest, CommandOutput};
use crate::db::DbClient;
use crate::error::ServerResult;
use crate::exports::ExportsWriter;
use crate::mounter::ImageMounter;
use crate::registrar::{NodeRegistrar, RegistrarParts};
use crate::restarter::{RestarterStats, ServiceRestarter};
use crate::status::{NodeState, NodeStatusManager};

/// Feature turning off automatic pulls of unknown images.
pub const MANUAL_IMAGE_PULL: &str = "manual_image_pull";

/// Interval of the offline sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Registered nodes silent for longer than this are marked offline.
const NODE_TIMEOUT_SECS: i64 = 120;

/// Snapshot returned by the `stats` client call.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub started_at: DateTime<Utc>,
    pub nodes: usize,
    pub registered: usize,
    pub registering: Vec<String>,
    pub mounted: Vec<String>,
    pub nfs: RestarterStats,
    pub dhcp: RestarterStats,
    pub features: Vec<String>,
}

struct OrchestratorInner {
    ev: EventLoop,
    db: DbClient,
    blocking: Rc<dyn BlockingClient>,
    status: NodeStatusManager,
    mounter: ImageMounter,
    nfs: ServiceRestarter,
    dhcp: ServiceRestarter,
    registrar: NodeRegistrar,
    features: RefCell<FeatureSpec>,
    sweeper: RefCell<Option<TimerHandle>>,
    started_at: DateTime<Utc>,
}

/// Main process state. Clones share it.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Rc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(ev: &EventLoop, config: &NodefleetConfig, db: DbClient, blocking: Rc<dyn BlockingClient>) -> Self {
        let cooldown = config.services.restart_cooldown();
        let nfs = ServiceRestarter::new(
            ev,
            "nfs",
            config.services.nfs_restart_command.clone(),
            cooldown,
            blocking.clone(),
        );
        let dhcp = ServiceRestarter::new(
            ev,
            "dhcp",
            config.services.dhcp_restart_command.clone(),
            cooldown,
            blocking.clone(),
        );
        let status = NodeStatusManager::new();
        let mounter = ImageMounter::new(ev, config.images.clone(), blocking.clone());
        let exports = ExportsWriter::new(config.services.exports_file.clone(), blocking.clone(), nfs.clone());
        let registrar = NodeRegistrar::new(RegistrarParts {
            db: db.clone(),
            blocking: blocking.clone(),
            status: status.clone(),
            mounter: mounter.clone(),
            exports,
            dhcp: dhcp.clone(),
            images: config.images.clone(),
        });

        Self {
            inner: Rc::new(OrchestratorInner {
                ev: ev.clone(),
                db,
                blocking,
                status,
                mounter,
                nfs,
                dhcp,
                registrar,
                features: RefCell::new(FeatureSpec::default()),
                sweeper: RefCell::new(None),
                started_at: Utc::now(),
            }),
        }
    }

    pub fn db(&self) -> &DbClient {
        &self.inner.db
    }

    pub fn status(&self) -> &NodeStatusManager {
        &self.inner.status
    }

    pub fn mounter(&self) -> &ImageMounter {
        &self.inner.mounter
    }

    pub fn registrar(&self) -> &NodeRegistrar {
        &self.inner.registrar
    }

    pub fn nfs(&self) -> &ServiceRestarter {
        &self.inner.nfs
    }

    pub fn dhcp(&self) -> &ServiceRestarter {
        &self.inner.dhcp
    }

    /// Run an arbitrary command on the blocking worker.
    pub fn run_command(&self, argv: Vec<String>, timeout_secs: Option<u64>) -> Promise<ServerResult<CommandOutput>> {
        self.inner
            .blocking
            .run(BlockingRequest::RunCommand { argv, timeout_secs })
    }

    /// Apply a (re)loaded feature spec.
    pub fn apply_features(&self, spec: &FeatureSpec) {
        let changed = spec.changed_from(&self.inner.features.borrow());
        if !changed.is_empty() {
            info!("Features changed: {:?}", changed);
        }
        self.inner
            .registrar
            .set_auto_pull(!spec.is_enabled(MANUAL_IMAGE_PULL));
        *self.inner.features.borrow_mut() = spec.clone();
    }

    pub fn features(&self) -> FeatureSpec {
        self.inner.features.borrow().clone()
    }

    /// Periodically mark silent nodes offline.
    pub fn start_sweeper(&self) {
        let status = self.inner.status.clone();
        let timer = self.inner.ev.plan_repeating(SWEEP_INTERVAL, move |_| {
            status.sweep(Utc::now(), chrono::Duration::seconds(NODE_TIMEOUT_SECS));
        });
        if let Some(previous) = self.inner.sweeper.borrow_mut().replace(timer) {
            previous.cancel();
        }
    }

    pub fn stats(&self) -> OrchestratorStats {
        let inner = &self.inner;
        OrchestratorStats {
            started_at: inner.started_at,
            nodes: inner.status.len(),
            registered: inner.status.in_state(NodeState::Registered).len(),
            registering: inner.registrar.registering(),
            mounted: inner.mounter.mounted().into_keys().collect(),
            nfs: inner.nfs.stats(),
            dhcp: inner.dhcp.stats(),
            features: inner
                .features
                .borrow()
                .enabled()
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    /// Stop timers so the loop can drain.
    pub fn shutdown(&self) {
        debug!("Orchestrator shutting down");
        if let Some(timer) = self.inner.sweeper.borrow_mut().take() {
            timer.cancel();
        }
        self.inner.nfs.shutdown();
        self.inner.dhcp.shutdown();
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
