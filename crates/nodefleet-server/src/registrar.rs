//! Node registration workflow.
//!
//! A registration pulls the node's image if the database does not know it
//! yet, mounts it, stores the node record, updates the status table and
//! regenerates the NFS and DHCP configuration. At most one registration
//! per MAC address is in flight; duplicates arriving meanwhile are dropped.
//!
//! Each node holds one reference on its image's mount. Re-registering with
//! the same image keeps that reference; switching images releases the old
//! one.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use chrono::Utc;
use nodefleet_config::ImagesConfig;
use nodefleet_workflow::{Step, Workflow};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info};

use crate::blocking::{BlockingClient, BlockingRequest};
use crate::db::{row, DbClient};
use crate::exports::{ExportEntry, ExportsWriter};
use crate::mounter::ImageMounter;
use crate::restarter::ServiceRestarter;
use crate::status::{NodeState, NodeStatusManager};

/// A node asking to be registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub mac: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

/// Environment of one registration.
#[derive(Debug, Clone)]
pub struct RegistrationEnv {
    pub request: RegisterRequest,
    pub pulled: bool,
    pub node_id: Option<u64>,
    pub error: Option<String>,
}

/// Collaborators a registration drives.
pub struct RegistrarParts {
    pub db: DbClient,
    pub blocking: Rc<dyn BlockingClient>,
    pub status: NodeStatusManager,
    pub mounter: ImageMounter,
    pub exports: ExportsWriter,
    pub dhcp: ServiceRestarter,
    pub images: ImagesConfig,
}

struct RegistrarInner {
    parts: RegistrarParts,
    registering: RefCell<BTreeSet<String>>,
    /// Image each registered MAC holds a mount reference on.
    holders: RefCell<BTreeMap<String, String>>,
    auto_pull: Cell<bool>,
}

/// Starts registrations and guards against duplicates. Clones share state.
#[derive(Clone)]
pub struct NodeRegistrar {
    inner: Rc<RegistrarInner>,
}

type RegStep = Step<RegistrationEnv>;
type RegFlow = Workflow<RegistrationEnv>;

impl NodeRegistrar {
    pub fn new(parts: RegistrarParts) -> Self {
        Self {
            inner: Rc::new(RegistrarInner {
                parts,
                registering: RefCell::new(BTreeSet::new()),
                holders: RefCell::new(BTreeMap::new()),
                auto_pull: Cell::new(true),
            }),
        }
    }

    /// Pull images the database does not know. On by default.
    pub fn set_auto_pull(&self, enabled: bool) {
        if self.inner.auto_pull.replace(enabled) != enabled {
            info!("Automatic image pulls {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn auto_pull(&self) -> bool {
        self.inner.auto_pull.get()
    }

    pub fn is_registering(&self, mac: &str) -> bool {
        self.inner.registering.borrow().contains(mac)
    }

    /// MAC addresses with a registration in flight.
    pub fn registering(&self) -> Vec<String> {
        self.inner.registering.borrow().iter().cloned().collect()
    }

    /// Image whose mount `mac` holds a reference on.
    pub fn held_image(&self, mac: &str) -> Option<String> {
        self.inner.holders.borrow().get(mac).cloned()
    }

    /// Start a registration. Returns `None` when one for the same MAC is
    /// already running; that request is dropped.
    pub fn register(&self, request: RegisterRequest) -> Option<RegFlow> {
        let mac = request.mac.clone();
        if !self.inner.registering.borrow_mut().insert(mac.clone()) {
            debug!("Registration of {} already in progress, request dropped", mac);
            return None;
        }
        self.inner
            .parts
            .status
            .begin_registration(&mac, request.ip.as_deref(), request.image.as_deref());

        let wf = Workflow::new(
            format!("register {}", mac),
            vec![
                self.check_image(),
                self.mount_image(),
                self.store_node(),
                self.update_status(),
                self.regenerate_config(),
            ],
            RegistrationEnv {
                request,
                pulled: false,
                node_id: None,
                error: None,
            },
        );

        let this = self.clone();
        wf.on_end(move |env| this.finished(env));
        wf.run();
        Some(wf)
    }

    fn finished(&self, env: &mut RegistrationEnv) {
        let mac = &env.request.mac;
        self.inner.registering.borrow_mut().remove(mac);
        match &env.error {
            Some(e) => {
                error!("Registration of {} failed: {}", mac, e);
                self.inner.parts.status.mark_failed(mac, e);
            }
            None => info!("Registration of {} complete (node {:?})", mac, env.node_id),
        }
    }

    fn check_image(&self) -> RegStep {
        let this = self.clone();
        Step::new("check_image", move |wf: &RegFlow, env: &mut RegistrationEnv| {
            let Some(image) = env.request.image.clone() else {
                wf.next();
                return;
            };
            let this = this.clone();
            let wf = wf.clone();
            this.inner
                .parts
                .db
                .find_one("images", row(json!({ "name": image })))
                .then(move |found| match found {
                    Ok(Some(_)) => wf.next(),
                    Ok(None) if this.auto_pull() => {
                        wf.insert_steps(vec![this.pull_image()]);
                        wf.next();
                    }
                    Ok(None) => abort(&wf, format!("image {} is missing and automatic pulls are off", image)),
                    Err(e) => abort(&wf, e),
                });
        })
    }

    fn pull_image(&self) -> RegStep {
        let this = self.clone();
        Step::new("pull_image", move |wf: &RegFlow, env: &mut RegistrationEnv| {
            let Some(image) = env.request.image.clone() else {
                wf.next();
                return;
            };
            let db = this.inner.parts.db.clone();
            let wf = wf.clone();
            this.inner
                .parts
                .blocking
                .run(BlockingRequest::PullImage { image: image.clone() })
                .then(move |pulled| {
                    if let Err(e) = pulled {
                        abort(&wf, e);
                        return;
                    }
                    let record = row(json!({ "name": image, "pulled_at": Utc::now().to_rfc3339() }));
                    db.insert("images", record).then(move |inserted| match inserted {
                        Ok(_) => wf.next_with(|env| env.pulled = true),
                        Err(e) => abort(&wf, e),
                    });
                });
        })
    }

    fn mount_image(&self) -> RegStep {
        let this = self.clone();
        Step::new("mount_image", move |wf: &RegFlow, env: &mut RegistrationEnv| {
            let Some(image) = env.request.image.clone() else {
                wf.next();
                return;
            };
            let mac = env.request.mac.clone();
            if this.held_image(&mac).as_deref() == Some(image.as_str()) {
                debug!("{} already holds {}", mac, image);
                wf.next();
                return;
            }
            let mount = this.inner.parts.mounter.mount(&image);
            let (outer, registrar) = (wf.clone(), this.clone());
            mount.on_end(move |mount_env| {
                if let Some(e) = &mount_env.error {
                    abort(&outer, e.clone());
                    return;
                }
                let previous = registrar.inner.holders.borrow_mut().insert(mac, image);
                if let Some(previous) = previous {
                    info!("Releasing {} after image change", previous);
                    registrar.inner.parts.mounter.umount(&previous);
                }
            });
            wf.continue_after(&mount);
        })
    }

    fn store_node(&self) -> RegStep {
        let this = self.clone();
        Step::new("store_node", move |wf: &RegFlow, env: &mut RegistrationEnv| {
            let db = this.inner.parts.db.clone();
            let request = env.request.clone();
            let wf = wf.clone();
            let key = row(json!({ "mac": request.mac }));
            let fields = row(json!({
                "mac": request.mac,
                "ip": request.ip,
                "image": request.image,
                "registered_at": Utc::now().to_rfc3339(),
            }));

            db.find_one("nodes", key.clone()).then(move |existing| {
                let existing = match existing {
                    Ok(existing) => existing,
                    Err(e) => return abort(&wf, e),
                };
                let stored = match existing.as_ref().and_then(|r| r.get("id")).and_then(|id| id.as_u64()) {
                    Some(id) => db.update("nodes", key, fields).map(move |r| r.map(|_| id)),
                    None => db.insert("nodes", fields),
                };
                stored.then(move |stored| match stored {
                    Ok(id) => db.commit().then(move |committed| match committed {
                        Ok(_) => wf.next_with(move |env| env.node_id = Some(id)),
                        Err(e) => abort(&wf, e),
                    }),
                    Err(e) => abort(&wf, e),
                });
            });
        })
    }

    fn update_status(&self) -> RegStep {
        let this = self.clone();
        Step::new("update_status", move |wf: &RegFlow, env: &mut RegistrationEnv| {
            this.inner.parts.status.mark_registered(&env.request.mac);
            wf.next();
        })
    }

    fn regenerate_config(&self) -> RegStep {
        let this = self.clone();
        Step::new("regenerate_config", move |wf: &RegFlow, _: &mut RegistrationEnv| {
            let entries = this.export_entries();
            let dhcp = this.inner.parts.dhcp.clone();
            let wf = wf.clone();
            this.inner.parts.exports.regenerate(&entries).then(move |result| match result {
                Ok(_) => {
                    dhcp.bump();
                    wf.next();
                }
                Err(e) => abort(&wf, e),
            });
        })
    }

    /// One export per registered node with an image and an address.
    pub fn export_entries(&self) -> Vec<ExportEntry> {
        self.inner
            .parts
            .status
            .in_state(NodeState::Registered)
            .into_iter()
            .filter_map(|node| match (node.image, node.ip) {
                (Some(image), Some(ip)) => Some(ExportEntry {
                    path: self.inner.parts.images.mount_point(&image),
                    client: ip,
                }),
                _ => None,
            })
            .collect()
    }
}

/// Record the failure and stop the registration.
fn abort(wf: &RegFlow, error: impl ToString) {
    let message = error.to_string();
    wf.update_env(move |env| env.error = Some(message));
    wf.interrupt();
}

#[cfg(test)]
#[path = "registrar_tests.rs"]
mod tests;
