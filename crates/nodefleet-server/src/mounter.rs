//! Image mount and unmount workflows.
//!
//! Every mount or unmount command runs while holding the [`MountLock`], so
//! no two of them ever overlap, whichever image they concern.
//!
//! Mounts are reference counted per image: the first user mounts, later
//! users only add to the count, and the image is unmounted when the last
//! user releases it. At most one mount or unmount per image is in flight;
//! any other request for that image waits for it to finish and then
//! re-examines the mount table.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

use nodefleet_config::ImagesConfig;
use nodefleet_runloop::{EventLoop, Promise};
use nodefleet_workflow::{Step, Workflow};
use nodefleet_workqueue::BlockingTask;
use tracing::{debug, info, warn};

use crate::blocking::{BlockingClient, BlockingRequest, CommandOutput};
use crate::error::{ServerError, ServerResult};
use crate::lock::MountLock;

/// Environment of a single mount or unmount.
#[derive(Debug, Clone, Default)]
pub struct MountEnv {
    pub image: String,
    pub target: PathBuf,
    /// Whether the mount table changed.
    pub changed: bool,
    /// Users of the image once the request is done.
    pub users: usize,
    pub error: Option<String>,
}

/// Environment of an unmount-everything run.
#[derive(Debug, Clone, Default)]
pub struct UmountAllEnv {
    pub images: Vec<String>,
    pub unmounted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Mount,
    /// `force` ignores the remaining users.
    Umount { force: bool },
}

#[derive(Debug, Clone)]
struct Mounted {
    target: PathBuf,
    users: usize,
}

struct MounterInner {
    ev: EventLoop,
    config: ImagesConfig,
    lock: MountLock,
    blocking: Rc<dyn BlockingClient>,
    mounted: RefCell<BTreeMap<String, Mounted>>,
    /// The mount or unmount currently running for an image.
    in_flight: RefCell<BTreeMap<String, Workflow<MountEnv>>>,
}

/// Mounts images under the mount directory. Clones share state.
#[derive(Clone)]
pub struct ImageMounter {
    inner: Rc<MounterInner>,
}

impl ImageMounter {
    pub fn new(ev: &EventLoop, config: ImagesConfig, blocking: Rc<dyn BlockingClient>) -> Self {
        let lock = MountLock::from_config(&config);
        Self {
            inner: Rc::new(MounterInner {
                ev: ev.clone(),
                config,
                lock,
                blocking,
                mounted: RefCell::new(BTreeMap::new()),
                in_flight: RefCell::new(BTreeMap::new()),
            }),
        }
    }

    pub fn is_mounted(&self, image: &str) -> bool {
        self.inner.mounted.borrow().contains_key(image)
    }

    /// Current users of `image`; zero when it is not mounted.
    pub fn users(&self, image: &str) -> usize {
        self.inner.mounted.borrow().get(image).map_or(0, |m| m.users)
    }

    /// Whether a mount or unmount of `image` is running.
    pub fn is_busy(&self, image: &str) -> bool {
        self.inner.in_flight.borrow().contains_key(image)
    }

    /// Mounted images and their mount points.
    pub fn mounted(&self) -> BTreeMap<String, PathBuf> {
        self.inner
            .mounted
            .borrow()
            .iter()
            .map(|(image, m)| (image.clone(), m.target.clone()))
            .collect()
    }

    pub fn mount_point(&self, image: &str) -> PathBuf {
        self.inner.config.mount_point(image)
    }

    /// Run `req` while holding the mount lock.
    fn locked(&self, req: BlockingRequest) -> Promise<ServerResult<CommandOutput>> {
        let (resolver, promise) = Promise::pending(req.label());
        let blocking = self.inner.blocking.clone();
        self.inner.lock.acquire(&self.inner.ev).then(move |guard| match guard {
            Ok(guard) => blocking.run(req).then(move |result| {
                drop(guard);
                resolver.resolve(result);
            }),
            Err(e) => {
                resolver.resolve(Err(e));
            }
        });
        promise
    }

    /// Take a reference on `image`, mounting it if this is the first one.
    pub fn mount(&self, image: &str) -> Workflow<MountEnv> {
        self.start(image, Request::Mount)
    }

    /// Drop a reference on `image`, unmounting it with the last one.
    /// Images not mounted finish at once.
    pub fn umount(&self, image: &str) -> Workflow<MountEnv> {
        self.start(image, Request::Umount { force: false })
    }

    fn start(&self, image: &str, request: Request) -> Workflow<MountEnv> {
        let env = MountEnv {
            image: image.to_string(),
            target: self.mount_point(image),
            ..MountEnv::default()
        };
        let (name, command) = match request {
            Request::Mount => (format!("mount {}", image), self.mount_step()),
            Request::Umount { .. } => (format!("umount {}", image), self.umount_step()),
        };
        let wf = Workflow::new(name, vec![self.claim_step(request), command], env);

        let mounter = self.clone();
        let (image, id) = (image.to_string(), wf.id());
        wf.on_end(move |env| {
            let mut in_flight = mounter.inner.in_flight.borrow_mut();
            if in_flight.get(&image).is_some_and(|owner| owner.id() == id) {
                in_flight.remove(&image);
            }
            drop(in_flight);
            env.users = mounter.users(&image);
        });
        wf.run();
        wf
    }

    /// Decide whether a command is needed, waiting out any request already
    /// running for the image.
    fn claim_step(&self, request: Request) -> Step<MountEnv> {
        let this = self.clone();
        Step::new("claim", move |wf: &Workflow<MountEnv>, env: &mut MountEnv| {
            let running = this.inner.in_flight.borrow().get(&env.image).cloned();
            if let Some(running) = running {
                debug!("{}: waiting for {}", wf.name(), running.name());
                wf.insert_steps(vec![this.claim_step(request)]);
                wf.continue_after(&running);
                return;
            }

            let users = this.users(&env.image);
            match request {
                Request::Mount if users > 0 => {
                    this.adjust_users(&env.image, 1);
                    wf.interrupt();
                }
                Request::Umount { force: false } if users > 1 => {
                    this.adjust_users(&env.image, -1);
                    wf.interrupt();
                }
                Request::Umount { .. } if users == 0 => wf.interrupt(),
                _ => {
                    this.inner.in_flight.borrow_mut().insert(env.image.clone(), wf.clone());
                    wf.next();
                }
            }
        })
    }

    fn adjust_users(&self, image: &str, delta: isize) {
        if let Some(m) = self.inner.mounted.borrow_mut().get_mut(image) {
            m.users = m.users.saturating_add_signed(delta);
            debug!("{} now has {} users", image, m.users);
        }
    }

    fn mount_step(&self) -> Step<MountEnv> {
        let run = self.clone();
        Step::new("mount", move |wf: &Workflow<MountEnv>, env: &mut MountEnv| {
            let req = BlockingRequest::Mount {
                source: run.inner.config.image_path(&env.image),
                target: env.target.clone(),
            };
            let (image, target) = (env.image.clone(), env.target.clone());
            let mounter = run.clone();
            let wf = wf.clone();
            run.locked(req).then(move |result| match result {
                Ok(_) => {
                    info!("Mounted {} on {}", image, target.display());
                    mounter
                        .inner
                        .mounted
                        .borrow_mut()
                        .insert(image, Mounted { target, users: 1 });
                    wf.next_with(|env| env.changed = true);
                }
                Err(e) => fail(&wf, &image, e),
            });
        })
    }

    fn umount_step(&self) -> Step<MountEnv> {
        let run = self.clone();
        Step::new("umount", move |wf: &Workflow<MountEnv>, env: &mut MountEnv| {
            let image = env.image.clone();
            let mounter = run.clone();
            let wf = wf.clone();
            run.locked(BlockingRequest::Umount {
                target: env.target.clone(),
            })
            .then(move |result| match result {
                Ok(_) => {
                    info!("Unmounted {}", image);
                    mounter.inner.mounted.borrow_mut().remove(&image);
                    wf.next_with(|env| env.changed = true);
                }
                Err(e) => fail(&wf, &image, e),
            });
        })
    }

    /// Unmount every mounted image whatever its users, fanning out one
    /// branch per image.
    pub fn umount_all(&self) -> Workflow<UmountAllEnv> {
        let images: Vec<String> = self.inner.mounted.borrow().keys().cloned().collect();
        let this = self.clone();
        let wf = Workflow::new(
            "umount all",
            vec![Step::new("fan_out", move |wf: &Workflow<UmountAllEnv>, env: &mut UmountAllEnv| {
                let branches = env
                    .images
                    .iter()
                    .map(|image| this.umount_branch(image.clone()))
                    .collect();
                wf.insert_parallel_steps(branches);
                wf.next();
            })],
            UmountAllEnv {
                images,
                ..UmountAllEnv::default()
            },
        );
        wf.run();
        wf
    }

    fn umount_branch(&self, image: String) -> Step<UmountAllEnv> {
        let this = self.clone();
        Step::new(format!("umount {}", image), move |branch: &Workflow<UmountAllEnv>, _: &mut UmountAllEnv| {
            let image = image.clone();
            let branch = branch.clone();
            let single = this.start(&image, Request::Umount { force: true });
            single.on_end(move |env| {
                let error = env.error.clone();
                branch.next_with(move |all| match error {
                    Some(e) => all.failed.push((image, e)),
                    None => all.unmounted.push(image),
                });
            });
        })
    }
}

fn fail(wf: &Workflow<MountEnv>, image: &str, e: ServerError) {
    warn!("{} failed for {}: {}", wf.name(), image, e);
    let message = e.to_string();
    wf.update_env(move |env| env.error = Some(message));
    wf.interrupt();
}

#[cfg(test)]
#[path = "mounter_tests.rs"]
mod tests;
