//! Coalescing restarts of an external service.
//!
//! Configuration changes bump `config_version`. One restart round runs the
//! restart command, marks the version it started from as serviced, waits
//! out the cool-down, then checks whether the configuration moved again.
//! A burst of bumps therefore costs at most two restarts. A failed restart
//! leaves the serviced version where it was, so the round after the
//! cool-down tries again and waiters only hear about versions that took.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use nodefleet_runloop::{EventLoop, TimerHandle};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::blocking::{BlockingClient, BlockingRequest, CommandOutput};
use crate::error::ServerResult;

type VersionCallback = Box<dyn FnOnce(u64)>;

struct RestarterInner {
    ev: EventLoop,
    name: String,
    command: Vec<String>,
    cooldown: Duration,
    blocking: Rc<dyn BlockingClient>,
    config_version: Cell<u64>,
    service_version: Cell<u64>,
    active: Cell<bool>,
    restarts: Cell<u64>,
    failures: Cell<u64>,
    waiters: RefCell<BTreeMap<u64, Vec<VersionCallback>>>,
    cooldown_timer: RefCell<Option<TimerHandle>>,
}

/// Restarter counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestarterStats {
    pub name: String,
    pub config_version: u64,
    pub service_version: u64,
    pub restarts: u64,
    pub failures: u64,
    pub active: bool,
}

/// Restarts one service, coalescing bursts of configuration changes.
#[derive(Clone)]
pub struct ServiceRestarter {
    inner: Rc<RestarterInner>,
}

impl ServiceRestarter {
    pub fn new(
        ev: &EventLoop,
        name: impl Into<String>,
        command: Vec<String>,
        cooldown: Duration,
        blocking: Rc<dyn BlockingClient>,
    ) -> Self {
        Self {
            inner: Rc::new(RestarterInner {
                ev: ev.clone(),
                name: name.into(),
                command,
                cooldown,
                blocking,
                config_version: Cell::new(0),
                service_version: Cell::new(0),
                active: Cell::new(false),
                restarts: Cell::new(0),
                failures: Cell::new(0),
                waiters: RefCell::new(BTreeMap::new()),
                cooldown_timer: RefCell::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config_version(&self) -> u64 {
        self.inner.config_version.get()
    }

    pub fn service_version(&self) -> u64 {
        self.inner.service_version.get()
    }

    /// Check if the service runs the latest configuration.
    pub fn is_current(&self) -> bool {
        self.service_version() >= self.config_version()
    }

    /// Check if a restart or cool-down is in progress.
    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }

    pub fn stats(&self) -> RestarterStats {
        RestarterStats {
            name: self.inner.name.clone(),
            config_version: self.config_version(),
            service_version: self.service_version(),
            restarts: self.inner.restarts.get(),
            failures: self.inner.failures.get(),
            active: self.is_active(),
        }
    }

    /// Record a configuration change; returns the new version.
    pub fn bump(&self) -> u64 {
        let version = self.next_version();
        self.kick();
        version
    }

    /// Record a configuration change and call `callback` once the service
    /// runs it.
    pub fn bump_then<F>(&self, callback: F) -> u64
    where
        F: FnOnce(u64) + 'static,
    {
        let version = self.next_version();
        self.wait_for(version, callback);
        self.kick();
        version
    }

    /// Call `callback` once `version` is serviced; immediately if it is.
    pub fn wait_for<F>(&self, version: u64, callback: F)
    where
        F: FnOnce(u64) + 'static,
    {
        let serviced = self.service_version();
        if serviced >= version {
            callback(serviced);
            return;
        }
        self.inner
            .waiters
            .borrow_mut()
            .entry(version)
            .or_default()
            .push(Box::new(callback));
    }

    /// Cancel the cool-down and drop pending callbacks.
    pub fn shutdown(&self) {
        if let Some(timer) = self.inner.cooldown_timer.borrow_mut().take() {
            timer.cancel();
        }
        let dropped: usize = self.inner.waiters.borrow_mut().values().map(Vec::len).sum();
        self.inner.waiters.borrow_mut().clear();
        self.inner.active.set(false);
        if dropped > 0 {
            warn!("{}: shut down with {} callbacks waiting", self.inner.name, dropped);
        }
    }

    fn next_version(&self) -> u64 {
        let version = self.config_version() + 1;
        self.inner.config_version.set(version);
        debug!("{}: config version {}", self.inner.name, version);
        version
    }

    fn kick(&self) {
        if self.is_active() {
            return;
        }
        self.round();
    }

    fn round(&self) {
        self.inner.cooldown_timer.borrow_mut().take();
        if self.is_current() {
            self.inner.active.set(false);
            debug!("{}: up to date at version {}", self.inner.name, self.service_version());
            return;
        }
        self.inner.active.set(true);
        let target = self.config_version();
        info!(
            "{}: restarting (config {}, service {})",
            self.inner.name,
            target,
            self.service_version()
        );
        let this = self.clone();
        self.inner
            .blocking
            .run(BlockingRequest::command(&self.inner.command))
            .then(move |result| this.restarted(target, result));
    }

    fn restarted(&self, target: u64, result: ServerResult<CommandOutput>) {
        let inner = &self.inner;
        let failure = match result {
            Ok(output) if output.success() => None,
            Ok(output) => Some(format!("exited with {}: {}", output.status, output.stderr.trim_end())),
            Err(e) => Some(e.to_string()),
        };
        match failure {
            None => {
                inner.restarts.set(inner.restarts.get() + 1);
                inner.service_version.set(target);
                self.notify(target);
            }
            // The service version stays put; the next round retries.
            Some(reason) => {
                inner.failures.set(inner.failures.get() + 1);
                warn!(
                    "{}: restart for version {} failed, retrying in {:?}: {}",
                    inner.name, target, inner.cooldown, reason
                );
            }
        }
        if !inner.active.get() {
            return;
        }

        let this = self.clone();
        let timer = inner.ev.plan_after(inner.cooldown, move |_| this.round());
        *inner.cooldown_timer.borrow_mut() = Some(timer);
    }

    /// Run the callbacks waiting for `serviced` or an earlier version.
    fn notify(&self, serviced: u64) {
        let ready = {
            let mut waiters = self.inner.waiters.borrow_mut();
            let later = waiters.split_off(&(serviced + 1));
            std::mem::replace(&mut *waiters, later)
        };
        for callback in ready.into_values().flatten() {
            callback(serviced);
        }
    }
}

impl std::fmt::Debug for ServiceRestarter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRestarter")
            .field("name", &self.inner.name)
            .field("config_version", &self.config_version())
            .field("service_version", &self.service_version())
            .finish()
    }
}

#[cfg(test)]
#[path = "restarter_tests.rs"]
mod tests;
