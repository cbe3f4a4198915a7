//! Supervisor for the process group.
//!
//! The manager spawns every registered process as a child running
//! `<program> <args..> process <name>`, wires the declared links as Unix
//! socket pairs inherited by the two ends, and watches the children from
//! its own event loop. Links only exist between children started together,
//! so when one child dies the whole group is stopped and started again,
//! subject to the restart budget.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::rc::Rc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nodefleet_config::DaemonConfig;
use nodefleet_runloop::{EventLoop, TimerHandle};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::DaemonError;
use crate::process::{ChannelMap, CHANNELS_ENV};
use crate::signal::{send_signal_to_pid, DaemonSignal, SignalHandler};

/// How often children are checked for exit.
const REAP_INTERVAL: Duration = Duration::from_millis(200);

/// How often a stopping child is polled before the deadline.
const STOP_POLL: Duration = Duration::from_millis(20);

// ============================================================================
// Launcher
// ============================================================================

/// Command line used to start a child.
#[derive(Debug, Clone)]
pub struct Launcher {
    program: PathBuf,
    args: Vec<String>,
}

impl Launcher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-run the current executable.
    pub fn current_exe() -> Result<Self, DaemonError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Append a fixed argument placed before `process <name>`.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn command(&self, name: &str) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg("process").arg(name);
        command
    }
}

// ============================================================================
// Restart tracking
// ============================================================================

/// Counts restarts inside a sliding window.
#[derive(Debug)]
pub struct RestartTracker {
    restarts: VecDeque<Instant>,
    max_restarts: u32,
    window: Duration,
}

impl RestartTracker {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            restarts: VecDeque::new(),
            max_restarts,
            window,
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(config.max_restarts, config.restart_window())
    }

    /// Record a restart at `now`; fails once the budget is used up.
    pub fn record_at(&mut self, now: Instant) -> Result<u32, DaemonError> {
        while let Some(front) = self.restarts.front() {
            if now.duration_since(*front) > self.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.push_back(now);

        if self.count() > self.max_restarts {
            return Err(DaemonError::MaxRestartsExceeded {
                max: self.max_restarts,
                window: self.window,
            });
        }
        Ok(self.count())
    }

    pub fn record(&mut self) -> Result<u32, DaemonError> {
        self.record_at(Instant::now())
    }

    /// Restarts inside the current window.
    pub fn count(&self) -> u32 {
        self.restarts.len() as u32
    }
}

// ============================================================================
// Manager
// ============================================================================

/// One process of the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub level: u8,
}

/// Lifecycle of the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Idle,
    Running,
    Restarting,
    Stopping,
    Stopped,
    Failed,
}

/// Snapshot of one child.
#[derive(Debug, Clone, Serialize)]
pub struct ChildStatus {
    pub name: String,
    pub level: u8,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

struct RunningChild {
    spec: ProcessSpec,
    child: Child,
    started_at: DateTime<Utc>,
}

struct ManagerInner {
    config: DaemonConfig,
    launcher: Launcher,
    specs: RefCell<Vec<ProcessSpec>>,
    links: RefCell<Vec<(String, String)>>,
    children: RefCell<Vec<RunningChild>>,
    state: Cell<ManagerState>,
    tracker: RefCell<RestartTracker>,
    reaper: RefCell<Option<TimerHandle>>,
    pending_restart: RefCell<Option<TimerHandle>>,
    generation: Cell<u64>,
    failure: RefCell<Option<DaemonError>>,
}

/// Starts, watches and stops the process group.
///
/// Clones share the group.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Rc<ManagerInner>,
}

impl ProcessManager {
    pub fn new(config: DaemonConfig, launcher: Launcher) -> Self {
        let tracker = RestartTracker::from_config(&config);
        Self {
            inner: Rc::new(ManagerInner {
                config,
                launcher,
                specs: RefCell::new(Vec::new()),
                links: RefCell::new(Vec::new()),
                children: RefCell::new(Vec::new()),
                state: Cell::new(ManagerState::Idle),
                tracker: RefCell::new(tracker),
                reaper: RefCell::new(None),
                pending_restart: RefCell::new(None),
                generation: Cell::new(0),
                failure: RefCell::new(None),
            }),
        }
    }

    /// Add a process to the group.
    pub fn with_process(self, name: impl Into<String>, level: u8) -> Self {
        self.inner.specs.borrow_mut().push(ProcessSpec {
            name: name.into(),
            level,
        });
        self
    }

    /// Connect two processes with a bidirectional channel.
    pub fn with_link(self, a: impl Into<String>, b: impl Into<String>) -> Self {
        self.inner.links.borrow_mut().push((a.into(), b.into()));
        self
    }

    pub fn state(&self) -> ManagerState {
        self.inner.state.get()
    }

    /// Number of times the group has been started.
    pub fn generation(&self) -> u64 {
        self.inner.generation.get()
    }

    /// Restarts counted in the current window.
    pub fn restart_count(&self) -> u32 {
        self.inner.tracker.borrow().count()
    }

    /// Why the group gave up, if it did.
    pub fn last_error(&self) -> Option<String> {
        self.inner.failure.borrow().as_ref().map(|e| e.to_string())
    }

    pub fn children(&self) -> Vec<ChildStatus> {
        self.inner
            .children
            .borrow()
            .iter()
            .map(|c| ChildStatus {
                name: c.spec.name.clone(),
                level: c.spec.level,
                pid: c.child.id(),
                started_at: c.started_at,
            })
            .collect()
    }

    /// Processes in start order: by level, then registration order.
    pub fn start_order(&self) -> Vec<ProcessSpec> {
        let mut specs = self.inner.specs.borrow().clone();
        specs.sort_by_key(|s| s.level);
        specs
    }

    /// Spawn the whole group.
    pub fn start(&self) -> Result<(), DaemonError> {
        if !self.inner.children.borrow().is_empty() {
            warn!("Process group already started");
            return Ok(());
        }
        let order = self.start_order();
        let (mut maps, streams) = self.wire_links(&order)?;

        for spec in &order {
            let channels = maps.remove(&spec.name).unwrap_or_default();
            match self.spawn_child(spec, &channels) {
                Ok(child) => self.inner.children.borrow_mut().push(child),
                Err(e) => {
                    error!("Failed to start {}: {}", spec.name, e);
                    self.terminate_children();
                    return Err(e);
                }
            }
        }
        // Children hold their own copies now.
        drop(streams);

        self.inner.generation.set(self.inner.generation.get() + 1);
        self.inner.state.set(ManagerState::Running);
        info!(
            "Process group started (generation {}, {} processes)",
            self.generation(),
            order.len()
        );
        Ok(())
    }

    fn wire_links(
        &self,
        order: &[ProcessSpec],
    ) -> Result<(BTreeMap<String, ChannelMap>, Vec<UnixStream>), DaemonError> {
        let mut maps: BTreeMap<String, ChannelMap> = BTreeMap::new();
        let mut streams = Vec::new();
        for (a, b) in self.inner.links.borrow().iter() {
            for end in [a, b] {
                if !order.iter().any(|s| &s.name == end) {
                    return Err(DaemonError::UnknownProcess(end.clone()));
                }
            }
            let (left, right) = UnixStream::pair()?;
            maps.entry(a.clone()).or_default().insert(b.clone(), left.as_raw_fd());
            maps.entry(b.clone()).or_default().insert(a.clone(), right.as_raw_fd());
            streams.push(left);
            streams.push(right);
        }
        Ok((maps, streams))
    }

    fn spawn_child(&self, spec: &ProcessSpec, channels: &ChannelMap) -> Result<RunningChild, DaemonError> {
        let mut command = self.inner.launcher.command(&spec.name);
        command.env(CHANNELS_ENV, channels.encode());
        let fds = channels.fds();
        // SAFETY: only async-signal-safe fcntl calls run between fork and exec.
        unsafe {
            command.pre_exec(move || inherit_fds(&fds));
        }

        let child = command.spawn().map_err(|e| DaemonError::Spawn {
            name: spec.name.clone(),
            reason: e.to_string(),
        })?;
        debug!("Started {} (pid {}, channels '{}')", spec.name, child.id(), channels.encode());
        Ok(RunningChild {
            spec: spec.clone(),
            child,
            started_at: Utc::now(),
        })
    }

    /// Watch the children from `ev`.
    pub fn attach(&self, ev: &EventLoop) {
        if let Some(old) = self.inner.reaper.borrow_mut().take() {
            old.cancel();
        }
        let manager = self.clone();
        let handle = ev.plan_repeating(REAP_INTERVAL, move |ev| manager.reap(ev));
        *self.inner.reaper.borrow_mut() = Some(handle);
    }

    /// Check for exited children and react.
    pub fn reap(&self, ev: &EventLoop) {
        if self.state() != ManagerState::Running {
            return;
        }
        let exited = {
            let mut children = self.inner.children.borrow_mut();
            children.iter_mut().find_map(|c| match c.child.try_wait() {
                Ok(Some(status)) => Some((c.spec.name.clone(), status)),
                Ok(None) => None,
                Err(e) => {
                    warn!("Failed to poll {}: {}", c.spec.name, e);
                    None
                }
            })
        };
        if let Some((name, status)) = exited {
            self.on_child_exit(ev, &name, status);
        }
    }

    fn on_child_exit(&self, ev: &EventLoop, name: &str, status: ExitStatus) {
        warn!("Process {} exited ({}), stopping the group", name, status);
        self.inner.state.set(ManagerState::Restarting);
        self.terminate_children();

        if !self.inner.config.auto_restart {
            self.fail(
                ev,
                DaemonError::ProcessExited {
                    name: name.to_string(),
                    status: status.to_string(),
                },
            );
            return;
        }

        let recorded = self.inner.tracker.borrow_mut().record();
        match recorded {
            Ok(count) => {
                info!("Restart {}/{} in current window", count, self.inner.config.max_restarts);
                let manager = self.clone();
                let handle = ev.plan_after(self.inner.config.restart_delay(), move |ev| {
                    manager.inner.pending_restart.borrow_mut().take();
                    if manager.state() != ManagerState::Restarting {
                        return;
                    }
                    if let Err(e) = manager.start() {
                        manager.fail(ev, e);
                    }
                });
                *self.inner.pending_restart.borrow_mut() = Some(handle);
            }
            Err(e) => self.fail(ev, e),
        }
    }

    fn fail(&self, ev: &EventLoop, e: DaemonError) {
        error!("Process group failed: {}", e);
        *self.inner.failure.borrow_mut() = Some(e);
        self.inner.state.set(ManagerState::Failed);
        self.detach();
        ev.stop();
    }

    fn detach(&self) {
        if let Some(reaper) = self.inner.reaper.borrow_mut().take() {
            reaper.cancel();
        }
        if let Some(restart) = self.inner.pending_restart.borrow_mut().take() {
            restart.cancel();
        }
    }

    /// Forward a feature reload to every child.
    pub fn reload(&self) {
        for status in self.children() {
            if let Err(e) = send_signal_to_pid(status.pid, DaemonSignal::Reload) {
                warn!("Reload of {} failed: {}", status.name, e);
            }
        }
    }

    /// Stop every child, highest level first, and stop watching.
    pub fn stop_all(&self) {
        if self.state() != ManagerState::Failed {
            self.inner.state.set(ManagerState::Stopping);
        }
        self.detach();
        self.terminate_children();
        if self.state() == ManagerState::Stopping {
            self.inner.state.set(ManagerState::Stopped);
        }
    }

    /// SIGTERM each child in reverse start order, SIGKILL after the
    /// shutdown timeout.
    fn terminate_children(&self) {
        let mut children = std::mem::take(&mut *self.inner.children.borrow_mut());
        children.sort_by_key(|c| std::cmp::Reverse(c.spec.level));
        let timeout = self.inner.config.shutdown_timeout();

        for mut running in children {
            let name = running.spec.name.clone();
            if let Ok(Some(status)) = running.child.try_wait() {
                debug!("{} already exited ({})", name, status);
                continue;
            }
            if let Err(e) = send_signal_to_pid(running.child.id(), DaemonSignal::Shutdown) {
                warn!("{}", e);
            }
            match wait_until(&mut running.child, Instant::now() + timeout) {
                Some(status) => debug!("{} stopped ({})", name, status),
                None => {
                    warn!("{} did not stop within {:?}, killing", name, timeout);
                    if let Err(e) = running.child.kill() {
                        warn!("Failed to kill {}: {}", name, e);
                    }
                    let _ = running.child.wait();
                }
            }
        }
    }

    /// Supervise until a shutdown signal or a terminal failure.
    pub fn run(&self, ev: &EventLoop) -> Result<(), DaemonError> {
        let manager = self.clone();
        let signals = SignalHandler::install(ev, move |ev, signal| match signal {
            DaemonSignal::Shutdown => {
                manager.stop_all();
                ev.stop();
            }
            DaemonSignal::Reload => manager.reload(),
        })?;

        self.attach(ev);
        self.start()?;
        let result = ev.run();
        self.stop_all();
        drop(signals);
        result?;

        match self.inner.failure.borrow_mut().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for running in self.children.get_mut().iter_mut() {
            let _ = running.child.kill();
            let _ = running.child.wait();
        }
    }
}

fn wait_until(child: &mut Child, deadline: Instant) -> Option<ExitStatus> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => std::thread::sleep(STOP_POLL),
            Ok(None) => return None,
            Err(_) => return None,
        }
    }
}

/// Clear close-on-exec on the descriptors a child inherits.
fn inherit_fds(fds: &[RawFd]) -> std::io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    for fd in fds {
        fcntl(*fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
