//! Scripted blocking client and in-loop database for unit tests.

use std::cell::RefCell;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nodefleet_config::{ImagesConfig, NodefleetConfig, ServicesConfig};
use nodefleet_rpc::{Connector, ConnectorOptions, LocalService};
use nodefleet_runloop::{EventLoop, Promise};
use nodefleet_workqueue::TaskFailure;

use crate::blocking::{BlockingClient, BlockingRequest, CommandOutput};
use crate::db::{DbClient, MemoryDb, DB_API};
use crate::error::{ServerError, ServerResult};
use crate::service::DbService;

type FailRule = Box<dyn Fn(&BlockingRequest) -> Option<String>>;

/// Completes every request after a fixed delay and records what ran when.
pub(crate) struct FakeBlocking {
    ev: EventLoop,
    delay: Duration,
    requests: RefCell<Vec<BlockingRequest>>,
    intervals: Rc<RefCell<Vec<(Instant, Instant)>>>,
    fail: RefCell<Option<FailRule>>,
}

impl FakeBlocking {
    pub(crate) fn new(ev: &EventLoop, delay: Duration) -> Rc<Self> {
        Rc::new(Self {
            ev: ev.clone(),
            delay,
            requests: RefCell::new(Vec::new()),
            intervals: Rc::new(RefCell::new(Vec::new())),
            fail: RefCell::new(None),
        })
    }

    /// Fail requests for which `rule` returns a message.
    pub(crate) fn fail_when<F>(&self, rule: F)
    where
        F: Fn(&BlockingRequest) -> Option<String> + 'static,
    {
        *self.fail.borrow_mut() = Some(Box::new(rule));
    }

    pub(crate) fn requests(&self) -> Vec<BlockingRequest> {
        self.requests.borrow().clone()
    }

    pub(crate) fn intervals(&self) -> Vec<(Instant, Instant)> {
        self.intervals.borrow().clone()
    }

    pub(crate) fn count<P: Fn(&BlockingRequest) -> bool>(&self, predicate: P) -> usize {
        self.requests.borrow().iter().filter(|r| predicate(r)).count()
    }
}

impl BlockingClient for FakeBlocking {
    fn run(&self, req: BlockingRequest) -> Promise<ServerResult<CommandOutput>> {
        let failure = self.fail.borrow().as_ref().and_then(|rule| rule(&req));
        self.requests.borrow_mut().push(req);
        let (resolver, promise) = Promise::pending("fake blocking");
        let started = Instant::now();
        let intervals = self.intervals.clone();
        self.ev.plan_after(self.delay, move |_| {
            intervals.borrow_mut().push((started, Instant::now()));
            let result = match failure.clone() {
                Some(message) => Err(ServerError::Task(TaskFailure::failed(message))),
                None => Ok(CommandOutput::default()),
            };
            resolver.resolve(result);
        });
        promise
    }
}

/// Drive `ev` until `predicate` holds, failing the test after five seconds.
pub(crate) fn run_until<P: FnMut() -> bool>(ev: &EventLoop, mut predicate: P) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let guard = ev.plan_after(Duration::from_secs(5), |_| {});
    ev.run_until(|| predicate() || Instant::now() >= deadline).unwrap();
    guard.cancel();
    assert!(predicate(), "condition not reached in time");
}

/// A database served over a socket pair inside `ev`.
pub(crate) struct LoopDb {
    pub(crate) client: DbClient,
    pub(crate) db: Rc<RefCell<MemoryDb>>,
    pub(crate) _server: Connector,
    pub(crate) _client: Connector,
}

pub(crate) fn loop_db(ev: &EventLoop) -> LoopDb {
    let (near, far) = UnixStream::pair().unwrap();
    let db = Rc::new(RefCell::new(MemoryDb::new()));
    let server = Connector::new(ev, far, ConnectorOptions::new("db-server")).unwrap();
    let shared = db.clone();
    server.configure(LocalService::new().register(move || DbService::new(shared.clone())));
    let client = Connector::new(ev, near, ConnectorOptions::new("to-db")).unwrap();
    let proxy = client.create_session(DB_API).unwrap();
    LoopDb {
        client: DbClient::new(proxy),
        db,
        _server: server,
        _client: client,
    }
}

/// Configuration keeping every path under `dir`, with short timings.
pub(crate) fn test_config(dir: &Path) -> NodefleetConfig {
    let mut config = NodefleetConfig::default();
    config.images = ImagesConfig {
        store_dir: dir.join("images"),
        mount_dir: dir.join("mnt"),
        lock_file: dir.join("images.lock"),
        lock_retry_ms: 5,
        lock_timeout_secs: 5,
        ..ImagesConfig::default()
    };
    config.services = ServicesConfig {
        exports_file: dir.join("exports"),
        nfs_restart_command: vec!["restart-nfs".to_string()],
        dhcp_restart_command: vec!["restart-dhcp".to_string()],
        restart_cooldown_secs: 0,
    };
    config.features.spec_file = dir.join("features.toml");
    config.daemon.pid_file = dir.join("nodefleet.pid");
    config.daemon.log_dir = dir.join("logs");
    config
}
