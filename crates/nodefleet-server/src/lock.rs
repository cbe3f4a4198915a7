//! Advisory lock serializing mount and unmount commands.
//!
//! The lock is a `flock(2)` on a file, so it holds across processes and
//! across restarts of the same process. Waiting never blocks the loop: a
//! busy lock is retried from a repeating timed event until the deadline.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nodefleet_config::ImagesConfig;
use nodefleet_runloop::{EventLoop, Promise, TimerHandle};
use tracing::{debug, warn};

use crate::error::{ServerError, ServerResult};

/// Exclusive lock on a lock file.
#[derive(Debug, Clone)]
pub struct MountLock {
    path: PathBuf,
    retry: Duration,
    timeout: Duration,
}

/// Proof of holding the lock. Dropping it unlocks.
pub struct MountGuard {
    _lock: Flock<File>,
    path: PathBuf,
    since: Instant,
}

impl MountGuard {
    pub fn held_for(&self) -> Duration {
        self.since.elapsed()
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        debug!("Released {} after {:?}", self.path.display(), self.since.elapsed());
    }
}

impl std::fmt::Debug for MountGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountGuard").field("path", &self.path).finish()
    }
}

impl MountLock {
    pub fn new(path: impl Into<PathBuf>, retry: Duration, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            retry,
            timeout,
        }
    }

    pub fn from_config(config: &ImagesConfig) -> Self {
        Self::new(&config.lock_file, config.lock_retry(), config.lock_timeout())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_error(&self, reason: impl ToString) -> ServerError {
        ServerError::Lock {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    /// Take the lock if it is free.
    pub fn try_acquire(&self) -> ServerResult<Option<MountGuard>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.lock_error(e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.lock_error(e))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!("Acquired {}", self.path.display());
                Ok(Some(MountGuard {
                    _lock: lock,
                    path: self.path.clone(),
                    since: Instant::now(),
                }))
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(self.lock_error(errno)),
        }
    }

    /// Take the lock, retrying from the loop until the deadline.
    pub fn acquire(&self, ev: &EventLoop) -> Promise<ServerResult<MountGuard>> {
        match self.try_acquire() {
            Ok(Some(guard)) => return Promise::resolved(Ok(guard)),
            Ok(None) => {}
            Err(e) => return Promise::resolved(Err(e)),
        }

        debug!("{} busy, retrying every {:?}", self.path.display(), self.retry);
        let (resolver, promise) = Promise::pending(format!("lock {}", self.path.display()));
        let deadline = Instant::now() + self.timeout;
        let lock = self.clone();
        let timer: Rc<RefCell<Option<TimerHandle>>> = Rc::new(RefCell::new(None));
        let timer_in = timer.clone();

        let handle = ev.plan_repeating(self.retry, move |_| {
            let outcome = match lock.try_acquire() {
                Ok(Some(guard)) => Some(Ok(guard)),
                Ok(None) if Instant::now() >= deadline => {
                    warn!("Gave up on {} after {:?}", lock.path.display(), lock.timeout);
                    Some(Err(ServerError::LockTimeout {
                        path: lock.path.clone(),
                        waited: lock.timeout,
                    }))
                }
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            };
            if let Some(outcome) = outcome {
                if let Some(handle) = timer_in.borrow_mut().take() {
                    handle.cancel();
                }
                resolver.resolve(outcome);
            }
        });
        *timer.borrow_mut() = Some(handle);
        promise
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
