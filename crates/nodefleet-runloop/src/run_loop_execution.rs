//! Event loop execution (`run`, `run_until` and the single pass).

use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, trace};

use crate::error::{RunLoopError, RunLoopResult};
use crate::run_loop::{EventLoop, RunOutcome};
use crate::source::{EventSource, SourceId, SourceStatus};

/// A source as seen by one poll.
struct Polled {
    id: SourceId,
    fd: RawFd,
    buffered: bool,
    wants_write: bool,
}

/// What a source is ready for in this pass.
struct Readiness {
    id: SourceId,
    readable: bool,
    writable: bool,
}

/// Flags meaning "the callback has something to look at".
fn is_ready(flags: PollFlags) -> bool {
    flags.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
}

/// Convert a wait into a poll timeout, rounding up to whole milliseconds.
fn poll_timeout(wait: Option<Duration>) -> PollTimeout {
    match wait {
        None => PollTimeout::NONE,
        Some(wait) => {
            let millis = wait.as_micros().div_ceil(1000);
            PollTimeout::from(u16::try_from(millis).unwrap_or(u16::MAX))
        }
    }
}

/// Clears the dispatching flag even if the callback unwinds.
struct DispatchGuard<'a> {
    ev: &'a EventLoop,
}

impl<'a> DispatchGuard<'a> {
    fn enter(ev: &'a EventLoop) -> Self {
        ev.inner.dispatching.set(true);
        Self { ev }
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.ev.inner.dispatching.set(false);
    }
}

impl EventLoop {
    /// Run until no sources and no timed events remain, or until stopped.
    pub fn run(&self) -> RunLoopResult<()> {
        let outcome = self.run_until(|| false)?;
        debug!("{}: run finished ({:?})", self.name(), outcome);
        Ok(())
    }

    /// Run passes until `predicate` returns true.
    ///
    /// The predicate is checked before every pass. Driving the loop from
    /// inside one of its own callbacks is rejected.
    pub fn run_until<P>(&self, mut predicate: P) -> RunLoopResult<RunOutcome>
    where
        P: FnMut() -> bool,
    {
        if self.is_dispatching() {
            error!("{}: run_until called from inside a callback", self.name());
            return Err(RunLoopError::Reentrant);
        }

        self.inner.metrics.mark_start();
        loop {
            if predicate() {
                return Ok(RunOutcome::Satisfied);
            }
            if self.inner.stop_requested.replace(false) {
                return Ok(RunOutcome::Stopped);
            }
            if self.is_idle() {
                return Ok(RunOutcome::Exhausted);
            }
            self.run_once()?;
        }
    }

    /// Run a single poll/dispatch pass.
    pub fn run_once(&self) -> RunLoopResult<()> {
        if self.is_dispatching() {
            return Err(RunLoopError::Reentrant);
        }
        self.inner.metrics.record_iteration();

        let ready = self.wait_ready()?;

        let process_start = Instant::now();
        for readiness in ready {
            self.dispatch(readiness)?;
        }
        self.fire_timers();
        self.inner
            .metrics
            .record_process_time(process_start.elapsed().as_micros() as u64);
        Ok(())
    }

    /// Poll every source and return the ones with an event to deliver.
    fn wait_ready(&self) -> RunLoopResult<Vec<Readiness>> {
        let mut polled: Vec<Polled> = Vec::new();
        let mut any_buffered = false;
        {
            let sources = self.inner.sources.borrow();
            for (id, entry) in sources.iter() {
                let source = entry.source.borrow();
                let buffered = source.has_buffered();
                any_buffered |= buffered;
                polled.push(Polled {
                    id: *id,
                    fd: source.raw_fd(),
                    buffered,
                    wants_write: source.wants_write(),
                });
            }
        }

        let wait = if any_buffered {
            Some(Duration::ZERO)
        } else {
            self.inner
                .timers
                .borrow_mut()
                .next_due()
                .map(|due| due.saturating_duration_since(Instant::now()))
        };
        trace!("{}: polling {} sources, wait {:?}", self.name(), polled.len(), wait);

        let mut fds: Vec<PollFd<'_>> = polled
            .iter()
            .map(|p| {
                // SAFETY: a registered source keeps its descriptor open until
                // it is removed, and nothing is removed while `fds` is alive.
                let fd = unsafe { BorrowedFd::borrow_raw(p.fd) };
                let mut flags = PollFlags::POLLIN;
                if p.wants_write {
                    flags |= PollFlags::POLLOUT;
                }
                PollFd::new(fd, flags)
            })
            .collect();

        let wait_start = Instant::now();
        let result = poll(&mut fds, poll_timeout(wait));
        let waited = wait_start.elapsed().as_micros() as u64;

        let revents: Vec<PollFlags> = match result {
            Ok(n) => {
                self.inner.metrics.record_wait(waited, n > 0);
                fds.iter()
                    .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
                    .collect()
            }
            // A signal interrupted the wait; only buffered events are delivered.
            Err(Errno::EINTR) => {
                self.inner.metrics.record_wait(waited, false);
                vec![PollFlags::empty(); polled.len()]
            }
            Err(e) => return Err(RunLoopError::Poll(e)),
        };

        let ready = polled
            .iter()
            .zip(revents)
            .filter_map(|(p, flags)| {
                let readable = p.buffered || is_ready(flags);
                let writable = p.wants_write && flags.contains(PollFlags::POLLOUT);
                (readable || writable).then_some(Readiness {
                    id: p.id,
                    readable,
                    writable,
                })
            })
            .collect();
        Ok(ready)
    }

    /// Deliver one event to a source.
    fn dispatch(&self, readiness: Readiness) -> RunLoopResult<()> {
        let id = readiness.id;
        if readiness.writable {
            let status = self.dispatch_one(id, |source, ev| source.on_writable(ev))?;
            if status == Some(SourceStatus::Remove) {
                return Ok(());
            }
        }
        if readiness.readable {
            self.dispatch_one(id, |source, ev| source.on_ready(ev))?;
        }
        Ok(())
    }

    fn dispatch_one<F>(&self, id: SourceId, callback: F) -> RunLoopResult<Option<SourceStatus>>
    where
        F: FnOnce(&mut dyn EventSource, &EventLoop) -> RunLoopResult<SourceStatus>,
    {
        // An earlier callback of this pass may have removed the source.
        let Some((name, source)) = self
            .inner
            .sources
            .borrow()
            .get(&id)
            .map(|entry| (entry.name.clone(), entry.source.clone()))
        else {
            return Ok(None);
        };

        self.inner.metrics.record_dispatch();
        let status = {
            let _guard = DispatchGuard::enter(self);
            let mut source = source.borrow_mut();
            callback(&mut *source, self)
        };
        self.close_pending();

        match status {
            Ok(SourceStatus::Keep) => Ok(Some(SourceStatus::Keep)),
            Ok(SourceStatus::Remove) => {
                debug!("{}: source {} asked to be removed", self.name(), name);
                self.remove(id);
                Ok(Some(SourceStatus::Remove))
            }
            Err(e) => {
                error!("{}: source {} failed: {}", self.name(), name, e);
                Err(e)
            }
        }
    }

    /// Fire every timed event that came due, oldest first.
    fn fire_timers(&self) {
        let due = self.inner.timers.borrow_mut().drain_due(Instant::now());
        for mut event in due {
            // An earlier callback of this pass may have cancelled it.
            if !event.is_valid() {
                continue;
            }
            self.inner.metrics.record_timer();
            let again = {
                let _guard = DispatchGuard::enter(self);
                event.fire(self)
            };
            if again {
                self.inner.timers.borrow_mut().reschedule(event);
            }
        }
        self.close_pending();
    }

    /// Close sources that removed themselves during their own callback.
    fn close_pending(&self) {
        let closing: Vec<_> = self.inner.closing.borrow_mut().drain(..).collect();
        for source in closing {
            source.borrow_mut().close();
        }
    }
}
