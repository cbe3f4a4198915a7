//! Cross-thread wakeup pipe.
//!
//! Other threads (the blocking worker, the signal forwarder) cannot touch the
//! loop directly. They write 8-byte tokens into one end of a socket pair; the
//! other end is registered with the loop as a source that hands each token
//! to a callback on the loop thread.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::RunLoopResult;
use crate::run_loop::EventLoop;
use crate::source::{EventSource, SourceStatus};

const TOKEN_LEN: usize = 8;

/// Callback invoked on the loop thread for every token.
pub type TokenHandler = Box<dyn FnMut(&EventLoop, u64) -> RunLoopResult<()>>;

/// Thread-safe writing end of a wakeup pipe.
#[derive(Clone)]
pub struct WakeupSender {
    name: Arc<str>,
    stream: Arc<Mutex<UnixStream>>,
}

impl WakeupSender {
    /// Post a token to the loop.
    pub fn notify(&self, token: u64) -> io::Result<()> {
        trace!("{}: posting token {}", self.name, token);
        self.stream.lock().write_all(&token.to_be_bytes())
    }

    /// Get the pipe name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for WakeupSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeupSender").field("name", &self.name).finish()
    }
}

/// Reading end of a wakeup pipe, registered with the loop.
pub struct WakeupSource {
    name: String,
    stream: UnixStream,
    partial: Vec<u8>,
    tokens: VecDeque<u64>,
    handler: TokenHandler,
    eof: bool,
}

impl WakeupSource {
    fn fill(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 512];
        match self.stream.read(&mut buf) {
            Ok(0) => {
                self.eof = true;
            }
            Ok(n) => {
                self.partial.extend_from_slice(&buf[..n]);
                let whole = self.partial.len() / TOKEN_LEN * TOKEN_LEN;
                for chunk in self.partial[..whole].chunks_exact(TOKEN_LEN) {
                    let mut raw = [0u8; TOKEN_LEN];
                    raw.copy_from_slice(chunk);
                    self.tokens.push_back(u64::from_be_bytes(raw));
                }
                self.partial.drain(..whole);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

impl EventSource for WakeupSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn on_ready(&mut self, ev: &EventLoop) -> RunLoopResult<SourceStatus> {
        if self.tokens.is_empty() {
            self.fill()?;
        }
        if let Some(token) = self.tokens.pop_front() {
            (self.handler)(ev, token)?;
            return Ok(SourceStatus::Keep);
        }
        if self.eof {
            debug!("{}: every sender is gone", self.name);
            return Ok(SourceStatus::Remove);
        }
        Ok(SourceStatus::Keep)
    }

    fn has_buffered(&self) -> bool {
        !self.tokens.is_empty()
    }
}

/// Create a wakeup pipe whose tokens are delivered to `handler`.
///
/// The source must be registered with the loop by the caller.
pub fn wakeup_pipe<F>(name: impl Into<String>, handler: F) -> RunLoopResult<(WakeupSender, WakeupSource)>
where
    F: FnMut(&EventLoop, u64) -> RunLoopResult<()> + 'static,
{
    let name = name.into();
    let (tx, rx) = UnixStream::pair()?;
    rx.set_nonblocking(true)?;

    let sender = WakeupSender {
        name: Arc::from(name.as_str()),
        stream: Arc::new(Mutex::new(tx)),
    };
    let source = WakeupSource {
        name,
        stream: rx,
        partial: Vec::with_capacity(TOKEN_LEN),
        tokens: VecDeque::new(),
        handler: Box::new(handler),
        eof: false,
    };
    Ok((sender, source))
}

#[cfg(test)]
#[path = "pipe_tests.rs"]
mod tests;
