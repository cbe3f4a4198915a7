//! Event source definitions.
//!
//! An event source is anything exposing a pollable file descriptor. The loop
//! polls the descriptor and, when it becomes readable, hands control to the
//! source for exactly one event. Sources with queued output are also polled
//! for writability.

use std::fmt;
use std::os::fd::RawFd;

use crate::error::RunLoopResult;
use crate::run_loop::EventLoop;

/// Identifier of a source registered with an [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub(crate) u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src-{}", self.0)
    }
}

/// What the loop should do with a source after its callback returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    /// Keep polling the source.
    Keep,
    /// Unregister the source and call its [`EventSource::close`].
    Remove,
}

/// A pollable event source.
///
/// Callbacks run on the loop thread, one at a time. A callback must handle a
/// single event and return; looping inside a callback until the descriptor is
/// drained would starve the other sources.
pub trait EventSource {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Descriptor polled for readability.
    ///
    /// Must stay open and unchanged while the source is registered.
    fn raw_fd(&self) -> RawFd;

    /// Handle one ready event.
    fn on_ready(&mut self, ev: &EventLoop) -> RunLoopResult<SourceStatus>;

    /// Whether the source already holds a decoded event that has not been
    /// delivered yet. The loop will not block while this is true.
    fn has_buffered(&self) -> bool {
        false
    }

    /// Whether the source has queued output. The descriptor is then also
    /// polled for writability.
    fn wants_write(&self) -> bool {
        false
    }

    /// Handle writability. Only called while [`EventSource::wants_write`]
    /// returns true.
    fn on_writable(&mut self, _ev: &EventLoop) -> RunLoopResult<SourceStatus> {
        Ok(SourceStatus::Keep)
    }

    /// Release resources owned by the source. Called once, after removal.
    fn close(&mut self) {}
}
