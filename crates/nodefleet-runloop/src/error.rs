//! Error types for the event loop.

use thiserror::Error;

/// Errors that can occur in the event loop.
#[derive(Debug, Error)]
pub enum RunLoopError {
    /// The loop was driven from inside one of its own callbacks.
    #[error("Event loop driven re-entrantly from a callback")]
    Reentrant,

    /// A source callback failed. Fatal to the owning process.
    #[error("Source {source_name} failed: {message}")]
    SourceError {
        source_name: String,
        message: String,
    },

    /// poll(2) failed with something other than EINTR.
    #[error("Poll failed: {0}")]
    Poll(#[from] nix::errno::Errno),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunLoopError {
    /// Build a source error from anything displayable.
    pub fn source_error(source_name: impl Into<String>, message: impl ToString) -> Self {
        RunLoopError::SourceError {
            source_name: source_name.into(),
            message: message.to_string(),
        }
    }
}

/// Result type for event loop operations.
pub type RunLoopResult<T> = Result<T, RunLoopError>;
