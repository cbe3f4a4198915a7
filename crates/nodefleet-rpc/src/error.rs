//! Error types for RPC connectors.

use std::time::Duration;

use nodefleet_runloop::RunLoopError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised by a remote handler, shipped back inside a reply frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// Machine readable category (`unknown_method`, `bad_args`, ...).
    pub kind: String,
    /// Human readable description.
    pub message: String,
    /// Remote-side context, when the handler captured one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl RemoteError {
    /// Create a new remote error.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: None,
        }
    }

    /// Attach remote-side context.
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// No service is registered under the requested API.
    pub fn unknown_api(api: &str) -> Self {
        Self::new("unknown_api", format!("no service registered for API '{}'", api))
    }

    /// The API has no such method.
    pub fn unknown_method(api: &str, method: &str) -> Self {
        Self::new("unknown_method", format!("API '{}' has no method '{}'", api, method))
    }

    /// Arguments did not match the method signature.
    pub fn bad_args(err: impl std::fmt::Display) -> Self {
        Self::new("bad_args", err.to_string())
    }

    /// A deferred reply was abandoned by its handler.
    pub fn reply_dropped(method: &str) -> Self {
        Self::new("reply_dropped", format!("reply to '{}' was dropped unanswered", method))
    }

    /// Generic handler failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", message)
    }

    /// Check the error kind.
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

/// Errors delivered to RPC callers.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The channel closed while the call was outstanding.
    #[error("Connector {0} disconnected")]
    Disconnected(String),

    /// The remote handler failed.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// No reply arrived in time.
    #[error("Call {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// Encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame exceeded the size limit.
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// The loop ran out of sources and timers while a synchronous call waited.
    #[error("Event loop exhausted before the reply arrived")]
    LoopExhausted,

    /// The loop was asked to stop while a synchronous call waited.
    #[error("Event loop stopped before the reply arrived")]
    Stopped,

    /// Driving the loop failed.
    #[error("Event loop error: {0}")]
    RunLoop(#[from] RunLoopError),
}

impl RpcError {
    /// Check if this is a disconnection.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, RpcError::Disconnected(_))
    }

    /// Check if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// Get the remote error, if the remote handler failed.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            RpcError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;
