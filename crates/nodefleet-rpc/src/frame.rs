//! Wire frames.
//!
//! Every frame is a 4-byte big-endian length followed by a JSON document.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RemoteError, RpcError, RpcResult};

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Session identifier, allocated by the side that opened the session.
pub type SessionId = u64;

/// Call identifier, unique per connector while outstanding.
pub type CallId = u64;

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Open a session against a named API.
    Open { session: SessionId, api: String },
    /// Invoke a method inside a session.
    Call {
        session: SessionId,
        call: CallId,
        method: String,
        #[serde(default)]
        args: Value,
    },
    /// Answer a call.
    Reply {
        session: SessionId,
        call: CallId,
        result: Result<Value, RemoteError>,
    },
    /// Close a session.
    Close { session: SessionId },
}

impl Frame {
    /// Short frame kind for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Open { .. } => "open",
            Frame::Call { .. } => "call",
            Frame::Reply { .. } => "reply",
            Frame::Close { .. } => "close",
        }
    }
}

/// Encode a frame with its length header.
pub fn encode_frame(frame: &Frame) -> RpcResult<Vec<u8>> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Incremental frame decoder over a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the channel.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn body_len(&self) -> Option<usize> {
        let header: [u8; HEADER_LEN] = self.buf.get(..HEADER_LEN)?.try_into().ok()?;
        Some(u32::from_be_bytes(header) as usize)
    }

    /// Check if a complete frame (or an oversized header) is buffered.
    pub fn has_frame(&self) -> bool {
        match self.body_len() {
            Some(len) if len > MAX_FRAME_LEN => true,
            Some(len) => self.buf.len() >= HEADER_LEN + len,
            None => false,
        }
    }

    /// Number of buffered bytes not yet decoded.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame, if any.
    pub fn next_frame(&mut self) -> RpcResult<Option<Frame>> {
        let Some(len) = self.body_len() else {
            return Ok(None);
        };
        if len > MAX_FRAME_LEN {
            return Err(RpcError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let frame = serde_json::from_slice(&self.buf[HEADER_LEN..HEADER_LEN + len]);
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some(frame?))
    }
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
