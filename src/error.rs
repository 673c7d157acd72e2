//! Error types for lintwire.

use thiserror::Error;

/// Main error type for all lintwire operations.
#[derive(Debug, Error)]
pub enum LintwireError {
    /// I/O error on a pipe or child process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed frame: bad marker, bad length, undecodable body.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame header announced more bytes than the configured maximum.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// The engine answered a request with an `error` message.
    #[error("Engine error: {message}")]
    Engine { message: String },

    /// The sidecar answered a request with an error reply.
    #[error("Sidecar error ({method}): {message}")]
    Sidecar { method: String, message: String },

    /// The transport is gone (process exited, channel closed, bridge shut down).
    #[error("Transport terminated: {reason}")]
    Terminated { reason: String },

    /// A compact buffer offset points outside the buffer.
    #[error("Offset {offset}..{end} out of bounds for buffer of {len} bytes")]
    OutOfBounds { offset: usize, end: usize, len: usize },

    /// Decoded text is not valid UTF-8.
    #[error("Invalid UTF-8 in decoded text: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Base64 payload could not be decoded.
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl LintwireError {
    /// Shorthand for a terminated error with the given reason.
    pub fn terminated(reason: impl Into<String>) -> Self {
        LintwireError::Terminated {
            reason: reason.into(),
        }
    }

    /// True for failures of the transport itself.
    ///
    /// These are worth retrying on a freshly opened transport. Engine and
    /// sidecar errors are answers to the request and are not.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            LintwireError::Io(_)
                | LintwireError::Protocol(_)
                | LintwireError::FrameTooLarge { .. }
                | LintwireError::Terminated { .. }
        )
    }

    /// Rebuild an equivalent error for fan-out to many pending completions.
    ///
    /// `io::Error` and `serde_json::Error` are not `Clone`, so those collapse
    /// into `Protocol`/`Terminated` carrying the rendered message.
    pub(crate) fn replicate(&self) -> Self {
        match self {
            LintwireError::Protocol(msg) => LintwireError::Protocol(msg.clone()),
            LintwireError::FrameTooLarge { size, max } => LintwireError::FrameTooLarge {
                size: *size,
                max: *max,
            },
            LintwireError::Terminated { reason } => LintwireError::terminated(reason.clone()),
            LintwireError::Json(e) => LintwireError::Protocol(e.to_string()),
            other => LintwireError::terminated(other.to_string()),
        }
    }
}

/// Result type alias using LintwireError.
pub type Result<T> = std::result::Result<T, LintwireError>;
