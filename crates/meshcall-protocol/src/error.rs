use thiserror::Error;

use crate::codec::MAX_MSG_SIZE;

/// Failure of the length-framed transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("stream closed by peer")]
    Closed,

    #[error("stream closed mid-frame: {buffered} bytes pending")]
    Truncated { buffered: usize },

    #[error("message too large: {0} bytes (max {MAX_MSG_SIZE})")]
    MessageTooLarge(usize),

    #[error("timed out waiting for message")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the frame itself was malformed, as opposed to the stream ending or stalling.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MessageTooLarge(_) | Self::Truncated { .. })
    }
}

/// Failure to parse or build a signaling message.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid signaling JSON: {0}")]
    Json(#[from] serde_json::Error),
}
