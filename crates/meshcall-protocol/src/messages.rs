use serde::{Deserialize, Serialize};

use crate::error::MessageError;

/// Presence announced in a `status_change` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Offline,
}

/// Signaling messages exchanged inside the encrypted envelope.
///
/// Serialized as a JSON object whose `action` field names the variant.
/// Unknown fields are ignored so newer peers can add data without breaking
/// older ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Presence probe.
    Ping,

    /// Reply to `Ping`.
    Pong,

    /// Sender went online/offline (sent on shutdown).
    StatusChange { status: PeerStatus },

    /// Call request carrying the caller's session offer.
    Call { offer: String },

    /// Callee received the offer and is alerting the user.
    Ringing,

    /// Callee accepted; carries the session answer.
    Connected { answer: String },

    /// Call rejected, cancelled or timed out on the sending side.
    Dismissed,

    /// Connectivity candidate for the media session.
    Candidate { candidate: String },

    /// Established call ended by the sender.
    Hangup,
}

impl SignalMessage {
    /// Parse a decrypted UTF-8 payload.
    pub fn decode(json: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to the JSON text that gets encrypted.
    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of the variant, for logging.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::StatusChange { .. } => "status_change",
            Self::Call { .. } => "call",
            Self::Ringing => "ringing",
            Self::Connected { .. } => "connected",
            Self::Dismissed => "dismissed",
            Self::Candidate { .. } => "candidate",
            Self::Hangup => "hangup",
        }
    }
}
