use thiserror::Error;

use meshcall_crypto::CryptoError;
use meshcall_protocol::{MessageError, TransportError};

use crate::call::CallState;

/// Failure to open a socket to a contact.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("contact has no addresses")]
    NoAddress,

    #[error("no route or interface for any candidate address")]
    NetworkUnreachable,

    #[error("contact unreachable after {attempts} connection attempts")]
    Unreachable { attempts: usize },
}

/// A well-formed message that does not fit the conversation.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),

    #[error("message was signed by a different identity than expected")]
    IdentityMismatch,

    #[error("illegal call transition {from:?} -> {to:?}")]
    IllegalTransition { from: CallState, to: CallState },

    #[error("media engine error: {0}")]
    Media(String),

    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Failure to load or store the encrypted database.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("corrupt database JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid stored identity: {0}")]
    InvalidIdentity(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("unknown contact: {0}")]
    UnknownContact(String),

    #[error("contact name already in use: {0}")]
    DuplicateName(String),

    #[error("contact with this public key already exists: {0}")]
    DuplicateKey(String),

    #[error("invalid contact: {0}")]
    InvalidContact(String),

    #[error("node is shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<MessageError> for Error {
    fn from(e: MessageError) -> Self {
        Self::Protocol(ProtocolError::Message(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_error_display() {
        let e = ConnectError::Unreachable { attempts: 3 };
        assert!(e.to_string().contains('3'));
        assert_eq!(ConnectError::NoAddress.to_string(), "contact has no addresses");
    }

    #[test]
    fn wraps_layer_errors() {
        let e: Error = TransportError::Timeout.into();
        assert!(matches!(e, Error::Transport(TransportError::Timeout)));

        let e: Error = CryptoError::CannotDecrypt.into();
        assert_eq!(e.to_string(), "incorrect password or corrupted database");

        let e: Error = PersistenceError::Crypto(CryptoError::CannotDecrypt).into();
        assert!(matches!(e, Error::Persistence(_)));
    }

    #[test]
    fn message_error_becomes_protocol_error() {
        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let e: Error = MessageError::Json(json).into();
        assert!(matches!(e, Error::Protocol(ProtocolError::Message(_))));
    }
}
