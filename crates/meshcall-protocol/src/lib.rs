//! MeshCall wire layer: length-framed transport and signaling messages.
//!
//! Knows nothing about keys or addresses. Every payload that crosses a
//! socket goes through [`codec::PacketWriter`] / [`codec::PacketReader`];
//! [`messages::SignalMessage`] is the JSON that travels inside the
//! encrypted envelope.

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{PacketReader, PacketWriter, MAX_MSG_SIZE};
pub use error::{MessageError, TransportError};
pub use messages::{PeerStatus, SignalMessage};
