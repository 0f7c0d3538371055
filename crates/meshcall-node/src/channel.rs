use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tracing::trace;

use meshcall_crypto::PublicKey;
use meshcall_protocol::{PacketReader, PacketWriter, SignalMessage};

use crate::error::{Error, ProtocolError};
use crate::identity::LocalIdentity;

/// Framed socket carrying signed-then-sealed signaling messages.
pub struct SignalChannel<S> {
    reader: PacketReader<ReadHalf<S>>,
    writer: PacketWriter<WriteHalf<S>>,
    identity: Arc<LocalIdentity>,
}

impl<S: AsyncRead + AsyncWrite> SignalChannel<S> {
    pub fn new(stream: S, identity: Arc<LocalIdentity>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: PacketReader::new(read_half),
            writer: PacketWriter::new(write_half),
            identity,
        }
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.reader.set_timeout(timeout);
    }

    pub async fn send(&mut self, message: &SignalMessage, to: &PublicKey) -> Result<(), Error> {
        let json = message.encode()?;
        let ciphertext = self.identity.encrypt(&json, to)?;
        self.writer.write_message(&ciphertext).await?;
        trace!(action = message.action(), "sent");
        Ok(())
    }

    /// Next message and the identity that signed it.
    pub async fn recv(&mut self) -> Result<(SignalMessage, PublicKey), Error> {
        let frame = self.reader.read_message().await?;
        let (json, sender) = self.identity.decrypt(&frame)?;
        let message = SignalMessage::decode(&json)?;
        trace!(action = message.action(), "received");
        Ok((message, sender))
    }

    /// Like [`recv`](Self::recv), but only accepts messages signed by `expected`.
    pub async fn recv_from(&mut self, expected: &PublicKey) -> Result<SignalMessage, Error> {
        let (message, sender) = self.recv().await?;
        if &sender != expected {
            return Err(ProtocolError::IdentityMismatch.into());
        }
        Ok(message)
    }

    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_identity;
    use meshcall_crypto::CryptoError;
    use meshcall_protocol::TransportError;

    #[tokio::test]
    async fn exchange_over_duplex() {
        let alice = Arc::new(test_identity());
        let bob = Arc::new(test_identity());
        let (a, b) = tokio::io::duplex(4096);
        let mut a = SignalChannel::new(a, alice.clone());
        let mut b = SignalChannel::new(b, bob.clone());

        a.send(&SignalMessage::Ping, &bob.public_key()).await.unwrap();
        let (msg, sender) = b.recv().await.unwrap();
        assert_eq!(msg, SignalMessage::Ping);
        assert_eq!(sender, alice.public_key());

        b.send(&SignalMessage::Pong, &alice.public_key()).await.unwrap();
        assert_eq!(
            a.recv_from(&bob.public_key()).await.unwrap(),
            SignalMessage::Pong
        );
    }

    #[tokio::test]
    async fn recv_from_rejects_other_signer() {
        let alice = Arc::new(test_identity());
        let bob = Arc::new(test_identity());
        let carol = test_identity();
        let (a, b) = tokio::io::duplex(4096);
        let mut a = SignalChannel::new(a, alice.clone());
        let mut b = SignalChannel::new(b, bob.clone());

        a.send(&SignalMessage::Ringing, &bob.public_key()).await.unwrap();
        assert!(matches!(
            b.recv_from(&carol.public_key()).await,
            Err(Error::Protocol(ProtocolError::IdentityMismatch))
        ));
    }

    #[tokio::test]
    async fn message_for_someone_else_fails_to_decrypt() {
        let alice = Arc::new(test_identity());
        let bob = Arc::new(test_identity());
        let carol = test_identity();
        let (a, b) = tokio::io::duplex(4096);
        let mut a = SignalChannel::new(a, alice);
        let mut b = SignalChannel::new(b, bob);

        a.send(&SignalMessage::Ping, &carol.public_key()).await.unwrap();
        assert!(matches!(
            b.recv().await,
            Err(Error::Crypto(CryptoError::OpenFailed))
        ));
    }

    #[tokio::test]
    async fn timeout_surfaces_as_transport_error() {
        let (a, _b) = tokio::io::duplex(64);
        let mut a = SignalChannel::new(a, Arc::new(test_identity()));
        a.set_timeout(Some(Duration::from_millis(30)));
        assert!(matches!(
            a.recv().await,
            Err(Error::Transport(TransportError::Timeout))
        ));
    }
}
