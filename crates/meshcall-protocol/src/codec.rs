use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Maximum framed message size: 64 KiB.
pub const MAX_MSG_SIZE: u32 = 65_536;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode a payload into a length-prefixed byte buffer for TCP transmission.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() > MAX_MSG_SIZE as usize {
        return Err(TransportError::MessageTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Attempt to extract one complete length-prefixed frame from a byte buffer.
///
/// Returns `Ok(Some(payload))` if a complete message is available,
/// `Ok(None)` if more data is needed, or `Err` if the announced length is too large.
/// The length is checked before anything is allocated for the payload.
///
/// Advances the buffer past the consumed frame.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, TransportError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_MSG_SIZE as usize {
        warn!(length, max = MAX_MSG_SIZE, "rejecting oversized frame");
        return Err(TransportError::MessageTooLarge(length));
    }

    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length).to_vec();
    Ok(Some(payload))
}

/// Reads discrete length-prefixed messages from a byte stream.
pub struct PacketReader<R> {
    inner: R,
    buf: BytesMut,
    read_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
            read_timeout: None,
        }
    }

    /// Bound every `read_message` call by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Wait for the next complete message.
    ///
    /// Frames already buffered are returned first, so several messages arriving
    /// in one TCP segment come out in order.
    pub async fn read_message(&mut self) -> Result<Vec<u8>, TransportError> {
        match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.read_frame())
                .await
                .map_err(|_| {
                    debug!(?limit, "frame read timed out");
                    TransportError::Timeout
                })?,
            None => self.read_frame().await,
        }
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            if let Some(payload) = try_decode_frame(&mut self.buf)? {
                return Ok(payload);
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Err(TransportError::Closed);
                }
                debug!(buffered = self.buf.len(), "stream closed mid-frame");
                return Err(TransportError::Truncated {
                    buffered: self.buf.len(),
                });
            }
        }
    }
}

/// Writes discrete length-prefixed messages to a byte stream.
///
/// Each message goes out in a single `write_all`, and `&mut self` keeps one
/// writer per socket at a time.
pub struct PacketWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_message(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let frame = encode_frame(payload)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and shut down the write half.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_decoding() {
        let encoded = encode_frame(b"{\"action\":\"ping\"}").unwrap();

        let mut buf = BytesMut::new();

        // partial frame, nothing yet
        buf.extend_from_slice(&encoded[..3]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[3..7]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());

        // Complete data
        buf.extend_from_slice(&encoded[7..]);
        let payload = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(payload, b"{\"action\":\"ping\"}");

        // Buffer should be empty now
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_message_too_large() {
        let mut buf = BytesMut::new();
        let bad_len = (MAX_MSG_SIZE + 1).to_be_bytes();
        buf.extend_from_slice(&bad_len);
        buf.extend_from_slice(&[0u8; 100]);
        let result = try_decode_frame(&mut buf);
        assert!(matches!(result, Err(TransportError::MessageTooLarge(_))));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_MSG_SIZE as usize + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(TransportError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn frame_multiple_messages() {
        let enc1 = encode_frame(b"first").unwrap();
        let enc2 = encode_frame(b"second").unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&enc1);
        buf.extend_from_slice(&enc2);

        assert_eq!(try_decode_frame(&mut buf).unwrap().unwrap(), b"first");
        assert_eq!(try_decode_frame(&mut buf).unwrap().unwrap(), b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_payload_is_a_valid_frame() {
        let mut buf = BytesMut::from(&encode_frame(b"").unwrap()[..]);
        assert_eq!(try_decode_frame(&mut buf).unwrap().unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn reader_writer_in_order() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = PacketWriter::new(client);
        let mut reader = PacketReader::new(server);

        writer.write_message(b"one").await.unwrap();
        writer.write_message(b"two").await.unwrap();
        writer.write_message(&[7u8; 3000]).await.unwrap();

        assert_eq!(reader.read_message().await.unwrap(), b"one");
        assert_eq!(reader.read_message().await.unwrap(), b"two");
        assert_eq!(reader.read_message().await.unwrap(), vec![7u8; 3000]);
    }

    #[tokio::test]
    async fn reader_reports_clean_close() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = PacketReader::new(server);
        assert!(matches!(
            reader.read_message().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn reader_reports_truncated_frame() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(client);
        let mut reader = PacketReader::new(server);
        match reader.read_message().await {
            Err(e @ TransportError::Truncated { .. }) => assert!(e.is_malformed()),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reader_rejects_oversized_length() {
        let (mut client, server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_MSG_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        let mut reader = PacketReader::new(server);
        assert!(matches!(
            reader.read_message().await,
            Err(TransportError::MessageTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn reader_times_out() {
        let (_client, server) = tokio::io::duplex(64);
        let mut reader = PacketReader::new(server).with_timeout(Duration::from_millis(50));
        assert!(matches!(
            reader.read_message().await,
            Err(TransportError::Timeout)
        ));
    }
}
