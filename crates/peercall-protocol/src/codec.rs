use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::ProtocolError;

/// Capacity of the receive buffer. A frame (prefix + payload) must fit in it.
pub const MAX_BUFFER_SIZE: usize = 16_000;

/// Length of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest payload that can be framed: 15 996 bytes.
pub const MAX_PAYLOAD_SIZE: usize = MAX_BUFFER_SIZE - LENGTH_PREFIX_SIZE;

/// Prefix `payload` with its length as a 4-byte big-endian integer.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::MessageTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Write one framed message. Prefix and payload go out in a single `write_all`.
pub async fn write_message<W>(sink: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    sink.write_all(&frame).await?;
    sink.flush().await?;
    Ok(())
}

/// Attempt to extract one complete length-prefixed frame from a byte buffer.
///
/// Returns `Ok(Some(payload))` if a complete message is available,
/// `Ok(None)` if more data is needed, or `Err` if the declared length can
/// never fit in the receive buffer.
///
/// Advances the buffer past the consumed frame; trailing bytes stay put.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::MessageTooLarge(length));
    }

    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length).to_vec();
    Ok(Some(payload))
}

/// Buffered reader that turns a byte stream into discrete frames.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(MAX_BUFFER_SIZE),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the peer closes the stream cleanly between
    /// frames. A close in the middle of a frame is `TruncatedFrame`.
    pub async fn read_message(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            if let Some(payload) = try_decode_frame(&mut self.buf)? {
                return Ok(Some(payload));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                debug!(buffered = self.buf.len(), "stream closed mid-frame");
                return Err(ProtocolError::TruncatedFrame(self.buf.len()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_decoding() {
        let encoded = encode_frame(b"hello").unwrap();

        let mut buf = BytesMut::new();

        // Partial data, no frame yet
        buf.extend_from_slice(&encoded[..3]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[3..6]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[6..]);
        let payload = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(payload, b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_message_too_large() {
        let mut buf = BytesMut::new();
        let bad_len = ((MAX_PAYLOAD_SIZE + 1) as u32).to_be_bytes();
        buf.extend_from_slice(&bad_len);
        buf.extend_from_slice(&[0u8; 100]);
        let result = try_decode_frame(&mut buf);
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge(_))));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(ProtocolError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn frame_partial_length() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0]); // only 2 bytes, need 4
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn frame_multiple_messages() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(b"first").unwrap());
        buf.extend_from_slice(&encode_frame(b"second").unwrap());
        buf.extend_from_slice(&encode_frame(b"").unwrap());

        assert_eq!(try_decode_frame(&mut buf).unwrap().unwrap(), b"first");
        assert_eq!(try_decode_frame(&mut buf).unwrap().unwrap(), b"second");
        assert_eq!(try_decode_frame(&mut buf).unwrap().unwrap(), b"");
        assert!(buf.is_empty());
    }

    #[test]
    fn excess_bytes_are_kept_for_next_frame() {
        let second = encode_frame(b"tail").unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(b"head").unwrap());
        buf.extend_from_slice(&second[..5]);

        assert_eq!(try_decode_frame(&mut buf).unwrap().unwrap(), b"head");
        assert_eq!(buf.len(), 5);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&second[5..]);
        assert_eq!(try_decode_frame(&mut buf).unwrap().unwrap(), b"tail");
    }

    #[tokio::test]
    async fn reader_roundtrip_with_tiny_fragments() {
        let sizes = [0usize, 1, 3, 4, 5, 255, 4096, MAX_PAYLOAD_SIZE];
        let payloads: Vec<Vec<u8>> = sizes
            .iter()
            .map(|&n| (0..n).map(|i| (i * 7 % 251) as u8).collect())
            .collect();

        // A 3-byte duplex pipe forces every frame through many partial reads.
        let (mut tx, rx) = tokio::io::duplex(3);
        let expected = payloads.clone();
        let writer = tokio::spawn(async move {
            for p in &payloads {
                write_message(&mut tx, p).await.unwrap();
            }
        });

        let mut reader = FrameReader::new(rx);
        for p in &expected {
            let got = reader.read_message().await.unwrap().unwrap();
            assert_eq!(&got, p);
        }
        writer.await.unwrap();
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_reports_clean_close() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(tx);
        let mut reader = FrameReader::new(rx);
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_reports_truncated_frame() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let frame = encode_frame(b"cut short").unwrap();
        tx.write_all(&frame[..6]).await.unwrap();
        drop(tx);

        let mut reader = FrameReader::new(rx);
        assert!(matches!(
            reader.read_message().await,
            Err(ProtocolError::TruncatedFrame(6))
        ));
    }

    #[tokio::test]
    async fn reader_stops_on_oversized_length() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(&(MAX_BUFFER_SIZE as u32).to_be_bytes())
            .await
            .unwrap();

        let mut reader = FrameReader::new(rx);
        assert!(matches!(
            reader.read_message().await,
            Err(ProtocolError::MessageTooLarge(n)) if n == MAX_BUFFER_SIZE
        ));
    }
}
