//! Length-prefixed frames over a byte stream.
//!
//! ```text
//! +-------------------+----------------------------+
//! | u32 little-endian | payload (bincode Envelope) |
//! +-------------------+----------------------------+
//! ```
//!
//! The prefix counts payload bytes only.

use crate::Envelope;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LEN_PREFIX: usize = 4;

#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest payload accepted in either direction. Default: 1 MiB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1 << 20,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: u32, max: u32 },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("malformed envelope: {0}")]
    Codec(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn eof_as_closed(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Reads one frame and returns its payload.
///
/// A peer that hangs up mid-frame (or between frames) yields
/// [`FrameError::ConnectionClosed`].
pub async fn read_frame<R>(reader: &mut R, config: &FrameConfig) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LEN_PREFIX];
    reader.read_exact(&mut prefix).await.map_err(eof_as_closed)?;

    let size = u32::from_le_bytes(prefix);
    if size > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size,
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; size as usize];
    reader.read_exact(&mut payload).await.map_err(eof_as_closed)?;
    Ok(payload)
}

/// Writes `payload` as one frame and flushes.
pub async fn write_frame<W>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if size > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size,
            max: config.max_payload_size,
        });
    }

    // Prefix and payload go out in one write so concurrent writers sharing a
    // lock never interleave half frames.
    let mut buf = Vec::with_capacity(LEN_PREFIX + payload.len());
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_envelope<R>(reader: &mut R, config: &FrameConfig) -> Result<Envelope, FrameError>
where
    R: AsyncRead + Unpin,
{
    let payload = read_frame(reader, config).await?;
    Ok(Envelope::decode(&payload)?)
}

pub async fn write_envelope<W>(
    writer: &mut W,
    envelope: &Envelope,
    config: &FrameConfig,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let payload = envelope.encode()?;
    write_frame(writer, &payload, config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Packet;
    use tokio::io::duplex;

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut bytes = (payload.len() as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[tokio::test]
    async fn test_envelopes_arrive_in_order() {
        let (mut client, mut server) = duplex(4096);
        let config = FrameConfig::default();

        for call_id in 1..=3 {
            let envelope = Envelope::new(call_id, Packet::GetGameState);
            write_envelope(&mut client, &envelope, &config).await.unwrap();
        }

        for call_id in 1..=3 {
            let received = read_envelope(&mut server, &config).await.unwrap();
            assert_eq!(received.call_id, call_id);
            assert_eq!(received.packet, Packet::GetGameState);
        }
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let payload = b"a payload longer than the pipe buffer";
        let mut mock = tokio_test::io::Builder::new()
            .read(&frame_bytes(payload)[..3])
            .read(&frame_bytes(payload)[3..10])
            .read(&frame_bytes(payload)[10..])
            .build();

        let received = read_frame(&mut mock, &FrameConfig::default()).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_write_emits_little_endian_prefix() {
        let mut mock = tokio_test::io::Builder::new()
            .write(&[5, 0, 0, 0, b'h', b'e', b'l', b'l', b'o'])
            .build();

        write_frame(&mut mock, b"hello", &FrameConfig::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let config = FrameConfig {
            max_payload_size: 8,
        };
        let mut mock = tokio_test::io::Builder::new()
            .read(&64u32.to_le_bytes())
            .build();

        let result = read_frame(&mut mock, &config).await;
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { size: 64, max: 8 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let (mut client, _server) = duplex(64);
        let config = FrameConfig {
            max_payload_size: 8,
        };

        let result = write_frame(&mut client, &[0u8; 9], &config).await;
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_hangup_reports_closed() {
        let (client, mut server) = duplex(64);
        drop(client);

        let result = read_frame(&mut server, &FrameConfig::default()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_hangup_mid_payload_reports_closed() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let result = read_frame(&mut server, &FrameConfig::default()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_garbage_payload_is_codec_error() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&frame_bytes(&[0xFF; 3]))
            .build();

        let result = read_envelope(&mut mock, &FrameConfig::default()).await;
        assert!(matches!(result, Err(FrameError::Codec(_))));
    }
}
