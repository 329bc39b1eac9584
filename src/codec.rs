//! Length-prefixed frames on a byte stream.
//!
//! Frames are a 4-byte little-endian length followed by that many payload
//! bytes. Reads and writes carry a 40 s deadline; the deadline policy is a
//! per-transport configuration value so that in-memory test streams can
//! run without it.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::CodecError;

/// How many bytes we use as the frame header.
pub const LENGTH_HEADER: usize = 4;
/// Upper bound on a single frame payload.
pub const MAX_PAYLOAD: u32 = 20 * 1024 * 1024;
pub const TIMEOUT_READ_PAYLOAD: Duration = Duration::from_secs(40);
pub const TIMEOUT_WRITE_PAYLOAD: Duration = Duration::from_secs(40);

/// Read one frame from the given stream.
pub async fn read_frame<R>(reader: &mut R, apply_deadline: bool) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    if apply_deadline {
        timeout(TIMEOUT_READ_PAYLOAD, read_frame_inner(reader))
            .await
            .map_err(|_| CodecError::Deadline(TIMEOUT_READ_PAYLOAD))?
    } else {
        read_frame_inner(reader).await
    }
}

async fn read_frame_inner<R>(reader: &mut R) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut length_bytes = [0u8; LENGTH_HEADER];
    reader.read_exact(&mut length_bytes).await?;
    let length = u32::from_le_bytes(length_bytes);
    if length > MAX_PAYLOAD {
        return Err(CodecError::PayloadTooLarge {
            length,
            max: MAX_PAYLOAD,
        });
    }
    let mut buf = vec![0u8; length as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write one frame to the given stream.
pub async fn write_frame<W>(
    writer: &mut W,
    msg: &[u8],
    apply_deadline: bool,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    if apply_deadline {
        timeout(TIMEOUT_WRITE_PAYLOAD, write_frame_inner(writer, msg))
            .await
            .map_err(|_| CodecError::Deadline(TIMEOUT_WRITE_PAYLOAD))?
    } else {
        write_frame_inner(writer, msg).await
    }
}

async fn write_frame_inner<W>(writer: &mut W, msg: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let length = msg.len() as u32;
    writer.write_all(&length.to_le_bytes()).await?;
    writer.write_all(msg).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello frames", false).await.unwrap();
        write_frame(&mut a, b"", false).await.unwrap();
        assert_eq!(read_frame(&mut b, false).await.unwrap(), b"hello frames");
        assert_eq!(read_frame(&mut b, false).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_reject_oversized_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let length = (MAX_PAYLOAD + 1).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &length)
            .await
            .unwrap();
        match read_frame(&mut b, false).await {
            Err(CodecError::PayloadTooLarge { length, .. }) => {
                assert_eq!(length, MAX_PAYLOAD + 1);
            }
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_short_read_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut a, &8u32.to_le_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, b"1234")
            .await
            .unwrap();
        drop(a);
        assert!(matches!(
            read_frame(&mut b, false).await,
            Err(CodecError::Io(_))
        ));
    }
}
