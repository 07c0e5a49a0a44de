//! Frame codec for the network transport
//!
//! Frames are MessagePack (rmp-serde, named fields) with a length prefix:
//!
//! ```text
//! [4 bytes: body length (little-endian u32)][N bytes: MessagePack body]
//! ```
//!
//! Named-field encoding keeps the open `data` map and the envelope struct
//! self-describing, so either side can add fields without breaking the other.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
///
/// Increment this when making breaking changes to frames or lifecycle messages.
/// Master and workers must have matching protocol versions.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Serialize a value into a length-prefixed frame
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec_named(value).context("Failed to serialize frame")?;

    if body.len() > MAX_FRAME_LEN {
        anyhow::bail!("Frame too large: {} bytes (max 100MB)", body.len());
    }

    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&body);

    Ok(framed)
}

/// Decode one frame from the front of `buf`
///
/// Returns the value and the number of bytes consumed, prefix included.
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<(T, usize)> {
    if buf.len() < 4 {
        anyhow::bail!("Buffer too small for frame length (need 4 bytes, got {})", buf.len());
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if buf.len() < 4 + len {
        anyhow::bail!("Incomplete frame (need {} bytes, got {})", 4 + len, buf.len());
    }

    let value = rmp_serde::from_slice(&buf[4..4 + len]).context("Failed to deserialize frame")?;

    Ok((value, 4 + len))
}

/// Read one complete frame from a stream
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read frame length")?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("Frame too large: {} bytes (max 100MB)", len);
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .context("Failed to read frame body")?;

    rmp_serde::from_slice(&body).context("Failed to deserialize frame")
}

/// Write one frame to a stream and flush it
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let framed = encode_frame(value)?;

    writer.write_all(&framed).await.context("Failed to write frame")?;
    writer.flush().await.context("Failed to flush stream")?;

    Ok(())
}
