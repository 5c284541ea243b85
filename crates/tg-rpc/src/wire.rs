//! Newline-delimited JSON framing over any async byte stream.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use tg_types::ProtocolError;

/// Upper bound on a single frame. A peer exceeding it is treated as
/// malformed and the connection is closed.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Serialize `msg` as one JSON line and flush it.
pub async fn send<W, T>(writer: &mut W, msg: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut frame = serde_json::to_vec(msg)?;
    if frame.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            limit: MAX_FRAME_BYTES,
        });
    }
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one JSON line and decode it. Returns `ConnectionClosed` on a clean
/// EOF at a frame boundary, `FrameTooLarge`/`Malformed` otherwise.
pub async fn recv<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncBufRead + AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = Vec::new();
    let n = reader
        .take(MAX_FRAME_BYTES as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;

    if n == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    if !line.ends_with(b"\n") {
        if line.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                limit: MAX_FRAME_BYTES,
            });
        }
        // EOF in the middle of a frame.
        return Err(ProtocolError::ConnectionClosed);
    }

    serde_json::from_slice(&line).map_err(|e| ProtocolError::Malformed {
        message: e.to_string(),
    })
}
