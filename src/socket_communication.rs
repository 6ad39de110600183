use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SupervisorError};

/// Largest frame either side will accept.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encodes a message with a length prefix and sends it over the stream.
pub async fn send_message<W, T>(stream: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let message_bytes = serde_json::to_vec(message)?;
    if message_bytes.len() > MAX_FRAME_LEN {
        return Err(SupervisorError::FrameTooLarge(message_bytes.len()));
    }
    let length_bytes = (message_bytes.len() as u32).to_be_bytes();

    stream.write_all(&length_bytes).await?;
    stream.write_all(&message_bytes).await?;
    stream.flush().await?;

    Ok(())
}

/// Reads a length-prefixed message from the stream and decodes it.
///
/// Returns `Ok(None)` when the peer closed the stream between frames. An
/// oversized frame is skipped before `FrameTooLarge` is returned, so the
/// next read starts on a frame boundary.
pub async fn receive_message<R, T>(stream: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut length_bytes = [0u8; 4];
    match stream.read_exact(&mut length_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let length = u32::from_be_bytes(length_bytes) as usize;
    if length > MAX_FRAME_LEN {
        let mut body = (&mut *stream).take(length as u64);
        let skipped = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
        if skipped < length as u64 {
            return Ok(None);
        }
        return Err(SupervisorError::FrameTooLarge(length));
    }

    let mut message_bytes = vec![0u8; length];
    stream.read_exact(&mut message_bytes).await?;

    Ok(Some(serde_json::from_slice(&message_bytes)?))
}
