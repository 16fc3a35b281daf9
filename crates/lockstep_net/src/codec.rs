//! Frame codec.
//!
//! Each frame is `[len: u32 LE][key: u8][payload]` where `len` counts the
//! key byte plus the payload. A zero length or one above the receiver's
//! maximum is a protocol error.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetError, Result};
use crate::packet::{NetworkKey, Packet};

/// Bytes in the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Encode a packet into one frame.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>> {
    let len = u32::try_from(packet.payload().len() + 1)
        .map_err(|_| NetError::Protocol("packet too large to frame".to_string()))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + len as usize);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.push(packet.key() as u8);
    frame.extend_from_slice(packet.payload());
    Ok(frame)
}

/// Decode one complete frame held in memory.
pub fn decode_frame(frame: &[u8], max_len: u32) -> Result<Packet> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(NetError::Protocol("truncated frame header".to_string()));
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header.copy_from_slice(&frame[..FRAME_HEADER_LEN]);
    let len = check_len(u32::from_le_bytes(header), max_len)?;
    let body = &frame[FRAME_HEADER_LEN..];
    if body.len() != len {
        return Err(NetError::Protocol(format!(
            "frame declares {len} bytes, holds {}",
            body.len()
        )));
    }
    body_to_packet(body)
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(packet)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly between frames. An end
/// inside a frame is a transport error.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(truncated());
        }
        filled += n;
    }

    let len = check_len(u32::from_le_bytes(header), max_len)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            truncated()
        } else {
            NetError::Transport(err)
        }
    })?;
    body_to_packet(&body).map(Some)
}

fn check_len(len: u32, max_len: u32) -> Result<usize> {
    if len == 0 {
        return Err(NetError::Protocol("zero-length frame".to_string()));
    }
    if len > max_len {
        return Err(NetError::Protocol(format!(
            "frame of {len} bytes exceeds limit {max_len}"
        )));
    }
    Ok(len as usize)
}

fn body_to_packet(body: &[u8]) -> Result<Packet> {
    let key = NetworkKey::try_from(body[0])?;
    Ok(Packet::new(key, body[1..].to_vec()))
}

fn truncated() -> NetError {
    NetError::Transport(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "stream ended inside a frame",
    ))
}
