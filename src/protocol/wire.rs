//! Framed wire I/O
//!
//! Reads and writes handshakes and length-prefixed frames over the halves
//! of a TCP stream.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::TorrentError;
use crate::protocol::handshake::{Handshake, HANDSHAKE_LEN};
use crate::protocol::message::Message;

/// Upper bound on a frame payload; anything larger is not a conformant
/// peer message (the largest legal frame is a bitfield or a 128 KiB block)
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Read one handshake (exactly 68 bytes)
pub async fn read_handshake<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Handshake> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut buf).await?;
    Handshake::deserialize(&buf)
}

/// Write one handshake
pub async fn write_handshake<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    handshake: &Handshake,
) -> Result<()> {
    writer.write_all(&handshake.serialize()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one complete frame and decode it
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Message> {
    let mut length_buf = [0u8; 4];
    reader.read_exact(&mut length_buf).await?;
    let length = u32::from_be_bytes(length_buf) as usize;
    if length > MAX_FRAME_LEN {
        return Err(TorrentError::malformed_with_source(
            "Frame length out of bounds",
            format!("{} bytes", length),
        )
        .into());
    }

    let mut frame = BytesMut::with_capacity(4 + length);
    frame.put_slice(&length_buf);
    if length > 0 {
        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;
        frame.put_slice(&payload);
    }
    Message::deserialize(&frame)
}

/// Encode and write one frame
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    writer.write_all(&message.serialize()).await?;
    writer.flush().await?;
    Ok(())
}
