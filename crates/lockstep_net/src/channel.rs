//! Synchronous-send packet channel.
//!
//! A [`Channel`] wraps one bidirectional byte stream. `send` writes the
//! frame before returning; receiving is a plain loop over [`read_frame`].

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub use lockstep_core::config::DEFAULT_MAX_PACKET_LEN;

use crate::codec::{read_frame, write_frame};
use crate::error::Result;
use crate::packet::Packet;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half of a channel.
pub struct PacketReader {
    inner: BoxedRead,
    max_len: u32,
}

impl PacketReader {
    /// Next packet, or `None` once the peer closed between frames.
    pub async fn recv(&mut self) -> Result<Option<Packet>> {
        let packet = read_frame(&mut self.inner, self.max_len).await?;
        if let Some(packet) = &packet {
            trace!(key = ?packet.key(), len = packet.payload().len(), "Packet received");
        }
        Ok(packet)
    }
}

impl std::fmt::Debug for PacketReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReader")
            .field("max_len", &self.max_len)
            .finish_non_exhaustive()
    }
}

/// Write half of a channel.
pub struct PacketWriter {
    inner: BoxedWrite,
}

impl PacketWriter {
    /// Write one packet and flush.
    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        write_frame(&mut self.inner, packet).await?;
        trace!(key = ?packet.key(), len = packet.payload().len(), "Packet sent");
        Ok(())
    }

    /// Shut the write direction down.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter").finish_non_exhaustive()
    }
}

/// Bidirectional packet channel over one stream.
#[derive(Debug)]
pub struct Channel {
    reader: PacketReader,
    writer: PacketWriter,
}

impl Channel {
    /// Wrap a stream, accepting frames up to `max_len` bytes.
    pub fn new<S>(stream: S, max_len: u32) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: PacketReader {
                inner: Box::new(read),
                max_len,
            },
            writer: PacketWriter {
                inner: Box::new(write),
            },
        }
    }

    /// Write a packet before returning.
    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        self.writer.send(packet).await
    }

    /// Next packet, or `None` on clean close.
    pub async fn recv(&mut self) -> Result<Option<Packet>> {
        self.reader.recv().await
    }

    /// Shut the write direction down.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await
    }

    /// Separate the two directions.
    pub fn split(self) -> (PacketReader, PacketWriter) {
        (self.reader, self.writer)
    }
}
