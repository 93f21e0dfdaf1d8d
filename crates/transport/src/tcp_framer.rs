//! Stream framing for TCP-class packets
//!
//! Bytes are accumulated until the type-specific minimum needed to compute a
//! packet's size is present, then until the whole packet is present. Only then
//! is it decoded.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use thiserror::Error;
use tracing::{trace, warn};
use wxpush_protocol::{PacketError, TcpPacket, packet_size, packet_size_bytes_required};

/// Default upper bound on one frame; images are the only large packets
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Error, Debug)]
pub enum FramingError {
    /// The stream cannot be resynchronised past an unknown type
    #[error("Unknown packet type 0x{0:02x} on stream")]
    UnknownPacketType(u8),

    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unusable frame header: {0}")]
    BadHeader(PacketError),

    #[error("Encode failed: {0}")]
    Encode(PacketError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Incremental TCP packet extractor
#[derive(Debug)]
pub struct TcpFramer {
    buffer: BytesMut,
    max_frame_size: usize,
    dropped: u64,
}

impl Default for TcpFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpFramer {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_CHUNK),
            max_frame_size,
            dropped: 0,
        }
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Frames that were sized correctly but failed to decode
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Split the next complete frame off the buffer without decoding it.
    ///
    /// Returns `Ok(None)` while more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FramingError> {
        let Some(&type_byte) = self.buffer.first() else {
            return Ok(None);
        };

        let required = packet_size_bytes_required(type_byte).map_err(|e| match e {
            PacketError::UnknownPacketType(t) => FramingError::UnknownPacketType(t),
            PacketError::WrongTransport { packet_type, .. } => {
                FramingError::UnknownPacketType(packet_type.id())
            }
            other => FramingError::BadHeader(other),
        })?;
        if self.buffer.len() < required {
            trace!(buffered = self.buffer.len(), required, "Waiting for size header");
            return Ok(None);
        }

        let size = packet_size(&self.buffer[..required]).map_err(FramingError::BadHeader)?;
        if size > self.max_frame_size {
            return Err(FramingError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        if self.buffer.len() < size {
            trace!(buffered = self.buffer.len(), size, "Waiting for rest of frame");
            return Ok(None);
        }

        Ok(Some(self.buffer.split_to(size).freeze()))
    }

    /// Next decoded packet. Frames that fail to decode are logged and skipped.
    pub fn next_packet(&mut self) -> Result<Option<TcpPacket>, FramingError> {
        while let Some(frame) = self.next_frame()? {
            match TcpPacket::decode(&frame) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => {
                    self.dropped += 1;
                    warn!(len = frame.len(), "Dropping malformed frame: {}", e);
                }
            }
        }
        Ok(None)
    }

    /// Read from `reader` until a packet is available.
    ///
    /// Returns `Ok(None)` on a clean end of stream. Must be cancel safe for use
    /// in `select!`, so state lives in the framer, not in this future.
    pub async fn read_packet<R>(&mut self, reader: &mut R) -> Result<Option<TcpPacket>, FramingError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if let Some(packet) = self.next_packet()? {
                return Ok(Some(packet));
            }

            self.buffer.reserve(READ_CHUNK);
            let n = reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if !self.buffer.is_empty() {
                    warn!(leftover = self.buffer.len(), "Stream closed mid-frame");
                }
                return Ok(None);
            }
        }
    }
}

/// Encode and write one packet. Returns the bytes written.
pub async fn write_packet<W>(writer: &mut W, packet: &TcpPacket) -> Result<usize, FramingError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = packet.encode().map_err(FramingError::Encode)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(bytes.len())
}
