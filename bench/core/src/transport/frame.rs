//! Frame Protocol
//!
//! Wire format between the bench and its peer: length-prefixed UTF-8 JSON.
//!
//! # Frame Format
//!
//! ```text
//! +------------------+--------------+------------------------------------+
//! | Length (4)       | Reserved (1) | JSON Payload (Length bytes)        |
//! | little-endian u32| always 0x00  | greeting, diff report, peer text   |
//! +------------------+--------------+------------------------------------+
//! ```
//!
//! The length counts payload bytes only. The reserved byte is written as
//! zero and ignored on read. Inbound frames are capped at
//! [`MAX_INBOUND_FRAME_SIZE`]; outbound ones only need to fit the u32 field.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;

/// Frame header size: 4 bytes length + 1 reserved byte
pub const HEADER_SIZE: usize = 5;

/// Value written into the reserved header byte
pub const RESERVED_BYTE: u8 = 0;

/// Largest payload accepted from a peer (10 MB)
///
/// A header announcing more is rejected before anything is buffered.
pub const MAX_INBOUND_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Build the 5-byte header for a payload length
fn header(len: usize) -> Result<[u8; HEADER_SIZE], TransportError> {
    let len = u32::try_from(len).map_err(|_| TransportError::PayloadTooLarge { len })?;
    let [a, b, c, d] = len.to_le_bytes();
    Ok([a, b, c, d, RESERVED_BYTE])
}

/// Payload length carried by an inbound header, checked against the cap
fn payload_len(header: &[u8]) -> Result<usize, TransportError> {
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_INBOUND_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            len,
            max: MAX_INBOUND_FRAME_SIZE,
        });
    }
    Ok(len)
}

/// Encode a payload into a complete frame
///
/// # Errors
///
/// Returns `TransportError::PayloadTooLarge` when the payload length does not
/// fit in 32 bits.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let header = header(payload.len())?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Read exactly one frame and return its payload
///
/// A stream that ends inside the header or the payload yields
/// `TransportError::ConnectionClosed`; a header over the inbound cap yields
/// `TransportError::FrameTooLarge` without reading the payload.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await.map_err(eof_is_closed)?;

    let mut payload = vec![0u8; payload_len(&header)?];
    reader.read_exact(&mut payload).await.map_err(eof_is_closed)?;
    Ok(payload)
}

/// Write one frame and flush it
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), TransportError> {
    let frame = encode(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn eof_is_closed(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::ConnectionClosed
    } else {
        TransportError::Io(e)
    }
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete payloads. A partial frame
/// stays buffered until the rest arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact once most of the buffer has been consumed
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of bytes available in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Pop the next complete payload, or `None` if more data is needed
    ///
    /// # Errors
    ///
    /// Returns `TransportError::FrameTooLarge` when the buffered header
    /// announces more than [`MAX_INBOUND_FRAME_SIZE`]. The stream cannot be
    /// resynchronized after that; the caller should drop the peer.
    pub fn decode_next(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.available() < HEADER_SIZE {
            return Ok(None);
        }

        let len = payload_len(&self.buffer[self.read_pos..self.read_pos + HEADER_SIZE])?;
        if self.available() < HEADER_SIZE + len {
            return Ok(None);
        }

        let payload_start = self.read_pos + HEADER_SIZE;
        let payload_end = payload_start + len;
        let payload = self.buffer[payload_start..payload_end].to_vec();
        self.read_pos = payload_end;

        if self.read_pos == self.buffer.len() {
            self.clear();
        }
        Ok(Some(payload))
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}
