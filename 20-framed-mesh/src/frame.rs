//! Length-prefixed wire frames.
//!
//! Every message on the wire is a big-endian `u32` length followed by the
//! payload. The length counts the 4 header bytes themselves, so an empty
//! payload is sent as `00 00 00 04`.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{FrameError, TransportError};

pub const HEADER_LEN: usize = 4;

/// Largest total frame length the header can describe.
pub const MAX_FRAME_LEN: u32 = u32::MAX;

/// Default receive limit. Peers declaring a longer frame are disconnected
/// before the body buffer is allocated.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// One encoded message: header and payload in a single shared buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
}

impl Frame {
    pub fn encode(payload: &[u8]) -> Result<Self, FrameError> {
        Self::encode_limited(payload, MAX_FRAME_LEN)
    }

    /// Encodes `payload`, refusing frames whose total length exceeds `max_len`.
    pub fn encode_limited(payload: &[u8], max_len: u32) -> Result<Self, FrameError> {
        let total = payload.len() as u64 + HEADER_LEN as u64;
        if total > u64::from(max_len) {
            return Err(FrameError::TooLarge {
                len: total,
                max: u64::from(max_len),
            });
        }

        let mut buf = BytesMut::with_capacity(total as usize);
        buf.put_u32(total as u32);
        buf.put_slice(payload);
        Ok(Self {
            bytes: buf.freeze(),
        })
    }

    /// Total length on the wire, header included.
    pub fn wire_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn payload_len(&self) -> usize {
        self.bytes.len() - HEADER_LEN
    }

    /// The payload without its header. Shares the frame's buffer.
    pub fn payload(&self) -> Bytes {
        self.bytes.slice(HEADER_LEN..)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Validates a received header and returns the declared total length.
pub fn decode_header(header: [u8; HEADER_LEN], max_len: u32) -> Result<u32, FrameError> {
    let declared = u32::from_be_bytes(header);
    if (declared as usize) < HEADER_LEN {
        return Err(FrameError::MalformedHeader { declared });
    }
    if declared > max_len {
        return Err(FrameError::TooLarge {
            len: u64::from(declared),
            max: u64::from(max_len),
        });
    }
    Ok(declared)
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new header. EOF in
/// the middle of a frame is an `UnexpectedEof` I/O error.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
    }

    let total = decode_header(header, max_len)? as usize;
    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(&header);
    buf.resize(total, 0);
    reader.read_exact(&mut buf[HEADER_LEN..]).await?;

    Ok(Some(Frame {
        bytes: buf.freeze(),
    }))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await
}
