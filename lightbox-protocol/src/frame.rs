//! Length-prefixed frame codec for the Unix-socket transport.
//!
//! Every message is a 4-byte big-endian length followed by a body of that
//! length. The first body byte discriminates the payload: `0x00` for UTF-8
//! JSON, `0x01` for raw binary (bulk payloads such as in-memory JPEGs).

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted body size for a JSON frame.
pub const MAX_JSON_FRAME_SIZE: usize = 10 * 1024 * 1024;
/// Maximum accepted body size for a binary frame.
pub const MAX_BINARY_FRAME_SIZE: usize = 100 * 1024 * 1024;

const FRAME_JSON: u8 = 0x00;
const FRAME_BINARY: u8 = 0x01;

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 JSON payload (requests, responses, notifications).
    Json(Vec<u8>),
    /// Raw binary payload, reserved for bulk transfers.
    Binary(Vec<u8>),
}

impl Frame {
    /// Serialize a value into a JSON frame.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, FrameError> {
        Ok(Frame::Json(serde_json::to_vec(value)?))
    }

    /// The payload bytes without the type discriminator.
    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::Json(body) | Frame::Binary(body) => body,
        }
    }
}

/// Errors raised by the frame codec. Oversize and truncation errors are
/// fatal for the connection; the caller must close it.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {got} bytes exceeds the {limit}-byte limit")]
    Oversize { got: usize, limit: usize },

    #[error("peer closed the stream after {got}/{expected} bytes")]
    Truncated { got: usize, expected: usize },

    #[error("unknown frame type byte 0x{0:02x}")]
    UnknownType(u8),

    #[error("empty frame body")]
    Empty,

    #[error("JSON encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Read exactly `buf.len()` bytes. Returns `Ok(false)` on a clean EOF before
/// the first byte; a mid-message EOF is a [`FrameError::Truncated`].
async fn read_exactly<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<bool, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(FrameError::Truncated {
                got: filled,
                expected: buf.len(),
            });
        }
        filled += n;
    }
    Ok(true)
}

/// Read one frame. Returns `Ok(None)` when the peer closed the connection
/// cleanly between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, FrameError> {
    let mut len_buf = [0u8; 4];
    if !read_exactly(reader, &mut len_buf).await? {
        return Ok(None);
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(FrameError::Empty);
    }
    // The discriminator arrives as the first body byte, so the hard limit
    // can only be enforced precisely once it is known. Reject anything past
    // the binary ceiling before allocating.
    if len > MAX_BINARY_FRAME_SIZE + 1 {
        return Err(FrameError::Oversize {
            got: len,
            limit: MAX_BINARY_FRAME_SIZE,
        });
    }

    let mut type_buf = [0u8; 1];
    if !read_exactly(reader, &mut type_buf).await? {
        return Err(FrameError::Truncated {
            got: 4,
            expected: 4 + len,
        });
    }
    let body_len = len - 1;
    let limit = match type_buf[0] {
        FRAME_JSON => MAX_JSON_FRAME_SIZE,
        FRAME_BINARY => MAX_BINARY_FRAME_SIZE,
        other => return Err(FrameError::UnknownType(other)),
    };
    if body_len > limit {
        return Err(FrameError::Oversize {
            got: body_len,
            limit,
        });
    }

    let mut body = vec![0u8; body_len];
    if body_len > 0 && !read_exactly(reader, &mut body).await? {
        return Err(FrameError::Truncated {
            got: 5,
            expected: 4 + len,
        });
    }
    Ok(Some(match type_buf[0] {
        FRAME_JSON => Frame::Json(body),
        _ => Frame::Binary(body),
    }))
}

/// Write one frame, flushing the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let (type_byte, body) = match frame {
        Frame::Json(body) => (FRAME_JSON, body),
        Frame::Binary(body) => (FRAME_BINARY, body),
    };
    let limit = match frame {
        Frame::Json(_) => MAX_JSON_FRAME_SIZE,
        Frame::Binary(_) => MAX_BINARY_FRAME_SIZE,
    };
    if body.len() > limit {
        return Err(FrameError::Oversize {
            got: body.len(),
            limit,
        });
    }
    let len = (body.len() + 1) as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&[type_byte]).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
