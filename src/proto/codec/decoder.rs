use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::proto::frame::Frame;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024; // 512 MB default

/// A RESP decoder that converts bytes to [`Frame`] types.
///
/// The decoder handles streaming input and can decode frames incrementally.
/// Call [`append`](Decoder::append) to add data, then [`decode`](Decoder::decode)
/// to parse frames. Returns `Ok(None)` when more data is needed; in that case
/// nothing is consumed, so a frame split across reads is never lost.
///
/// # Example
///
/// ```
/// use slotmux::proto::codec::Decoder;
/// use slotmux::proto::Frame;
///
/// let mut decoder = Decoder::new();
/// decoder.append(b"+OK\r\n");
/// let frame = decoder.decode().unwrap().unwrap();
/// assert_eq!(frame, Frame::simple("OK"));
/// ```
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl Decoder {
    /// Creates a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a new decoder with a custom maximum frame size.
    ///
    /// # Arguments
    ///
    /// * `max_frame_size` - Maximum size in bytes for a single frame
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Appends raw bytes to the internal buffer.
    ///
    /// Buffer size limits are checked during decode, not append.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed by a decoded frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Attempts to decode a frame from the buffer.
    ///
    /// # Returns
    ///
    /// `Ok(Some(frame))` for a complete frame, `Ok(None)` if more data is needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the data is malformed or exceeds the
    /// configured maximum frame size.
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        if self.buf.len() > self.max_frame_size {
            return Err(Error::protocol("buffer size exceeded maximum frame size"));
        }

        let mut cursor = 0;
        match parse_frame(&self.buf, &mut cursor, self.max_frame_size)? {
            Some(frame) => {
                self.buf.advance(cursor);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses one frame starting at `pos`, advancing it past the frame on success.
/// Leaves `pos` untouched when the frame is incomplete.
fn parse_frame(buf: &[u8], pos: &mut usize, max_frame_size: usize) -> Result<Option<Frame>> {
    let Some(&tag) = buf.get(*pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, *pos + 1) else {
        return Ok(None);
    };

    let frame = match tag {
        b'+' => {
            *pos = next;
            Frame::SimpleString(line.to_vec())
        }
        b'-' => {
            *pos = next;
            Frame::Error(line.to_vec())
        }
        b':' => {
            let value = parse_int(line)?;
            *pos = next;
            Frame::Integer(value)
        }
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                *pos = next;
                return Ok(Some(Frame::BulkString(None)));
            }
            let len = len as usize;
            if len > max_frame_size {
                return Err(Error::protocol(
                    "bulk string length exceeds maximum frame size",
                ));
            }
            let end = next + len;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(Error::protocol("bulk string is not terminated by CRLF"));
            }
            *pos = end + 2;
            Frame::BulkString(Some(Bytes::copy_from_slice(&buf[next..end])))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len < 0 {
                *pos = next;
                return Ok(Some(Frame::Null));
            }
            let len = len as usize;
            // Assume minimum 16 bytes per item
            if len > max_frame_size / 16 {
                return Err(Error::protocol("array length exceeds reasonable maximum"));
            }
            let mut cursor = next;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                match parse_frame(buf, &mut cursor, max_frame_size)? {
                    Some(item) => items.push(item),
                    None => return Ok(None),
                }
            }
            *pos = cursor;
            Frame::Array(items)
        }
        other => {
            return Err(Error::protocol(format!(
                "unknown frame type: {}",
                other as char
            )))
        }
    };

    Ok(Some(frame))
}

/// Returns the bytes before the next CRLF at or after `start`, and the index
/// just past that CRLF.
fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let idx = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..idx], start + idx + 2))
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            Error::protocol(format!(
                "invalid integer: {}",
                String::from_utf8_lossy(line)
            ))
        })
}
