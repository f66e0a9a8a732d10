//! RESP protocol parser
//!
//! Streaming parser over a read buffer. A call either consumes exactly the
//! bytes of one complete frame, consumes nothing because the frame is still
//! incomplete, or fails with an error that is fatal to the connection.

use std::io::Cursor;

use bytes::{Buf, BytesMut};

use super::Frame;

/// Parse error types
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Not enough data to parse a complete frame
    Incomplete,

    /// Malformed frame header or length
    BadHeader(String),

    /// Declared payload length does not match the delivered bytes
    ShortFrame,

    /// Unknown frame type byte
    UnsupportedType(u8),

    /// Stream ended in the middle of a frame
    UnexpectedEof,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Incomplete => write!(f, "incomplete frame"),
            ParseError::BadHeader(msg) => write!(f, "bad frame header: {msg}"),
            ParseError::ShortFrame => write!(f, "frame payload shorter than declared"),
            ParseError::UnsupportedType(b) => write!(f, "unsupported frame type byte {b:#04x}"),
            ParseError::UnexpectedEof => write!(f, "unexpected end of stream"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse a RESP frame from the buffer.
///
/// Returns `Ok(Some(frame))` if a complete frame was parsed (the buffer is
/// advanced past exactly that frame), `Ok(None)` if more data is needed
/// (the buffer is untouched), or `Err` if the data is invalid.
pub fn parse_frame(buf: &mut BytesMut) -> Result<Option<Frame>, ParseError> {
    if buf.is_empty() {
        return Ok(None);
    }

    // Use a cursor to validate without consuming
    let mut cursor = Cursor::new(&buf[..]);

    match check_frame(&mut cursor) {
        Ok(len) => {
            cursor.set_position(0);
            let frame = parse_frame_at(&mut cursor)?;
            buf.advance(len);
            Ok(Some(frame))
        }
        Err(ParseError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check whether a complete frame is available and return its wire length
fn check_frame(cursor: &mut Cursor<&[u8]>) -> Result<usize, ParseError> {
    match peek_byte(cursor)? {
        b'+' | b'-' => {
            cursor.advance(1);
            find_line(cursor)?;
            Ok(cursor.position() as usize)
        }
        b':' => {
            cursor.advance(1);
            read_decimal(cursor)?;
            Ok(cursor.position() as usize)
        }
        b'$' => {
            cursor.advance(1);
            check_bulk_body(cursor)?;
            Ok(cursor.position() as usize)
        }
        b'*' => {
            cursor.advance(1);
            let count = read_decimal(cursor)?;
            if count < 0 {
                return Err(ParseError::BadHeader(format!(
                    "invalid array length {count}"
                )));
            }
            for _ in 0..count {
                // Command arrays carry bulk strings only
                match peek_byte(cursor)? {
                    b'$' => {
                        cursor.advance(1);
                        check_bulk_body(cursor)?;
                    }
                    b => {
                        return Err(ParseError::BadHeader(format!(
                            "array element must be a bulk string, got {b:#04x}"
                        )))
                    }
                }
            }
            Ok(cursor.position() as usize)
        }
        b => Err(ParseError::UnsupportedType(b)),
    }
}

/// Validate a bulk string body (`<len>\r\n<payload>\r\n`), cursor already
/// past the `$`
fn check_bulk_body(cursor: &mut Cursor<&[u8]>) -> Result<(), ParseError> {
    let len = read_decimal(cursor)?;
    if len == -1 {
        // Null bulk string has no payload
        return Ok(());
    }
    if len < -1 {
        return Err(ParseError::BadHeader(format!(
            "invalid bulk string length {len}"
        )));
    }
    let len = len as usize;
    let payload_start = cursor.position() as usize;
    let payload_end = payload_start + len;
    if cursor.get_ref().len() < payload_end + 2 {
        return Err(ParseError::Incomplete);
    }
    // The declared length must land exactly on a CRLF terminator
    if &cursor.get_ref()[payload_end..payload_end + 2] != b"\r\n" {
        return Err(ParseError::ShortFrame);
    }
    cursor.set_position((payload_end + 2) as u64);
    Ok(())
}

/// Parse a frame from the cursor (a prior check guarantees completeness)
fn parse_frame_at(cursor: &mut Cursor<&[u8]>) -> Result<Frame, ParseError> {
    match get_byte(cursor)? {
        b'+' => {
            let line = find_line(cursor)?;
            Ok(Frame::Simple(line))
        }
        b'-' => {
            let line = find_line(cursor)?;
            Ok(Frame::Error(line))
        }
        b':' => {
            let n = read_decimal(cursor)?;
            Ok(Frame::Integer(n))
        }
        b'$' => parse_bulk_body(cursor),
        b'*' => {
            let count = read_decimal(cursor)?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match get_byte(cursor)? {
                    b'$' => items.push(parse_bulk_body(cursor)?),
                    b => {
                        return Err(ParseError::BadHeader(format!(
                            "array element must be a bulk string, got {b:#04x}"
                        )))
                    }
                }
            }
            Ok(Frame::Array(items))
        }
        b => Err(ParseError::UnsupportedType(b)),
    }
}

/// Parse a bulk string body, cursor already past the `$`
fn parse_bulk_body(cursor: &mut Cursor<&[u8]>) -> Result<Frame, ParseError> {
    let len = read_decimal(cursor)?;
    if len == -1 {
        return Ok(Frame::Bulk(None));
    }
    let len = len as usize;
    let start = cursor.position() as usize;
    let data = bytes::Bytes::copy_from_slice(&cursor.get_ref()[start..start + len]);
    cursor.set_position((start + len + 2) as u64);
    Ok(Frame::Bulk(Some(data)))
}

/// Peek the byte at the cursor without consuming it
fn peek_byte(cursor: &Cursor<&[u8]>) -> Result<u8, ParseError> {
    cursor
        .get_ref()
        .get(cursor.position() as usize)
        .copied()
        .ok_or(ParseError::Incomplete)
}

/// Consume and return one byte
fn get_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8, ParseError> {
    let b = peek_byte(cursor)?;
    cursor.advance(1);
    Ok(b)
}

/// Consume a CRLF-terminated line, returning its contents
fn find_line(cursor: &mut Cursor<&[u8]>) -> Result<bytes::Bytes, ParseError> {
    let start = cursor.position() as usize;
    let data = cursor.get_ref();
    if data.len() > start {
        for i in start..data.len() - 1 {
            if data[i] == b'\r' && data[i + 1] == b'\n' {
                let line = bytes::Bytes::copy_from_slice(&data[start..i]);
                cursor.set_position((i + 2) as u64);
                return Ok(line);
            }
        }
    }
    Err(ParseError::Incomplete)
}

/// Consume a CRLF-terminated line and parse it as a signed decimal
fn read_decimal(cursor: &mut Cursor<&[u8]>) -> Result<i64, ParseError> {
    let line = find_line(cursor)?;
    let s = std::str::from_utf8(&line)
        .map_err(|_| ParseError::BadHeader("length is not valid UTF-8".to_string()))?;
    s.parse::<i64>()
        .map_err(|_| ParseError::BadHeader(format!("invalid length '{s}'")))
}
