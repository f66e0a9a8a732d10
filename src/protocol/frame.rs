//! RESP frame types
//!
//! This module defines the Frame enum representing the RESP2 data types the
//! server speaks on the wire.

use bytes::Bytes;

/// RESP protocol frame types
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string: +OK\r\n
    Simple(Bytes),

    /// Error: -message\r\n
    Error(Bytes),

    /// Integer: :1000\r\n (decoded from peers, never produced by this server)
    Integer(i64),

    /// Bulk string: $5\r\nhello\r\n or $-1\r\n for null
    Bulk(Option<Bytes>),

    /// Array of bulk strings: *2\r\n...
    Array(Vec<Frame>),
}

impl Frame {
    /// Create a simple string frame
    #[inline]
    pub fn simple(s: impl Into<Bytes>) -> Self {
        Frame::Simple(s.into())
    }

    /// Create an error frame
    #[inline]
    pub fn error(s: impl Into<Bytes>) -> Self {
        Frame::Error(s.into())
    }

    /// Create a bulk string frame
    #[inline]
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(Some(data.into()))
    }

    /// Create a null bulk string frame
    #[inline]
    pub fn null() -> Self {
        Frame::Bulk(None)
    }

    /// Create an array frame
    #[inline]
    pub fn array(frames: Vec<Frame>) -> Self {
        Frame::Array(frames)
    }

    /// Build a command array from bulk-string arguments
    pub fn command(args: &[&str]) -> Self {
        Frame::Array(
            args.iter()
                .map(|a| Frame::bulk(Bytes::copy_from_slice(a.as_bytes())))
                .collect(),
        )
    }

    /// Get the string value if this is a Simple or Bulk frame
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Frame::Simple(b) => std::str::from_utf8(b).ok(),
            Frame::Bulk(Some(b)) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Convert to owned bytes if this is a non-null Bulk frame
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Frame::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Frame::bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Bytes> for Frame {
    fn from(b: Bytes) -> Self {
        Frame::bulk(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constructors() {
        assert_eq!(Frame::simple("OK"), Frame::Simple(Bytes::from("OK")));
        assert_eq!(Frame::error("oops"), Frame::Error(Bytes::from("oops")));
        assert_eq!(Frame::bulk("hello"), Frame::Bulk(Some(Bytes::from("hello"))));
        assert_eq!(Frame::null(), Frame::Bulk(None));
    }

    #[test]
    fn test_frame_command() {
        let frame = Frame::command(&["SET", "foo", "bar"]);
        match frame {
            Frame::Array(items) => {
                assert_eq!(items.len(), 3);
                assert_eq!(items[0].as_str(), Some("SET"));
                assert_eq!(items[2].as_str(), Some("bar"));
            }
            _ => panic!("expected array frame"),
        }
    }

    #[test]
    fn test_frame_as_str() {
        assert_eq!(Frame::simple("PONG").as_str(), Some("PONG"));
        assert_eq!(Frame::bulk("hey").as_str(), Some("hey"));
        assert_eq!(Frame::Integer(42).as_str(), None);
        assert_eq!(Frame::null().as_str(), None);
    }

    #[test]
    fn test_frame_into_bytes() {
        assert_eq!(Frame::bulk("v").into_bytes(), Some(Bytes::from("v")));
        assert_eq!(Frame::null().into_bytes(), None);
        assert_eq!(Frame::simple("v").into_bytes(), None);
    }
}
