//! Connection handling
//!
//! Buffered framing over a TCP stream. The read half and its buffer stay
//! with the owning task across every protocol phase (handshake, snapshot
//! transfer, command streaming) so no byte that already entered the buffer
//! is lost. The write half sits behind a shared handle so a `PSYNC` can
//! retain the socket for outbound propagation while the read loop keeps
//! running.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{CarmineError, Result};
use crate::protocol::{encode_to_bytes, parse_frame, Frame, ParseError};

/// Default read buffer size (4KB)
const DEFAULT_CONNECTION_BUFFER_SIZE: usize = 4 * 1024;

/// Shared handle to the write half of a connection. Frame writes lock the
/// handle, so concurrent writers cannot interleave partial frames.
pub type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// A framed connection to a peer
pub struct Connection {
    /// The read half, owned by the connection's task
    reader: OwnedReadHalf,

    /// Read buffer carried across frames and protocol phases
    read_buf: BytesMut,

    /// Shared write half
    writer: SharedWriter,

    /// Remote peer address
    pub peer_addr: Option<SocketAddr>,
}

impl Connection {
    /// Wrap an accepted or dialed TCP stream
    pub fn new(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self {
            reader,
            read_buf: BytesMut::with_capacity(DEFAULT_CONNECTION_BUFFER_SIZE),
            writer: Arc::new(Mutex::new(writer)),
            peer_addr,
        }
    }

    /// Dial a remote peer
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }

    /// Clone the shared write half, e.g. to retain a propagation socket
    pub fn writer_handle(&self) -> SharedWriter {
        self.writer.clone()
    }

    /// Read one frame.
    ///
    /// Returns `Ok(Some(frame))` on success, `Ok(None)` on a clean close
    /// (EOF between frames), or `Err` on a decode failure or an EOF that
    /// lands mid-frame. Errors are fatal to the connection.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.read_frame_counted().await?.map(|(frame, _)| frame))
    }

    /// Read one frame together with its wire length in bytes.
    ///
    /// The replication stream uses the byte count for offset accounting.
    pub async fn read_frame_counted(&mut self) -> Result<Option<(Frame, u64)>> {
        loop {
            let before = self.read_buf.len();
            match parse_frame(&mut self.read_buf) {
                Ok(Some(frame)) => {
                    let consumed = (before - self.read_buf.len()) as u64;
                    return Ok(Some((frame, consumed)));
                }
                Ok(None) => {
                    // Need more data
                }
                Err(e) => return Err(CarmineError::Protocol(e.to_string())),
            }

            let n = self.reader.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(CarmineError::Protocol(
                    ParseError::UnexpectedEof.to_string(),
                ));
            }
        }
    }

    /// Encode and write one frame, flushed before returning
    pub async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let bytes = encode_to_bytes(frame);
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        Ok(())
    }

    /// Send a snapshot payload: `$<len>\r\n` followed by the raw bytes with
    /// no trailing CRLF
    pub async fn write_snapshot(&self, payload: &Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(format!("${}\r\n", payload.len()).as_bytes())
            .await?;
        writer.write_all(payload).await?;
        Ok(())
    }

    /// Read a snapshot payload: `$<len>\r\n` followed by exactly `len` raw
    /// bytes with no trailing CRLF.
    ///
    /// This is the one place the stream deviates from frame framing; after
    /// it returns, `read_frame` picks up at the next byte.
    pub async fn read_snapshot(&mut self) -> Result<Bytes> {
        // Header line
        let payload_len = loop {
            if let Some(pos) = self.read_buf.iter().position(|&b| b == b'\n') {
                if pos < 2 || self.read_buf[0] != b'$' || self.read_buf[pos - 1] != b'\r' {
                    return Err(CarmineError::Protocol(
                        "malformed snapshot header".to_string(),
                    ));
                }
                let len: usize = std::str::from_utf8(&self.read_buf[1..pos - 1])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        CarmineError::Protocol("invalid snapshot length".to_string())
                    })?;
                self.read_buf.advance(pos + 1);
                break len;
            }
            let n = self.reader.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(CarmineError::Protocol(
                    "connection closed waiting for snapshot".to_string(),
                ));
            }
        };

        // Payload
        while self.read_buf.len() < payload_len {
            let n = self.reader.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(CarmineError::Protocol(
                    "connection closed during snapshot transfer".to_string(),
                ));
            }
        }
        Ok(self.read_buf.split_to(payload_len).freeze())
    }
}
