//! Command handling
//!
//! Per-connection read/dispatch/reply loop. The same dispatcher serves two
//! stream modes: client connections, which get a reply per request, and the
//! replication stream on a replica, which is applied silently.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::{CarmineError, Result};
use crate::protocol::{encode_to_bytes, Frame};
use crate::replication::ReplicationRole;
use crate::server::connection::Connection;
use crate::server::ServerContext;

/// Who the decoded stream belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// A client connection; every request gets a reply
    Client,
    /// The primary's command stream on a replica; replies are suppressed
    /// except for `REPLCONF GETACK *`
    Replication,
}

impl StreamMode {
    fn replies(self) -> bool {
        matches!(self, StreamMode::Client)
    }
}

/// A parsed `SET` command
#[derive(Debug, PartialEq)]
struct SetCommand {
    key: String,
    value: Bytes,
    ttl: Duration,
}

/// Per-connection handler
pub struct Handler {
    connection: Connection,
    ctx: Arc<ServerContext>,
}

impl Handler {
    /// Wrap a connection with the shared node state
    pub fn new(connection: Connection, ctx: Arc<ServerContext>) -> Self {
        Self { connection, ctx }
    }

    /// Serve a client connection until EOF or a fatal error
    pub async fn run(mut self) -> Result<()> {
        loop {
            let frame = match self.connection.read_frame().await? {
                Some(frame) => frame,
                None => return Ok(()),
            };

            match frame {
                Frame::Array(items) => self.dispatch(items, StreamMode::Client).await?,
                Frame::Simple(s) => {
                    debug!("simple string outside a command: {:?}", s);
                }
                Frame::Error(s) => {
                    debug!("error frame outside a command: {:?}", s);
                }
                _ => {
                    self.connection
                        .write_frame(&Frame::error("invalid command"))
                        .await?;
                }
            }
        }
    }

    /// Consume the primary's command stream on a replica, applying each
    /// command silently and advancing the replication offset by its wire
    /// length. `REPLCONF` frames count toward the offset like writes do.
    pub async fn run_replication(mut self) -> Result<()> {
        loop {
            let (frame, wire_len) = match self.connection.read_frame_counted().await? {
                Some(pair) => pair,
                None => return Ok(()),
            };

            match frame {
                Frame::Array(items) => {
                    self.dispatch(items, StreamMode::Replication).await?;
                    // The GETACK reply above reports the offset accumulated
                    // before this frame; count the frame afterwards
                    self.ctx.replication.increment_offset(wire_len);
                }
                other => {
                    debug!("non-command frame on replication stream: {other:?}");
                }
            }
        }
    }

    async fn dispatch(&mut self, items: Vec<Frame>, mode: StreamMode) -> Result<()> {
        let args = command_args(items)?;
        let verb = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        debug!("{verb} command ({} args)", args.len());

        match verb.as_str() {
            "PING" => {
                if mode.replies() {
                    self.connection.write_frame(&Frame::simple("PONG")).await?;
                }
                Ok(())
            }
            "ECHO" => self.cmd_echo(&args, mode).await,
            "SET" => self.cmd_set(&args, mode).await,
            "GET" => self.cmd_get(&args, mode).await,
            "INFO" => self.cmd_info(mode).await,
            "REPLCONF" => self.cmd_replconf(&args, mode).await,
            "PSYNC" => self.cmd_psync(&args, mode).await,
            _ => {
                if mode.replies() {
                    // Simple string, not an error frame, for compatibility
                    self.connection
                        .write_frame(&Frame::simple("ERR unknown command"))
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn cmd_echo(&mut self, args: &[Bytes], mode: StreamMode) -> Result<()> {
        if args.len() < 2 {
            return self
                .fail(mode, "wrong number of arguments for 'echo' command")
                .await;
        }
        if mode.replies() {
            self.connection
                .write_frame(&Frame::bulk(args[1].clone()))
                .await?;
        }
        Ok(())
    }

    async fn cmd_set(&mut self, args: &[Bytes], mode: StreamMode) -> Result<()> {
        let cmd = match parse_set(args) {
            Ok(cmd) => cmd,
            Err(e) => return self.fail(mode, &e.to_string()).await,
        };
        self.ctx.store.set(cmd.key, cmd.value, cmd.ttl);

        if mode.replies() {
            self.connection.write_frame(&Frame::simple("OK")).await?;

            // Fan the write out to attached replicas; replies never wait for
            // replica acknowledgement
            if self.ctx.replication.role() == ReplicationRole::Primary {
                let payload = encode_to_bytes(&bulk_array(args)).freeze();
                self.ctx.replication.increment_offset(payload.len() as u64);
                self.ctx.replicas.propagate(payload).await;
            }
        }
        Ok(())
    }

    async fn cmd_get(&mut self, args: &[Bytes], mode: StreamMode) -> Result<()> {
        if args.len() != 2 {
            return self
                .fail(mode, "wrong number of arguments for 'get' command")
                .await;
        }
        let key = String::from_utf8_lossy(&args[1]);
        let reply = match self.ctx.store.get(&key) {
            Some(value) => Frame::bulk(value),
            None => Frame::null(),
        };
        if mode.replies() {
            self.connection.write_frame(&reply).await?;
        }
        Ok(())
    }

    async fn cmd_info(&mut self, mode: StreamMode) -> Result<()> {
        let replication = &self.ctx.replication;
        let mut lines = vec![
            "Replication".to_string(),
            format!("role:{}", replication.role().as_wire_str()),
        ];
        if replication.role() == ReplicationRole::Primary {
            lines.push(format!("master_replid:{}", replication.replid()));
            lines.push(format!("master_repl_offset:{}", replication.repl_offset()));
        }
        if mode.replies() {
            self.connection
                .write_frame(&Frame::bulk(lines.join("\r\n")))
                .await?;
        }
        Ok(())
    }

    async fn cmd_replconf(&mut self, args: &[Bytes], mode: StreamMode) -> Result<()> {
        if args.len() < 3 || args.len() % 2 == 0 {
            return self
                .fail(mode, "wrong number of arguments for 'replconf' command")
                .await;
        }
        let pairs: Vec<(String, String)> = args[1..]
            .chunks(2)
            .map(|pair| {
                (
                    String::from_utf8_lossy(&pair[0]).to_string(),
                    String::from_utf8_lossy(&pair[1]).to_string(),
                )
            })
            .collect();

        // GETACK replies to the caller regardless of role, and is the one
        // reply a replica makes on the replication stream
        if pairs[0].0.eq_ignore_ascii_case("getack") && pairs[0].1 == "*" {
            let offset = self.ctx.replication.repl_offset().to_string();
            self.connection
                .write_frame(&Frame::command(&["REPLCONF", "ACK", offset.as_str()]))
                .await?;
            return Ok(());
        }

        // An ACK is a pure acknowledgement: nothing to record, nothing to say
        if pairs[0].0.eq_ignore_ascii_case("ack") {
            debug!("replica acknowledged offset {}", pairs[0].1);
            return Ok(());
        }

        if self.ctx.replication.role() != ReplicationRole::Primary {
            return self.fail(mode, "replconf is only valid on a primary").await;
        }
        let Some(peer) = self.connection.peer_addr else {
            return self.fail(mode, "peer address unavailable").await;
        };

        let result = self.ctx.replicas.configure(
            &peer.to_string(),
            &peer.ip().to_string(),
            &pairs,
            self.connection.writer_handle(),
        );
        match result {
            Ok(()) => {
                if mode.replies() {
                    self.connection.write_frame(&Frame::simple("OK")).await?;
                }
                Ok(())
            }
            Err(e) => self.fail(mode, &e.to_string()).await,
        }
    }

    async fn cmd_psync(&mut self, args: &[Bytes], mode: StreamMode) -> Result<()> {
        if args.len() < 3 {
            return self
                .fail(mode, "wrong number of arguments for 'psync' command")
                .await;
        }
        if self.ctx.replication.role() != ReplicationRole::Primary {
            return self.fail(mode, "psync is only valid on a primary").await;
        }
        if !self.ctx.replication.has_capability("psync2") {
            return self.fail(mode, "unsupported psync capabilities").await;
        }
        if !mode.replies() {
            return Ok(());
        }
        let Some(peer) = self.connection.peer_addr else {
            return self.fail(mode, "peer address unavailable").await;
        };

        // Every synchronization is full: announce our identity, re-key the
        // handshake record to the advertised endpoint and stream the snapshot
        let fullresync = format!(
            "FULLRESYNC {} {}",
            self.ctx.replication.replid(),
            self.ctx.replication.repl_offset()
        );
        self.connection
            .write_frame(&Frame::simple(fullresync))
            .await?;

        let key = self.ctx.replicas.attach(
            &peer.to_string(),
            &peer.ip().to_string(),
            peer.port(),
            self.connection.writer_handle(),
        );
        self.connection.write_snapshot(&self.ctx.snapshot).await?;
        info!("replica {key} attached, {} snapshot bytes sent", self.ctx.snapshot.len());
        Ok(())
    }

    /// Report a command failure: replied as an error frame to clients,
    /// logged on the silent replication stream
    async fn fail(&mut self, mode: StreamMode, msg: &str) -> Result<()> {
        if mode.replies() {
            self.connection
                .write_frame(&Frame::error(msg.to_string()))
                .await?;
        } else {
            warn!("replicated command rejected: {msg}");
        }
        Ok(())
    }
}

/// Extract the bulk-string arguments of a command array.
///
/// A command is a non-empty sequence of bulk strings; anything else on a
/// decoded array is a protocol violation and fatal to the connection.
fn command_args(items: Vec<Frame>) -> Result<Vec<Bytes>> {
    if items.is_empty() {
        return Err(CarmineError::Protocol("empty command array".to_string()));
    }
    items
        .into_iter()
        .map(|item| {
            item.into_bytes()
                .ok_or_else(|| CarmineError::Protocol("nil command argument".to_string()))
        })
        .collect()
}

/// Rebuild the wire array for a command's arguments
fn bulk_array(args: &[Bytes]) -> Frame {
    Frame::Array(args.iter().cloned().map(|b| Frame::Bulk(Some(b))).collect())
}

/// Parse `SET key value [PX ms]`
fn parse_set(args: &[Bytes]) -> Result<SetCommand> {
    if args.len() != 3 && args.len() != 5 {
        return Err(CarmineError::Command(
            "wrong number of arguments for 'set' command".to_string(),
        ));
    }
    let key = String::from_utf8_lossy(&args[1]).to_string();
    let value = args[2].clone();

    let ttl = if args.len() == 5 {
        if !args[3].eq_ignore_ascii_case(b"PX") {
            return Err(CarmineError::Command(
                "syntax error in 'set' command".to_string(),
            ));
        }
        let ms: u64 = std::str::from_utf8(&args[4])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                CarmineError::Command(format!(
                    "invalid expiration '{}'",
                    String::from_utf8_lossy(&args[4])
                ))
            })?;
        Duration::from_millis(ms)
    } else {
        Duration::ZERO
    };

    Ok(SetCommand { key, value, ttl })
}
