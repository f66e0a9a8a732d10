//! Replica-side replication
//!
//! Dials the primary, walks the fixed handshake, discards the snapshot and
//! then hands the very same buffered connection to a background task that
//! applies the primary's command stream silently.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::error::{CarmineError, Result};
use crate::protocol::Frame;
use crate::server::connection::Connection;
use crate::server::handler::Handler;
use crate::server::ServerContext;

/// Attach this node to a primary. Runs once at startup, synchronously,
/// before the local listener starts accepting traffic; any deviation in the
/// handshake is fatal.
pub async fn sync_with_primary(ctx: Arc<ServerContext>, host: &str, port: u16) -> Result<()> {
    let addr = format!("{host}:{port}");
    ctx.replication.become_replica();

    let mut conn = Connection::connect(&addr).await.map_err(|e| {
        CarmineError::Replication(format!("connecting to primary {addr} failed: {e}"))
    })?;

    send_and_expect(&mut conn, &["PING"], "PONG").await?;
    debug!("received PONG from primary ({addr})");

    let listen_port = ctx.listen_port.to_string();
    send_and_expect(
        &mut conn,
        &["REPLCONF", "listening-port", listen_port.as_str()],
        "OK",
    )
    .await?;
    send_and_expect(&mut conn, &["REPLCONF", "capa", "psync2"], "OK").await?;

    conn.write_frame(&Frame::command(&["PSYNC", "?", "-1"])).await?;
    let reply = read_simple(&mut conn).await?;
    check_fullresync(&reply)?;
    debug!("received {reply} from primary ({addr})");

    // The snapshot is opaque; consume and drop it. The connection's read
    // buffer carries over, so command bytes the primary sent right behind
    // the snapshot are not lost.
    let snapshot = conn.read_snapshot().await?;
    info!("synchronized with primary {addr}, discarded {} snapshot bytes", snapshot.len());

    tokio::spawn(async move {
        match Handler::new(conn, ctx).run_replication().await {
            Ok(()) => info!("replication stream from {addr} ended"),
            Err(e) => error!("replication stream from {addr} failed: {e}"),
        }
    });

    Ok(())
}

/// Validate a `PSYNC` reply: three space-separated tokens led by
/// `FULLRESYNC`. The replid and offset values are ignored.
fn check_fullresync(reply: &str) -> Result<()> {
    let mut tokens = reply.split(' ');
    match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
        (Some("FULLRESYNC"), Some(_), Some(_), None) => Ok(()),
        _ => Err(CarmineError::Replication(format!(
            "unexpected PSYNC reply '{reply}'"
        ))),
    }
}

/// Send one handshake command and require an exact simple-string reply
async fn send_and_expect(conn: &mut Connection, cmd: &[&str], expected: &str) -> Result<()> {
    conn.write_frame(&Frame::command(cmd)).await?;
    let reply = read_simple(conn).await?;
    if reply != expected {
        return Err(CarmineError::Replication(format!(
            "primary answered '{reply}' to {} (expected '{expected}')",
            cmd.join(" ")
        )));
    }
    Ok(())
}

/// Read one frame and require it to be a simple string
async fn read_simple(conn: &mut Connection) -> Result<String> {
    match conn.read_frame().await? {
        Some(Frame::Simple(s)) => Ok(String::from_utf8_lossy(&s).to_string()),
        Some(other) => Err(CarmineError::Replication(format!(
            "unexpected handshake frame {other:?}"
        ))),
        None => Err(CarmineError::Replication(
            "primary closed the connection during handshake".to_string(),
        )),
    }
}
