//! Primary-side replication
//!
//! Tracks attached replicas and fans written commands out to them. Records
//! are keyed by the replica's advertised `host:port`; while a handshake is
//! still in progress the record is keyed by the ephemeral remote address of
//! the inbound socket and re-keyed atomically when `PSYNC` completes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{CarmineError, Result};
use crate::protocol::{encode_to_bytes, Frame};
use crate::server::connection::SharedWriter;

/// Link lifecycle of one replica connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaLinkState {
    /// First REPLCONF seen, nothing advertised yet
    Pending,
    /// Listening port known, PSYNC not completed
    Configured,
    /// Snapshot sent, socket retained for propagation
    Attached,
    /// Last propagation write failed and the re-dial failed too; the record
    /// stays and is re-dialed on the next propagation
    Dead,
}

/// State kept per replica on a primary
#[derive(Debug, Clone)]
pub struct ReplicaRecord {
    /// Replica host as observed on the inbound socket
    pub host: String,

    /// Advertised listening port (0 until `REPLCONF listening-port`)
    pub port: u16,

    /// Capabilities advertised via `REPLCONF capa`
    pub capabilities: Vec<String>,

    /// Link lifecycle state
    pub state: ReplicaLinkState,

    /// Live socket used for propagation
    conn: Option<SharedWriter>,
}

impl ReplicaRecord {
    fn new(host: String) -> Self {
        Self {
            host,
            port: 0,
            capabilities: Vec::new(),
            state: ReplicaLinkState::Pending,
            conn: None,
        }
    }
}

/// Registry of replicas attached to this primary.
///
/// One mutex covers add, rebind, re-key and iteration snapshot; propagation
/// writes happen outside the lock so a slow replica cannot block the
/// dispatcher.
#[derive(Debug, Default)]
pub struct ReplicaRegistry {
    records: Mutex<HashMap<String, ReplicaRecord>>,
}

impl ReplicaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `REPLCONF` from the socket keyed by `ephemeral_key`,
    /// creating the record if this is the first one, and rebind the
    /// record's socket to the current connection.
    pub fn configure(
        &self,
        ephemeral_key: &str,
        peer_host: &str,
        pairs: &[(String, String)],
        conn: SharedWriter,
    ) -> Result<()> {
        // Validate before mutating so a malformed pair leaves no trace
        let mut port = None;
        let mut capabilities = Vec::new();
        for (key, value) in pairs {
            match key.to_ascii_lowercase().as_str() {
                "listening-port" => {
                    let parsed: u16 = value.parse().map_err(|_| {
                        CarmineError::Command(format!("invalid listening-port '{value}'"))
                    })?;
                    port = Some(parsed);
                }
                "capa" => capabilities.push(value.clone()),
                // Unknown pairs are accepted and ignored
                _ => {}
            }
        }

        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(ephemeral_key.to_string())
            .or_insert_with(|| ReplicaRecord::new(peer_host.to_string()));
        if let Some(port) = port {
            record.port = port;
            if record.state == ReplicaLinkState::Pending {
                record.state = ReplicaLinkState::Configured;
            }
        }
        record.capabilities.extend(capabilities);
        record.conn = Some(conn);
        Ok(())
    }

    /// Complete a handshake: re-key the record from the ephemeral remote
    /// address to the stable `host:port` endpoint and retain the socket for
    /// propagation. Fabricates a record if no `REPLCONF` preceded the
    /// `PSYNC`. Returns the stable key. Endpoint collisions resolve
    /// last-writer-wins.
    pub fn attach(
        &self,
        ephemeral_key: &str,
        peer_host: &str,
        fallback_port: u16,
        conn: SharedWriter,
    ) -> String {
        let mut records = self.records.lock().unwrap();
        let mut record = records
            .remove(ephemeral_key)
            .unwrap_or_else(|| ReplicaRecord::new(peer_host.to_string()));
        record.host = peer_host.to_string();
        if record.port == 0 {
            record.port = fallback_port;
        }
        record.state = ReplicaLinkState::Attached;
        record.conn = Some(conn);

        let key = format!("{}:{}", record.host, record.port);
        records.insert(key.clone(), record);
        key
    }

    /// Propagate one encoded command to every attached replica.
    ///
    /// Best-effort and at-least-once: a failed write triggers a single
    /// re-dial of the replica's advertised endpoint and one retry; on
    /// failure the write is dropped for that replica and its record is kept
    /// for the next attempt. Per-replica ordering follows the local apply
    /// order; there is no cross-replica ordering.
    pub async fn propagate(&self, payload: Bytes) {
        let targets: Vec<(String, String, u16, Option<SharedWriter>)> = {
            let records = self.records.lock().unwrap();
            records
                .iter()
                .filter(|(_, r)| {
                    matches!(r.state, ReplicaLinkState::Attached | ReplicaLinkState::Dead)
                })
                .map(|(k, r)| (k.clone(), r.host.clone(), r.port, r.conn.clone()))
                .collect()
        };

        for (key, host, port, conn) in targets {
            let mut delivered = false;

            if let Some(conn) = conn {
                match conn.lock().await.write_all(&payload).await {
                    Ok(()) => delivered = true,
                    Err(e) => {
                        warn!("write to replica {key} failed: {e}, trying to reconnect");
                    }
                }
            }

            if !delivered {
                delivered = self.redial_and_send(&key, &host, port, &payload).await;
            }

            if delivered {
                debug!("propagated {} bytes to replica {key}", payload.len());
            } else {
                self.mark_dead(&key);
            }
        }
    }

    /// One reconnection attempt: dial the advertised endpoint, retry the
    /// write once and adopt the fresh socket on success
    async fn redial_and_send(&self, key: &str, host: &str, port: u16, payload: &Bytes) -> bool {
        let stream = match TcpStream::connect((host, port)).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("reconnect to replica {key} failed: {e}");
                return false;
            }
        };
        let (read_half, write_half) = stream.into_split();
        // The propagation path only writes; acks on the old socket keep
        // flowing to the connection handler that owns it
        drop(read_half);

        let fresh: SharedWriter = Arc::new(tokio::sync::Mutex::new(write_half));
        if let Err(e) = fresh.lock().await.write_all(payload).await {
            warn!("write to reconnected replica {key} failed: {e}");
            return false;
        }

        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(key) {
            record.conn = Some(fresh);
            record.state = ReplicaLinkState::Attached;
        }
        true
    }

    /// Write a `REPLCONF GETACK *` probe to every attached replica. Replies
    /// arrive on the propagation sockets' read sides and never gate writes.
    pub async fn request_acks(&self) {
        let payload = encode_to_bytes(&Frame::command(&["REPLCONF", "GETACK", "*"])).freeze();
        let targets: Vec<(String, SharedWriter)> = {
            let records = self.records.lock().unwrap();
            records
                .iter()
                .filter(|(_, r)| r.state == ReplicaLinkState::Attached)
                .filter_map(|(k, r)| r.conn.clone().map(|c| (k.clone(), c)))
                .collect()
        };
        for (key, conn) in targets {
            if let Err(e) = conn.lock().await.write_all(&payload).await {
                warn!("GETACK probe to replica {key} failed: {e}");
            }
        }
    }

    fn mark_dead(&self, key: &str) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(key) {
            record.state = ReplicaLinkState::Dead;
            record.conn = None;
        }
    }

    /// Number of records, ephemeral handshake entries included
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Whether the registry holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one record by key
    pub fn lookup(&self, key: &str) -> Option<ReplicaRecord> {
        self.records.lock().unwrap().get(key).cloned()
    }

    /// All record keys
    pub fn keys(&self) -> Vec<String> {
        self.records.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn writer_pair() -> (SharedWriter, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        drop(read_half);
        (
            Arc::new(tokio::sync::Mutex::new(write_half)),
            client.await.unwrap(),
        )
    }

    fn pairs(kv: &[(&str, &str)]) -> Vec<(String, String)> {
        kv.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_configure_creates_and_updates_record() {
        let registry = ReplicaRegistry::new();
        let (conn, _held) = writer_pair().await;

        registry
            .configure(
                "127.0.0.1:50311",
                "127.0.0.1",
                &pairs(&[("listening-port", "6395")]),
                conn.clone(),
            )
            .unwrap();
        let record = registry.lookup("127.0.0.1:50311").unwrap();
        assert_eq!(record.port, 6395);
        assert_eq!(record.state, ReplicaLinkState::Configured);

        registry
            .configure(
                "127.0.0.1:50311",
                "127.0.0.1",
                &pairs(&[("capa", "eof"), ("capa", "psync2")]),
                conn,
            )
            .unwrap();
        let record = registry.lookup("127.0.0.1:50311").unwrap();
        assert!(record.capabilities.contains(&"eof".to_string()));
        assert!(record.capabilities.contains(&"psync2".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_configure_rejects_bad_listening_port() {
        let registry = ReplicaRegistry::new();
        let (conn, _held) = writer_pair().await;
        let err = registry
            .configure(
                "127.0.0.1:50312",
                "127.0.0.1",
                &pairs(&[("listening-port", "not-a-port")]),
                conn,
            )
            .unwrap_err();
        assert!(!err.is_fatal());
        // A rejected REPLCONF must not leave a half-built record behind
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_configure_ignores_unknown_pairs() {
        let registry = ReplicaRegistry::new();
        let (conn, _held) = writer_pair().await;
        registry
            .configure(
                "127.0.0.1:50313",
                "127.0.0.1",
                &pairs(&[("version", "7.2"), ("listening-port", "7001")]),
                conn,
            )
            .unwrap();
        assert_eq!(registry.lookup("127.0.0.1:50313").unwrap().port, 7001);
    }

    #[tokio::test]
    async fn test_attach_rekeys_to_advertised_endpoint() {
        let registry = ReplicaRegistry::new();
        let (conn, _held) = writer_pair().await;
        registry
            .configure(
                "127.0.0.1:50314",
                "127.0.0.1",
                &pairs(&[("listening-port", "6395")]),
                conn.clone(),
            )
            .unwrap();

        let key = registry.attach("127.0.0.1:50314", "127.0.0.1", 50314, conn);
        assert_eq!(key, "127.0.0.1:6395");
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("127.0.0.1:50314").is_none());

        let record = registry.lookup(&key).unwrap();
        assert_eq!(record.state, ReplicaLinkState::Attached);
        assert_eq!(record.port, 6395);
    }

    #[tokio::test]
    async fn test_attach_fabricates_missing_record() {
        let registry = ReplicaRegistry::new();
        let (conn, _held) = writer_pair().await;
        let key = registry.attach("127.0.0.1:50315", "127.0.0.1", 50315, conn);
        assert_eq!(key, "127.0.0.1:50315");
        assert_eq!(
            registry.lookup(&key).unwrap().state,
            ReplicaLinkState::Attached
        );
    }

    #[tokio::test]
    async fn test_attach_last_writer_wins_on_endpoint_collision() {
        let registry = ReplicaRegistry::new();
        let (first, _held_a) = writer_pair().await;
        let (second, _held_b) = writer_pair().await;

        registry
            .configure(
                "127.0.0.1:50316",
                "127.0.0.1",
                &pairs(&[("listening-port", "6400"), ("capa", "eof")]),
                first.clone(),
            )
            .unwrap();
        registry.attach("127.0.0.1:50316", "127.0.0.1", 50316, first);

        registry
            .configure(
                "127.0.0.1:50317",
                "127.0.0.1",
                &pairs(&[("listening-port", "6400"), ("capa", "psync2")]),
                second.clone(),
            )
            .unwrap();
        registry.attach("127.0.0.1:50317", "127.0.0.1", 50317, second);

        assert_eq!(registry.len(), 1);
        let record = registry.lookup("127.0.0.1:6400").unwrap();
        assert_eq!(record.capabilities, vec!["psync2".to_string()]);
    }

    #[tokio::test]
    async fn test_propagate_writes_to_attached_replica() {
        let registry = ReplicaRegistry::new();
        let (conn, mut held) = writer_pair().await;
        registry
            .configure(
                "127.0.0.1:50318",
                "127.0.0.1",
                &pairs(&[("listening-port", "6401")]),
                conn.clone(),
            )
            .unwrap();
        registry.attach("127.0.0.1:50318", "127.0.0.1", 50318, conn);

        let payload = encode_to_bytes(&Frame::command(&["SET", "foo", "bar"])).freeze();
        registry.propagate(payload.clone()).await;

        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; payload.len()];
        held.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_propagate_skips_mid_handshake_records() {
        let registry = ReplicaRegistry::new();
        let (conn, mut held) = writer_pair().await;
        registry
            .configure(
                "127.0.0.1:50319",
                "127.0.0.1",
                &pairs(&[("listening-port", "6402")]),
                conn,
            )
            .unwrap();

        let payload = encode_to_bytes(&Frame::command(&["SET", "foo", "bar"])).freeze();
        registry.propagate(payload).await;

        // Nothing may land on a socket still mid-handshake
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            held.read(&mut buf),
        )
        .await;
        assert!(read.is_err(), "expected no bytes before PSYNC completes");
    }

    #[tokio::test]
    async fn test_propagate_marks_unreachable_replica_dead_but_keeps_record() {
        let registry = ReplicaRegistry::new();
        let (conn, held) = writer_pair().await;
        // Advertised endpoint nobody listens on, and a socket that is gone
        let key = registry.attach("127.0.0.1:50320", "127.0.0.1", 1, conn);
        drop(held);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let payload = encode_to_bytes(&Frame::command(&["SET", "k", "v"])).freeze();
        registry.propagate(payload.clone()).await;
        // Give the peer's reset time to land, then force the failing write
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        registry.propagate(payload.clone()).await;
        registry.propagate(payload).await;

        let record = registry.lookup(&key).unwrap();
        assert_eq!(record.state, ReplicaLinkState::Dead);
        assert_eq!(registry.len(), 1);
    }
}
