//! Server-side modules
//!
//! Shared node state plus the listener, connection and command handling
//! layers built on top of it.

pub mod connection;
pub mod handler;
pub mod listener;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;

use crate::config::Config;
use crate::replication::primary::ReplicaRegistry;
use crate::replication::ReplicationState;
use crate::storage::Store;

pub use listener::Server;

/// Fixed snapshot blob served to replicas after `FULLRESYNC`, base64
/// encoded. The contents are opaque to this server; replicas discard them.
const SNAPSHOT_BASE64: &str = "UkVESVMwMDEx+glyZWRpcy12ZXIFNy4yLjD6CnJlZGlzLWJpdHPAQPoFY3RpbWXCbQi8ZfoIdXNlZC1tZW3CsMQQAPoIYW9mLWJhc2XAAP/wbjv+wP9aog==";

/// Shared state owned by a node and visible to every connection task
#[derive(Debug)]
pub struct ServerContext {
    /// Startup configuration
    pub config: Config,

    /// Port the listener actually bound (differs from the configured port
    /// when that was 0)
    pub listen_port: u16,

    /// The keyed store
    pub store: Store,

    /// Replication identity, role and offset
    pub replication: ReplicationState,

    /// Replicas attached to this node (primaries only)
    pub replicas: ReplicaRegistry,

    /// Decoded snapshot payload sent on full synchronization
    pub snapshot: Bytes,
}

impl ServerContext {
    /// Assemble the node state; decodes the snapshot blob once
    pub fn new(config: Config, listen_port: u16) -> Self {
        let snapshot = Bytes::from(
            BASE64
                .decode(SNAPSHOT_BASE64)
                .expect("embedded snapshot blob is valid base64"),
        );
        Self {
            config,
            listen_port,
            store: Store::new(),
            replication: ReplicationState::new(),
            replicas: ReplicaRegistry::new(),
            snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_blob_decodes() {
        let ctx = ServerContext::new(Config::default(), 6379);
        assert!(!ctx.snapshot.is_empty());
        // The blob carries the cache-server snapshot magic
        assert!(ctx.snapshot.starts_with(b"REDIS"));
    }

    #[test]
    fn test_context_starts_as_primary_with_empty_registry() {
        let ctx = ServerContext::new(Config::default(), 6379);
        assert_eq!(
            ctx.replication.role(),
            crate::replication::ReplicationRole::Primary
        );
        assert!(ctx.replicas.is_empty());
        assert!(ctx.store.is_empty());
    }
}
