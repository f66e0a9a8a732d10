//! Replication
//!
//! Primary/replica replication: shared replication identity and offset,
//! the primary-side replica registry, and the replica-side handshake and
//! streaming loop.

pub mod primary;
pub mod replica;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Replication offset - position in the replicated command stream, in wire
/// bytes
pub type ReplicationOffset = u64;

/// Length of a replication id in characters
pub const REPLICATION_ID_LEN: usize = 40;

/// Role a node plays in replication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationRole {
    /// Accepts writes and fans them out to attached replicas
    #[default]
    Primary,
    /// Read-only mirror fed from a primary
    Replica,
}

impl ReplicationRole {
    /// Textual projection used on the wire (`INFO` output)
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            ReplicationRole::Primary => "primary",
            ReplicationRole::Replica => "replica",
        }
    }
}

/// Replication id - unique identifier assigned to a node at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationId(String);

impl ReplicationId {
    /// Generate a new random replication id: exactly 40 characters drawn
    /// from `[0-9A-Za-z]`
    pub fn generate() -> Self {
        let id = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(REPLICATION_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    /// Get the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ReplicationId {
    fn default() -> Self {
        Self::generate()
    }
}

/// Shared replication state for a node
#[derive(Debug)]
pub struct ReplicationState {
    /// Current role; starts as primary, moves to replica at most once
    role: RwLock<ReplicationRole>,

    /// Replication id, stable for the node's lifetime
    replid: ReplicationId,

    /// Replicated-bytes offset: on a primary the bytes propagated, on a
    /// replica the bytes consumed from its primary
    offset: AtomicU64,

    /// Capabilities this node advertises to handshaking replicas
    capabilities: Vec<String>,
}

impl ReplicationState {
    /// Create replication state for a fresh node (primary role)
    pub fn new() -> Self {
        Self {
            role: RwLock::new(ReplicationRole::Primary),
            replid: ReplicationId::generate(),
            offset: AtomicU64::new(0),
            capabilities: vec!["psync2".to_string(), "eof".to_string()],
        }
    }

    /// Current role
    pub fn role(&self) -> ReplicationRole {
        *self.role.read().unwrap()
    }

    /// One-shot transition to the replica role
    pub fn become_replica(&self) {
        *self.role.write().unwrap() = ReplicationRole::Replica;
    }

    /// The node's replication id
    pub fn replid(&self) -> &str {
        self.replid.as_str()
    }

    /// Current replication offset
    pub fn repl_offset(&self) -> ReplicationOffset {
        self.offset.load(Ordering::SeqCst)
    }

    /// Advance the replication offset by `n` wire bytes
    pub fn increment_offset(&self, n: u64) {
        self.offset.fetch_add(n, Ordering::SeqCst);
    }

    /// Whether this node advertises the given capability
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c == name)
    }
}

impl Default for ReplicationState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_id_shape() {
        let id = ReplicationId::generate();
        assert_eq!(id.as_str().len(), REPLICATION_ID_LEN);
        assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_replication_ids_are_random() {
        // Two fresh nodes must not share an identity
        assert_ne!(
            ReplicationId::generate().as_str(),
            ReplicationId::generate().as_str()
        );
    }

    #[test]
    fn test_state_starts_as_primary() {
        let state = ReplicationState::new();
        assert_eq!(state.role(), ReplicationRole::Primary);
        assert_eq!(state.repl_offset(), 0);
    }

    #[test]
    fn test_become_replica() {
        let state = ReplicationState::new();
        state.become_replica();
        assert_eq!(state.role(), ReplicationRole::Replica);
        assert_eq!(state.role().as_wire_str(), "replica");
    }

    #[test]
    fn test_offset_accumulates() {
        let state = ReplicationState::new();
        state.increment_offset(31);
        state.increment_offset(37);
        assert_eq!(state.repl_offset(), 68);
    }

    #[test]
    fn test_advertised_capabilities() {
        let state = ReplicationState::new();
        assert!(state.has_capability("psync2"));
        assert!(state.has_capability("eof"));
        assert!(!state.has_capability("diskless"));
    }

    #[test]
    fn test_replid_is_stable() {
        let state = ReplicationState::new();
        let before = state.replid().to_string();
        state.become_replica();
        state.increment_offset(100);
        assert_eq!(state.replid(), before);
    }
}
