//! # carmine
//!
//! An in-memory key/value cache server speaking the Redis RESP2 wire
//! protocol, with primary/replica replication.
//!
//! A node starts as a primary: it accepts writes and fans them out to every
//! attached replica. Started with `--replicaof`, it instead performs the
//! fixed handshake against a primary, consumes the initial snapshot, and
//! applies the streamed command feed silently while still serving local
//! reads.
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`protocol`] | RESP2 frames, streaming parser, encoder |
//! | [`storage`] | expiring in-memory key/value store |
//! | [`server`] | listener, connections, command dispatch |
//! | [`replication`] | identity/offset state, primary fan-out, replica handshake |

pub mod config;
pub mod error;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod storage;

pub use config::Config;
pub use error::{CarmineError, Result};
pub use server::{Server, ServerContext};
