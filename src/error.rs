//! Error types for carmine
//!
//! One crate-wide error enum covering the protocol, command, replication,
//! configuration and I/O failure classes. Uses `thiserror` for ergonomic
//! error definitions.

use std::io;
use thiserror::Error;

/// Main error type for carmine operations
#[derive(Error, Debug)]
pub enum CarmineError {
    /// Wire protocol parsing or framing error; fatal to the connection
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Command arity or argument value error; replied to the client, the
    /// connection lives on
    #[error("{0}")]
    Command(String),

    /// Replication handshake or propagation error
    #[error("replication error: {0}")]
    Replication(String),

    /// Configuration parsing or validation error
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for carmine operations
pub type Result<T> = std::result::Result<T, CarmineError>;

impl CarmineError {
    /// Returns true if this error should close the connection
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CarmineError::Command(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_errors_are_recoverable() {
        assert!(!CarmineError::Command("wrong number of arguments for 'get' command".into())
            .is_fatal());
    }

    #[test]
    fn test_protocol_and_io_errors_are_fatal() {
        assert!(CarmineError::Protocol("bad header".into()).is_fatal());
        assert!(CarmineError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone")).is_fatal());
        assert!(CarmineError::Replication("handshake refused".into()).is_fatal());
    }

    #[test]
    fn test_command_error_displays_bare_message() {
        let e = CarmineError::Command("wrong number of arguments for 'echo' command".into());
        assert_eq!(
            e.to_string(),
            "wrong number of arguments for 'echo' command"
        );
    }
}
