//! Server configuration
//!
//! Runtime configuration assembled from command line flags and environment
//! variables by the binary entry point.

use crate::error::{CarmineError, Result};

/// Default listening port
pub const DEFAULT_PORT: u16 = 6379;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the listener to
    pub bind: String,

    /// Port to listen on
    pub port: u16,

    /// Primary to attach to as a replica, as `(host, port)`; `None` runs the
    /// node as a primary
    pub replica_of: Option<(String, u16)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            replica_of: None,
        }
    }
}

impl Config {
    /// The listener bind address in `host:port` form
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Parse a `--replicaof` value of the form `"<host> <port>"`.
///
/// The value must split on a single ASCII space into exactly two tokens, the
/// second being a valid port number.
pub fn parse_replica_of(value: &str) -> Result<(String, u16)> {
    let mut tokens = value.split(' ');
    let (host, port) = match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(host), Some(port), None) if !host.is_empty() => (host, port),
        _ => {
            return Err(CarmineError::Config(format!(
                "invalid replicaof value '{value}', use space separated <host> <port>"
            )))
        }
    };
    let port: u16 = port.parse().map_err(|_| {
        CarmineError::Config(format!("invalid replicaof port '{port}'"))
    })?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_replica_of_valid() {
        let (host, port) = parse_replica_of("127.0.0.1 6379").unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 6379);

        let (host, port) = parse_replica_of("primary.internal 7000").unwrap();
        assert_eq!(host, "primary.internal");
        assert_eq!(port, 7000);
    }

    #[test]
    fn test_parse_replica_of_rejects_wrong_token_count() {
        assert!(parse_replica_of("127.0.0.1").is_err());
        assert!(parse_replica_of("127.0.0.1 6379 extra").is_err());
        assert!(parse_replica_of("").is_err());
    }

    #[test]
    fn test_parse_replica_of_rejects_bad_port() {
        assert!(parse_replica_of("127.0.0.1 notaport").is_err());
        assert!(parse_replica_of("127.0.0.1 99999").is_err());
    }

    #[test]
    fn test_config_address() {
        let config = Config {
            bind: "0.0.0.0".into(),
            port: 6380,
            replica_of: None,
        };
        assert_eq!(config.address(), "0.0.0.0:6380");
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.replica_of.is_none());
    }
}
