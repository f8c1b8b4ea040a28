//! Driver Configuration
//!
//! Timeouts, buffer sizes and limits for a [`NetworkDriver`](crate::transport::NetworkDriver).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{NetworkError, Result};
use crate::transport::RECEIVE_SLOT_SIZE;

/// Default time between connection attempts
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;
/// Default number of connection attempts before giving up
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 60;
/// Default idle time before a connected peer is dropped
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 30_000;
/// Default receive buffer capacity (64 KiB)
pub const DEFAULT_STREAM_CAPACITY: usize = 64 * 1024;

/// Configuration for the NetworkDriver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Time without a handshake reply before the request is resent
    pub connect_timeout_ms: u64,
    /// Attempts (first send included) before a pending connection is dropped
    pub max_connect_attempts: u32,
    /// Time without any packet before a connected peer is dropped
    pub disconnect_timeout_ms: u64,
    /// Receive buffer capacity in bytes; 0 makes the buffer grow on demand
    pub initial_stream_capacity: usize,
    /// Upper bound on live connections; 0 means unlimited
    pub max_connections: usize,
    /// Initial per-connection event slots
    pub event_queue_capacity: usize,
    /// Start value for the session token counter; random when unset
    pub session_token_seed: Option<u16>,
    pub socket_receive_buffer_size: usize,
    pub socket_send_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            initial_stream_capacity: DEFAULT_STREAM_CAPACITY,
            max_connections: 0,
            event_queue_capacity: 8,
            session_token_seed: None,
            socket_receive_buffer_size: 256 * 1024,
            socket_send_buffer_size: 256 * 1024,
        }
    }
}

impl NetworkConfig {
    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json(content: &str) -> Result<Self> {
        let config: NetworkConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NetworkError::Config(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    /// Defaults overridden by `TIDENET_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(val) = env_parse::<u64>("TIDENET_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout_ms = val;
        }
        if let Some(val) = env_parse::<u32>("TIDENET_MAX_CONNECT_ATTEMPTS")? {
            config.max_connect_attempts = val;
        }
        if let Some(val) = env_parse::<u64>("TIDENET_DISCONNECT_TIMEOUT_MS")? {
            config.disconnect_timeout_ms = val;
        }
        if let Some(val) = env_parse::<usize>("TIDENET_STREAM_CAPACITY")? {
            config.initial_stream_capacity = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the driver cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(NetworkError::Config(
                "connect_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.max_connect_attempts == 0 {
            return Err(NetworkError::Config(
                "max_connect_attempts must be at least 1".into(),
            ));
        }
        if self.disconnect_timeout_ms == 0 {
            return Err(NetworkError::Config(
                "disconnect_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.initial_stream_capacity != 0 && self.initial_stream_capacity < RECEIVE_SLOT_SIZE {
            return Err(NetworkError::Config(format!(
                "initial_stream_capacity must be 0 or at least {} bytes",
                RECEIVE_SLOT_SIZE
            )));
        }
        if self.event_queue_capacity == 0 {
            return Err(NetworkError::Config(
                "event_queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| NetworkError::Config(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.connect_timeout_ms, 1000);
        assert_eq!(config.max_connect_attempts, 60);
        assert_eq!(config.disconnect_timeout_ms, 30_000);
        assert_eq!(config.initial_stream_capacity, 64 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = NetworkConfig::from_json(r#"{ "connect_timeout_ms": 250 }"#).unwrap();
        assert_eq!(config.connect_timeout_ms, 250);
        assert_eq!(config.max_connect_attempts, DEFAULT_MAX_CONNECT_ATTEMPTS);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(NetworkConfig::from_json(r#"{ "max_connect_attempts": 0 }"#).is_err());
        assert!(NetworkConfig::from_json(r#"{ "initial_stream_capacity": 100 }"#).is_err());
        // 0 selects the growable buffer
        assert!(NetworkConfig::from_json(r#"{ "initial_stream_capacity": 0 }"#).is_ok());

        // A fixed buffer must hold one full receive slot.
        let exact_mtu = NetworkConfig {
            initial_stream_capacity: crate::transport::MTU,
            ..NetworkConfig::default()
        };
        assert!(exact_mtu.validate().is_err());
        let one_slot = NetworkConfig {
            initial_stream_capacity: RECEIVE_SLOT_SIZE,
            ..NetworkConfig::default()
        };
        assert!(one_slot.validate().is_ok());
        assert!(matches!(
            NetworkConfig::from_json("not json"),
            Err(NetworkError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(br#"{ "disconnect_timeout_ms": 5000, "max_connections": 4 }"#)
            .unwrap();
        temp.flush().unwrap();

        let config = NetworkConfig::from_json_file(temp.path()).unwrap();
        assert_eq!(config.disconnect_timeout_ms, 5000);
        assert_eq!(config.max_connections, 4);

        assert!(NetworkConfig::from_json_file("/nonexistent/tidenet.json").is_err());
    }
}
