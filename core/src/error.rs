//! Error Types
//!
//! Every fallible driver, buffer and backend operation returns [`NetworkError`].
//! Malformed or stale packets never show up here: the dispatcher drops them
//! and only counts them.

use std::io;
use thiserror::Error;

use crate::endpoint::NetworkFamily;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Error, Debug)]
pub enum NetworkError {
    // Usage errors: the caller broke a precondition.
    #[error("Driver is already bound to {0}")]
    AlreadyBound(String),
    #[error("Driver is not bound")]
    NotBound,
    #[error("Cannot send on a connection that is still connecting")]
    SendWhileConnecting,
    #[error("Connection handle is stale or was never issued")]
    InvalidConnection,
    #[error("Invalid endpoint: {0}")]
    InvalidEndPoint(String),
    #[error("Endpoint family {actual:?} does not match backend family {expected:?}")]
    FamilyMismatch {
        expected: NetworkFamily,
        actual: NetworkFamily,
    },

    // Resource exhaustion: the offending call is rejected, no partial write.
    #[error("Buffer overflow: need {needed} bytes, {available} available")]
    BufferOverflow { needed: usize, available: usize },
    #[error("Cannot shrink buffer to {requested} bytes, {length} bytes in use")]
    CapacityBelowLength { requested: usize, length: usize },
    #[error("Payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    // Reader / deferred-write misuse.
    #[error("Read of {requested} bytes at {offset} exceeds length {length}")]
    OutOfRange {
        offset: usize,
        requested: usize,
        length: usize,
    },
    #[error("Deferred write used after its buffer was cleared")]
    StaleDeferredWrite,

    // Configuration
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    // OS-level send/receive failure, fatal for the backend instance.
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("Receive task failed: {0}")]
    ReceiveTask(String),
}

impl NetworkError {
    /// True for errors caused by the caller violating an API precondition
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            NetworkError::AlreadyBound(_)
                | NetworkError::NotBound
                | NetworkError::SendWhileConnecting
                | NetworkError::InvalidConnection
                | NetworkError::InvalidEndPoint(_)
                | NetworkError::FamilyMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_classification() {
        assert!(NetworkError::NotBound.is_usage_error());
        assert!(NetworkError::SendWhileConnecting.is_usage_error());
        assert!(!NetworkError::StaleDeferredWrite.is_usage_error());

        let io_err: NetworkError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(!io_err.is_usage_error());
        assert!(io_err.to_string().contains("boom"));
    }
}
