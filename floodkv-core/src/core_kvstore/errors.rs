/*
    errors.rs - Error types for the key-value store subsystem

    Defines all error kinds that can surface from:
    - public store operations (per-area API)
    - the peer wire protocol
    - internal serialization
*/

use thiserror::Error;

/// Errors that can occur in the key-value store subsystem
#[derive(Debug, Error)]
pub enum KvStoreError {
    /// Malformed key, filter, or request parameter
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown area or peer
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation deadline exceeded
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Peer unreachable or protocol violation
    #[error("transport error: {0}")]
    Transport(String),

    /// Flood limiter refused the publication outright
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Store is shutting down; no new operations accepted
    #[error("shutting down")]
    ShuttingDown,

    /// Wire encoding or decoding failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Unexpected internal fault; logged and counted, not actionable by callers
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for key-value store operations
pub type KvStoreResult<T> = Result<T, KvStoreError>;

impl From<bincode::Error> for KvStoreError {
    fn from(err: bincode::Error) -> Self {
        KvStoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KvStoreError::NotFound("area \"spine\"".to_string());
        assert_eq!(err.to_string(), "not found: area \"spine\"");
    }

    #[test]
    fn test_shutting_down_display() {
        assert_eq!(KvStoreError::ShuttingDown.to_string(), "shutting down");
    }

    #[test]
    fn test_bincode_conversion() {
        let bad: Result<u64, _> = bincode::deserialize(&[0xFF]);
        let err: KvStoreError = bad.unwrap_err().into();
        assert!(matches!(err, KvStoreError::Serialization(_)));
    }
}
