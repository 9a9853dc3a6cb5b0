//! Error types for ringkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Storage Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    /// The commit log append failed; the write was not applied.
    #[error("Durability failure: {0}")]
    DurabilityFailure(String),

    /// An sstable failed a checksum or framing check.
    #[error("Corruption detected in {file}: {reason}")]
    CorruptionDetected { file: String, reason: String },

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // === Replication Errors ===
    #[error("Unavailable: need {needed} replicas, have {available}")]
    Unavailable { needed: usize, available: usize },

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Stale ring view: routed with version {routed}, replica has {current}")]
    StaleRingView { routed: u64, current: u64 },

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config / Request Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::StaleRingView { .. }
        )
    }

    /// Errors a coordinator counts as a failed replica for one operation.
    pub fn is_replica_failure(&self) -> bool {
        !matches!(
            self,
            Error::InvalidRequest(_) | Error::InvalidConfig(_) | Error::NotFound(_)
        )
    }

    /// The peer never answered, as opposed to answering with a fault.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::ConnectionFailed(_))
    }

    /// Checksum or framing failures of on-disk data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::CorruptionDetected { .. } | Error::ChecksumMismatch { .. }
        )
    }

    pub fn corruption(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::CorruptionDetected {
            file: file.into(),
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("background task failed: {}", e))
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout("rpc".into()).is_retryable());
        assert!(Error::ConnectionFailed("node-2".into()).is_retryable());
        assert!(!Error::Unavailable {
            needed: 2,
            available: 1
        }
        .is_retryable());
        assert!(!Error::DurabilityFailure("disk full".into()).is_retryable());
        assert!(Error::Timeout("rpc".into()).is_unreachable());
        assert!(!Error::DurabilityFailure("disk full".into()).is_unreachable());
    }

    #[test]
    fn test_display() {
        let err = Error::Unavailable {
            needed: 2,
            available: 1,
        };
        assert_eq!(err.to_string(), "Unavailable: need 2 replicas, have 1");

        let err = Error::corruption("sst-7.db", "bad crc");
        assert!(err.to_string().contains("sst-7.db"));
        assert!(err.is_corruption());
        assert!(!Error::Timeout("rpc".into()).is_corruption());
    }
}
