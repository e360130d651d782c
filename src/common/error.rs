//! Error types for minicoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Coordination Store Errors ===
    #[error("Node already exists: {0}")]
    AlreadyExists(String),

    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Version mismatch on {path}: expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Session lost: {0}")]
    SessionLost(u64),

    // === Consensus Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("Stale term: received {received}, current {current}")]
    StaleTerm { received: u64, current: u64 },

    #[error("Quorum unavailable: {acks} of {required} required acknowledgements")]
    QuorumUnavailable { acks: usize, required: usize },

    #[error("Raft error: {0}")]
    Raft(String),

    // === Replication Errors ===
    #[error("Stale version for {key}: received {received}, current {current}")]
    StaleVersion {
        key: String,
        received: u64,
        current: u64,
    },

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Storage Errors ===
    #[error("Log storage error: {0}")]
    Wal(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::NotLeader(_)
                | Error::QuorumUnavailable { .. }
                | Error::AlreadyExists(_)
                | Error::BadVersion { .. }
        )
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout("lock".into()).is_retryable());
        assert!(Error::QuorumUnavailable {
            acks: 1,
            required: 2
        }
        .is_retryable());
        assert!(!Error::NotFound("/a".into()).is_retryable());
        assert!(!Error::SessionLost(7).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::BadVersion {
            path: "/a".into(),
            expected: 1,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Version mismatch on /a: expected 1, actual 3"
        );
    }
}
