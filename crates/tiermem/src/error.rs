//! Error types for tiermem

use thiserror::Error;

use crate::memory::types::TierId;

/// Main error type for tiermem operations
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Key absent where presence was required
    #[error("Key not found: {0}")]
    NotFound(String),

    /// A specific tier could not be reached within its deadline
    #[error("Tier {tier} unavailable: {reason}")]
    TierUnavailable { tier: TierId, reason: String },

    /// The overall call budget was exhausted across the tier chain
    #[error("Deadline exceeded after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// A write carried an older sequence number than the stored value
    #[error("Stale write rejected for {key}: stored sequence {stored}, attempted {attempted}")]
    StaleWriteRejected {
        key: String,
        stored: u64,
        attempted: u64,
    },

    /// A tier refused a write and had no eviction candidate
    #[error("Tier {tier} is at capacity")]
    CapacityExceeded { tier: TierId },

    /// Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage backend errors (SQLite, LanceDB, HTTP, file system)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Caller supplied an unusable argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The manager has been shut down
    #[error("Memory manager is shut down")]
    Shutdown,
}

impl MemoryError {
    /// Shorthand for a tier-unavailable error
    pub fn unavailable(tier: TierId, reason: impl Into<String>) -> Self {
        Self::TierUnavailable {
            tier,
            reason: reason.into(),
        }
    }

    /// Transient tier-local failures that the manager absorbs and bypasses
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TierUnavailable { .. } | Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Serialization(e.to_string())
    }
}

/// Result type alias for tiermem operations
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MemoryError::unavailable(TierId::L2, "connection refused").is_transient());
        assert!(MemoryError::Timeout { elapsed_ms: 10 }.is_transient());
        assert!(!MemoryError::CapacityExceeded { tier: TierId::L1 }.is_transient());
        assert!(!MemoryError::Storage("disk full".to_string()).is_transient());
    }

    #[test]
    fn test_stale_write_message() {
        let err = MemoryError::StaleWriteRejected {
            key: "default/a".to_string(),
            stored: 7,
            attempted: 3,
        };
        assert_eq!(
            err.to_string(),
            "Stale write rejected for default/a: stored sequence 7, attempted 3"
        );
    }
}
