//! Error types for network state persistence and replication.
//!
//! Store-level failures (`KeyNotFound`, `VersionConflict`, `StoreUnavailable`)
//! come from the key-value backends; the rest are raised by the controller
//! while maintaining the live network and endpoint tables.

use thiserror::Error;

/// Errors that can occur while persisting or replicating network state.
#[derive(Debug, Error)]
pub enum StateError {
    /// Key (or key prefix) does not exist in the store.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Expected version does not match current version (optimistic concurrency conflict).
    #[error("version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict {
        key: String,
        expected: u64,
        found: u64,
    },

    /// Cannot connect to or communicate with the storage backend.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Store configuration cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No network with the given id is known to the controller.
    #[error("no such network: {0}")]
    NoSuchNetwork(String),

    /// No endpoint with the given id exists on the network.
    #[error("no such endpoint: {0}")]
    NoSuchEndpoint(String),

    /// A network with the same name is already tracked.
    #[error("network with name {0} already exists")]
    NetworkNameExists(String),

    /// An endpoint with the same name is already attached to the network.
    #[error("endpoint with name {0} already exists")]
    EndpointNameExists(String),

    /// The network still has endpoints attached.
    #[error("network {name} has {count} active endpoints")]
    ActiveEndpoints { name: String, count: usize },

    /// A tree watch ended without being cancelled.
    #[error("watch on {0} closed unexpectedly")]
    WatchClosed(String),

    /// Database error from SQLx.
    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for state operations.
pub type Result<T> = std::result::Result<T, StateError>;

impl StateError {
    /// Returns true if the key or prefix is absent.
    ///
    /// Absence is an expected outcome during bootstrap and delete
    /// confirmation, so callers usually branch on it rather than log it.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::KeyNotFound(_))
    }

    /// Returns true if the backend could not be reached or failed internally.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            StateError::StoreUnavailable(_)
                | StateError::DatabaseError(_)
                | StateError::IoError(_)
        )
    }

    /// Returns true if the operation may succeed when retried with fresh state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StateError::VersionConflict { .. }) || self.is_store_unavailable()
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::SerializationError(err.to_string())
    }
}

impl From<toml::de::Error> for StateError {
    fn from(err: toml::de::Error) -> Self {
        StateError::InvalidConfig(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StateError::KeyNotFound("/netstate/v1/network/n1".to_string());
        assert!(err.to_string().contains("key not found"));
        assert!(err.to_string().contains("/netstate/v1/network/n1"));
    }

    #[test]
    fn test_version_conflict_display() {
        let err = StateError::VersionConflict {
            key: "/k".to_string(),
            expected: 5,
            found: 7,
        };
        assert!(err.to_string().contains("expected 5"));
        assert!(err.to_string().contains("found 7"));
    }

    #[test]
    fn test_classification() {
        assert!(StateError::KeyNotFound("k".to_string()).is_not_found());
        assert!(!StateError::StoreUnavailable("down".to_string()).is_not_found());
        assert!(StateError::StoreUnavailable("down".to_string()).is_store_unavailable());
        assert!(StateError::IoError(std::io::Error::other("x")).is_store_unavailable());
        assert!(!StateError::SerializationError("bad".to_string()).is_store_unavailable());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(StateError::VersionConflict {
            key: "/k".to_string(),
            expected: 1,
            found: 2
        }
        .is_retryable());
        assert!(StateError::StoreUnavailable("test".to_string()).is_retryable());
        assert!(!StateError::KeyNotFound("test".to_string()).is_retryable());
        assert!(!StateError::SerializationError("test".to_string()).is_retryable());
    }
}
