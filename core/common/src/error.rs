//! Common error types for Tidesync.

use thiserror::Error;

use crate::entity::Entity;
use crate::types::{EntityKey, MutationId, Version};

/// Errors reported by the remote document store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    /// The server refused the write for a non-retryable reason.
    #[error("Rejected by remote: {0}")]
    Rejected(String),

    /// The write was based on a stale version.
    ///
    /// Carries the server's current version and value (`None` when the
    /// entity does not exist remotely) so the caller can resolve locally.
    #[error("Version conflict: remote is at {current_version}")]
    VersionConflict {
        current_version: Version,
        current_value: Option<Box<Entity>>,
    },

    /// The remote store could not be reached.
    #[error("Remote unreachable: {0}")]
    Unreachable(String),

    /// The session token was refused.
    #[error("Unauthorized")]
    Unauthorized,
}

impl RemoteError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unreachable(_))
    }
}

/// Top-level error type for Tidesync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A write carried a version that is not newer than the stored one.
    #[error("Stale write for {key}: stored {stored}, incoming {incoming}")]
    StaleWrite {
        key: EntityKey,
        stored: Version,
        incoming: Version,
    },

    /// Durable storage has no room left for the append.
    #[error("Storage full: {0}")]
    StorageFull(String),

    /// Durable storage is damaged and cannot be trusted.
    #[error("Storage corrupt: {0}")]
    StorageCorrupt(String),

    /// Any other durable storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The mutation already left the outbox for the remote store.
    #[error("Mutation {0} is already in flight and cannot be cancelled")]
    NotCancellable(MutationId),

    /// Remote store error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The change stream can no longer resume from the given cursor.
    #[error("Change stream broken for collection {collection} (cursor invalid: {cursor_invalid})")]
    StreamBroken {
        collection: String,
        cursor_invalid: bool,
    },

    /// The engine has been shut down.
    #[error("Engine shut down")]
    Shutdown,
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unreachable_is_transient() {
        assert!(RemoteError::Unreachable("timeout".to_string()).is_transient());
        assert!(!RemoteError::Rejected("schema".to_string()).is_transient());
        assert!(!RemoteError::Unauthorized.is_transient());
        assert!(!RemoteError::VersionConflict {
            current_version: Version::new(3),
            current_value: None,
        }
        .is_transient());
    }

    #[test]
    fn test_remote_error_wraps() {
        let err: Error = RemoteError::Unauthorized.into();
        assert!(matches!(err, Error::Remote(RemoteError::Unauthorized)));
        assert_eq!(err.to_string(), "Unauthorized");
    }
}
