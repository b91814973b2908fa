//! Error types for the entity manager.
//!
//! All errors are strongly typed using thiserror. Every failure mode degrades
//! to "retry on the next message or the next scan pass"; `is_retryable` tells
//! the ingress layer whether redelivery can help.

use thiserror::Error;

use crate::storage::StorageError;

/// Validation errors raised before any state is written.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Entity name cannot be empty")]
    EmptyEntityName,

    #[error("Entity type cannot be empty")]
    EmptyEntityType,

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Relation {position} references mention {index}, but the record has {len} mentions")]
    RelationOutOfRange {
        position: usize,
        index: usize,
        len: usize,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Errors reported by external collaborators (index, graph store, egress).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The collaborator could not be reached or timed out.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// The collaborator refused the request.
    #[error("collaborator rejected request: {0}")]
    Rejected(String),
}

/// Top-level error type for the entity manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The canonical index could not be queried. Nothing was written.
    #[error("Canonical lookup failed: {source}")]
    LookupFailure {
        source: CollaboratorError,
    },

    /// A graph insert or edge call failed. The document stays tracked.
    #[error("Graph commit failed: {source}")]
    GraphCommitFailure {
        source: CollaboratorError,
    },

    #[error("Queue full on {path} (capacity {capacity})")]
    QueueFull {
        path: String,
        capacity: usize,
    },

    #[error("Worker disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl ManagerError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wraps an index failure.
    #[must_use]
    pub const fn lookup(source: CollaboratorError) -> Self {
        Self::LookupFailure { source }
    }

    /// Wraps a graph-store failure.
    #[must_use]
    pub const fn graph(source: CollaboratorError) -> Self {
        Self::GraphCommitFailure { source }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if redelivering the message (or rerunning the pass) can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false, // Same input, same rejection
            Self::Storage(e) => e.is_transient(),
            Self::LookupFailure { .. }
            | Self::GraphCommitFailure { .. }
            | Self::QueueFull { .. } => true,
            Self::Disconnected { .. } | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for entity manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_relation_out_of_range() {
        let err = ValidationError::RelationOutOfRange {
            position: 2,
            index: 7,
            len: 3,
        };
        let msg = format!("{err}");
        assert!(msg.contains("mention 7"));
        assert!(msg.contains("3 mentions"));
    }

    #[test]
    fn test_lookup_failure_is_retryable() {
        let err = ManagerError::lookup(CollaboratorError::Unavailable("index down".to_string()));
        assert!(err.is_retryable());
        assert!(format!("{err}").contains("index down"));
    }

    #[test]
    fn test_graph_failure_is_retryable() {
        let err = ManagerError::graph(CollaboratorError::Rejected("bad edge".to_string()));
        assert!(err.is_retryable());
        assert!(format!("{err}").contains("Graph commit failed"));
    }

    #[test]
    fn test_validation_is_not_retryable() {
        let err: ManagerError = ValidationError::EmptyEntityName.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_storage_error_retryability_follows_backend() {
        let poisoned: ManagerError = StorageError::Poisoned("staging.get").into();
        assert!(!poisoned.is_retryable());

        let backend: ManagerError = StorageError::Unavailable("rebalancing".to_string()).into();
        assert!(backend.is_retryable());
    }

    #[test]
    fn test_internal_error() {
        let err = ManagerError::internal("unexpected state");
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("unexpected state"));
    }
}
