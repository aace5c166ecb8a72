//! Error types for the cohort replication core.

use thiserror::Error;

/// Errors that can occur in the cohort replication core.
///
/// `NotSupported` is kept apart from every other variant so that a batch
/// job can skip the affected instance instead of aborting.
#[derive(Debug, Error)]
pub enum CohortError {
    /// The local repository declines to perform the operation.
    #[error("{operation} not supported for {target}: {reason}")]
    NotSupported {
        /// Operation that was declined.
        operation: &'static str,
        /// Identifier of the instance or type involved.
        target: String,
        /// Reason reported by the storage layer.
        reason: String,
    },

    /// Entity, relationship, classification or type is unknown locally.
    #[error("{kind} {target} not found during {operation}")]
    NotFound {
        /// Operation that failed.
        operation: &'static str,
        /// What kind of thing was missing ("entity", "classification", ...).
        kind: &'static str,
        /// Identifier of the missing thing.
        target: String,
    },

    /// The caller targeted an older version than the one held locally.
    #[error("stale version for {target} during {operation}: supplied {supplied}, current {current}")]
    StaleVersion {
        /// Operation that failed.
        operation: &'static str,
        /// Instance identifier.
        target: String,
        /// Version the caller supplied.
        supplied: u64,
        /// Version currently held locally.
        current: u64,
    },

    /// The request is not valid for the current lifecycle state.
    #[error("conflict on {target} during {operation}: {reason}")]
    Conflict {
        /// Operation that failed.
        operation: &'static str,
        /// Instance identifier.
        target: String,
        /// What the conflict was.
        reason: String,
    },

    /// The instance is owned by another metadata collection.
    #[error("{operation} on {target} rejected: home collection is {home}")]
    NotHome {
        /// Operation that failed.
        operation: &'static str,
        /// Instance identifier.
        target: String,
        /// Owning metadata collection.
        home: String,
    },

    /// Caller-supplied parameters failed validation.
    #[error("invalid parameter for {operation}: {reason}")]
    InvalidParameter {
        /// Operation that failed.
        operation: &'static str,
        /// Validation failure.
        reason: String,
    },

    /// Temporary failure of the fabric or the storage adapter.
    #[error("transient failure during {operation} on {target}: {reason}")]
    Transient {
        /// Operation that failed.
        operation: &'static str,
        /// Instance or member identifier.
        target: String,
        /// Underlying failure.
        reason: String,
    },

    /// A long-running operation was cancelled between two instances.
    #[error("{operation} cancelled after {completed} instances")]
    Cancelled {
        /// Operation that was cancelled.
        operation: &'static str,
        /// Instances fully processed before cancellation.
        completed: usize,
    },

    /// An unexpected failure, wrapped with the operation and target.
    #[error("{operation} failed for {target}")]
    Unexpected {
        /// Operation that failed.
        operation: &'static str,
        /// Instance or member identifier.
        target: String,
        /// Original cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An event envelope failed its integrity check.
    #[error("envelope corrupted: {msg}")]
    Corrupted {
        /// Description of the corruption.
        msg: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// The cohort member was shut down.
    #[error("cohort member shut down")]
    Shutdown,
}

impl CohortError {
    /// Wrap an arbitrary failure with the operation and target it happened in.
    pub fn unexpected<E>(operation: &'static str, target: impl ToString, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Unexpected {
            operation,
            target: target.to_string(),
            source: source.into(),
        }
    }

    /// Shorthand for a `NotFound` error.
    pub fn not_found(operation: &'static str, kind: &'static str, target: impl ToString) -> Self {
        Self::NotFound {
            operation,
            kind,
            target: target.to_string(),
        }
    }

    /// Shorthand for an `InvalidParameter` error.
    pub fn invalid(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            operation,
            reason: reason.into(),
        }
    }

    /// True if the local repository declined the request.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }

    /// True if the referenced instance, classification or type is unknown.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True if the caller should re-read and retry.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleVersion { .. })
    }

    /// True for failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Result type for the cohort replication core.
pub type Result<T> = std::result::Result<T, CohortError>;
