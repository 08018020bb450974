// ABOUTME: The storage error taxonomy shared by backends, the cache and the facade.
// ABOUTME: Classifies errors as retryable (capacity/outage/transient) or terminal for callers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::Revision;

/// Errors surfaced by every layer of quill.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The stored payload does not match the expected schema. Not retried.
    #[error("malformed data for {entity}/{key}: {reason}")]
    MalformedData {
        entity: String,
        key: String,
        reason: String,
    },

    /// Optimistic concurrency violation. The caller must re-read and retry.
    #[error("revision conflict on {key}: expected {expected}, stored {actual}")]
    Conflict {
        key: String,
        expected: Revision,
        actual: Revision,
    },

    #[error("{entity}/{key} not found")]
    NotFound { entity: String, key: String },

    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage is closed")]
    Closed,

    #[error("a bulk load for {0} is already running")]
    LoadInProgress(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(String),

    /// Driver-level failure that may succeed on retry (locked database, dropped link).
    #[error("database error: {0}")]
    Database(String),

    /// A synchronous call was made from inside the current-thread runtime it
    /// would have to wait on.
    #[error("cannot block on a current-thread runtime from inside it; use the async method")]
    BlockingInRuntime,

    #[error("{} entries failed to flush", failures.len())]
    FlushFailed { failures: Vec<FlushFailure> },
}

impl StorageError {
    /// Whether the operation may succeed if retried after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::PoolExhausted { .. }
                | StorageError::BackendUnavailable(_)
                | StorageError::Timeout(_)
                | StorageError::Io(_)
                | StorageError::Database(_)
        )
    }

    pub fn malformed(entity: &str, key: &str, reason: impl ToString) -> Self {
        StorageError::MalformedData {
            entity: entity.to_string(),
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// A dirty entry that could not be written to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushFailure {
    pub entity: String,
    pub key: String,
    pub revision: Revision,
    pub error: String,
}
