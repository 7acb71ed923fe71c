use thiserror::Error;

use crate::job::JobId;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, SluiceError>;

/// Errors that can occur in the queue system.
#[derive(Debug, Error)]
pub enum SluiceError {
    /// Database operation failed
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Job payload could not be serialized or deserialized
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Job not found (completed, pruned, or never enqueued)
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Internal error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
