use thiserror::Error as ThisError;

use crate::db::errors::DbError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Optimistic retries exhausted on a cache key (or key set).
    ///
    /// Surfaced to callers of update operations as a `false` return rather
    /// than an error: the cache value is simply unknown and the caller
    /// decides whether to retry later.
    #[error("Optimistic update on {key} gave up after {attempts} attempts")]
    ConcurrencyExhausted { key: String, attempts: u32 },

    /// The ledger was constructed without a required cache dependency
    #[error("Ledger requires a {which} cache")]
    CacheUnavailable { which: &'static str },

    /// Durable store operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Enqueue failed after a successful cache commit. The cache stays
    /// authoritative; the durable store is behind until reconciled.
    #[error("Failed to enqueue {what}")]
    Queue {
        what: &'static str,
        #[source]
        source: sluice::SluiceError,
    },

    /// Malformed transaction payload (negative magnitude, nil subject)
    #[error("Invalid transaction: {reason}")]
    InvalidTransaction { reason: String },

    /// A de-duplicated initialization failed; every caller sharing the
    /// in-flight attempt observes the same failure.
    #[error("Shared initialization failed: {message}")]
    SharedInit { message: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
