//! Write-behind job queue with at-least-once delivery.
//!
//! This crate provides a small job queue designed for write-behind
//! persistence: a fast path commits its result somewhere authoritative,
//! enqueues a record of what happened, and a background worker applies
//! that record to a slower durable store. Delivery is at-least-once, so
//! handlers must be idempotent.
//!
//! The queue provides:
//! - Deferred availability (an initial delay batches near-simultaneous jobs)
//! - Bounded retries with exponential backoff
//! - Failed-job retention (bounded) for manual inspection
//! - A PostgreSQL backend using `FOR UPDATE SKIP LOCKED` claims, and an
//!   in-memory backend for tests and single-process deployments
//!
//! # Example
//! ```ignore
//! use sluice::{MemoryQueue, Queue, Worker, WorkerConfig, JobOptions};
//!
//! let queue = Arc::new(MemoryQueue::new(JobOptions::default()));
//! queue.enqueue(&my_payload).await?;
//!
//! let worker = Worker::new(queue, Arc::new(my_handler), WorkerConfig::default());
//! let shutdown = CancellationToken::new();
//! tokio::spawn(worker.run(shutdown.clone()));
//! ```

pub mod error;
pub mod job;
pub mod queue;
pub mod worker;

// Re-export commonly used types
pub use error::{Result, SluiceError};
pub use job::{FailedJob, Job, JobId, JobOptions};
pub use queue::memory::MemoryQueue;
#[cfg(feature = "postgres")]
pub use queue::postgres::PostgresQueue;
pub use queue::Queue;
pub use worker::{Handler, HandlerError, Worker, WorkerConfig};

/// Returns the migrator for the queue's PostgreSQL schema.
///
/// Run this against the pool before constructing a [`PostgresQueue`]:
/// ```ignore
/// sluice::migrator().run(&pool).await?;
/// ```
///
/// The jobs table usually shares a database with the embedding
/// application's own migrations, so rows applied by other migrators are
/// ignored rather than treated as corruption.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
}
