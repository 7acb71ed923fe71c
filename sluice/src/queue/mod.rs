//! The queue trait and its backends.
//!
//! A [`Queue`] moves jobs through three states: *pending* (waiting for
//! `available_at`), *claimed* (handed to a worker), and *failed* (retained
//! for inspection). Completed jobs are deleted. Claiming bumps the attempt
//! counter, so redelivery accounting lives in the backend rather than the
//! worker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::job::{FailedJob, Job, JobId, JobOptions};

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Storage backend for the write-behind queue.
///
/// Implementations must make [`claim`](Queue::claim) atomic: a job handed to
/// one worker must not be handed to another until it is released or its
/// claim times out.
#[async_trait]
pub trait Queue<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Enqueue a payload. The job becomes claimable after the queue's
    /// configured initial delay.
    async fn enqueue(&self, payload: &T) -> Result<JobId>;

    /// Atomically claim up to `limit` available jobs, oldest first.
    ///
    /// Each returned job has its attempt counter already incremented.
    async fn claim(&self, limit: usize) -> Result<Vec<Job<T>>>;

    /// Mark a claimed job as done. The job is deleted.
    async fn complete(&self, id: JobId) -> Result<()>;

    /// Return a claimed job to the pending state, claimable from
    /// `not_before`.
    async fn release(&self, id: JobId, not_before: DateTime<Utc>) -> Result<()>;

    /// Move a claimed job to the failed set, recording the handler error.
    ///
    /// Failed jobs are retained up to the configured bound; the oldest are
    /// pruned beyond it.
    async fn fail(&self, id: JobId, error: &str) -> Result<()>;

    /// Return jobs claimed longer than the configured claim timeout to the
    /// pending state. Recovers jobs orphaned by a crashed worker.
    async fn reclaim_stale(&self) -> Result<u64>;

    /// Number of jobs currently pending (claimable now or later).
    async fn pending_count(&self) -> Result<u64>;

    /// Most recent failed jobs, newest first.
    async fn failed_jobs(&self, limit: usize) -> Result<Vec<FailedJob<T>>>;

    /// The delivery options this queue was constructed with.
    fn options(&self) -> &JobOptions;
}
