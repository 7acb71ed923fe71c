//! Job records and per-queue delivery options.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Unique identifier for an enqueued job.
pub type JobId = Uuid;

/// A job claimed from the queue.
///
/// `attempt` counts deliveries: it is 1 the first time the job is handed to
/// a worker and increments on every redelivery.
#[derive(Debug, Clone)]
pub struct Job<T> {
    /// Job identifier assigned at enqueue time.
    pub id: JobId,
    /// The enqueued payload.
    pub payload: T,
    /// Delivery attempt this claim represents (1-based).
    pub attempt: u32,
    /// When the job became eligible for claiming.
    pub available_at: DateTime<Utc>,
    /// When the job was originally enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// A job that exhausted its retry budget or failed fatally.
///
/// Failed jobs are retained (up to [`JobOptions::max_retained_failures`])
/// so an operator can inspect what was dropped.
#[derive(Debug, Clone)]
pub struct FailedJob<T> {
    pub id: JobId,
    pub payload: T,
    /// Total delivery attempts made before the job was failed.
    pub attempts: u32,
    /// The handler error that failed the job.
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Delivery options applied to every job on a queue.
///
/// Constructed once and handed to the queue backend; workers read the same
/// options back through [`crate::Queue::options`] so the retry policy is
/// defined in exactly one place.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Maximum delivery attempts before the job is moved to the failed set.
    pub max_attempts: u32,
    /// Base backoff between redeliveries; doubles with each failed attempt.
    pub backoff: Duration,
    /// How long a freshly enqueued job stays invisible. Batching window for
    /// near-simultaneous jobs.
    pub initial_delay: Duration,
    /// How many failed jobs to retain for inspection. Older failures beyond
    /// this count are pruned.
    pub max_retained_failures: usize,
    /// Jobs claimed longer than this are assumed orphaned by a crashed
    /// worker and become claimable again.
    pub claim_timeout: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(5),
            initial_delay: Duration::from_secs(60),
            max_retained_failures: 1000,
            claim_timeout: Duration::from_secs(60),
        }
    }
}

impl JobOptions {
    /// Backoff before redelivering a job that has made `attempt` deliveries.
    ///
    /// Exponential: `backoff * 2^(attempt - 1)`, i.e. 5s, 10s, 20s, ... for
    /// the default base.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor)
    }
}
