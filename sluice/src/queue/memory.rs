//! In-memory queue backend.
//!
//! Stores jobs in process memory behind a `parking_lot` lock. Suitable for
//! tests and single-process deployments; jobs are lost on restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{Result, SluiceError};
use crate::job::{FailedJob, Job, JobId, JobOptions};

use super::Queue;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Claimed,
}

#[derive(Clone)]
struct StoredJob<T> {
    payload: T,
    state: State,
    attempt: u32,
    available_at: DateTime<Utc>,
    enqueued_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
}

struct Inner<T> {
    jobs: HashMap<JobId, StoredJob<T>>,
    // Newest failures at the front.
    failed: VecDeque<FailedJob<T>>,
}

/// In-memory implementation of the [`Queue`] trait.
#[derive(Clone)]
pub struct MemoryQueue<T> {
    inner: Arc<RwLock<Inner<T>>>,
    options: JobOptions,
}

impl<T> MemoryQueue<T> {
    /// Create an empty in-memory queue with the given delivery options.
    pub fn new(options: JobOptions) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                jobs: HashMap::new(),
                failed: VecDeque::new(),
            })),
            options,
        }
    }
}

impl<T> Default for MemoryQueue<T> {
    fn default() -> Self {
        Self::new(JobOptions::default())
    }
}

#[async_trait]
impl<T> Queue<T> for MemoryQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn enqueue(&self, payload: &T) -> Result<JobId> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let delay = ChronoDuration::from_std(self.options.initial_delay)
            .unwrap_or_else(|_| ChronoDuration::zero());

        let mut inner = self.inner.write();
        inner.jobs.insert(
            id,
            StoredJob {
                payload: payload.clone(),
                state: State::Pending,
                attempt: 0,
                available_at: now + delay,
                enqueued_at: now,
                claimed_at: None,
            },
        );
        Ok(id)
    }

    async fn claim(&self, limit: usize) -> Result<Vec<Job<T>>> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        let mut available: Vec<JobId> = inner
            .jobs
            .iter()
            .filter(|(_, job)| job.state == State::Pending && job.available_at <= now)
            .map(|(id, _)| *id)
            .collect();
        // Oldest first, matching the Postgres backend's claim order.
        available.sort_by_key(|id| {
            let job = &inner.jobs[id];
            (job.available_at, job.enqueued_at)
        });
        available.truncate(limit);

        let mut claimed = Vec::with_capacity(available.len());
        for id in available {
            if let Some(stored) = inner.jobs.get_mut(&id) {
                stored.state = State::Claimed;
                stored.attempt += 1;
                stored.claimed_at = Some(now);
                claimed.push(Job {
                    id,
                    payload: stored.payload.clone(),
                    attempt: stored.attempt,
                    available_at: stored.available_at,
                    enqueued_at: stored.enqueued_at,
                });
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: JobId) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .jobs
            .remove(&id)
            .map(|_| ())
            .ok_or(SluiceError::JobNotFound(id))
    }

    async fn release(&self, id: JobId, not_before: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write();
        let stored = inner.jobs.get_mut(&id).ok_or(SluiceError::JobNotFound(id))?;
        stored.state = State::Pending;
        stored.available_at = not_before;
        stored.claimed_at = None;
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let stored = inner.jobs.remove(&id).ok_or(SluiceError::JobNotFound(id))?;
        inner.failed.push_front(FailedJob {
            id,
            payload: stored.payload,
            attempts: stored.attempt,
            error: error.to_string(),
            failed_at: Utc::now(),
        });
        inner.failed.truncate(self.options.max_retained_failures);
        Ok(())
    }

    async fn reclaim_stale(&self) -> Result<u64> {
        let now = Utc::now();
        let timeout = ChronoDuration::from_std(self.options.claim_timeout)
            .unwrap_or_else(|_| ChronoDuration::zero());
        let mut inner = self.inner.write();

        let mut reclaimed = 0;
        for stored in inner.jobs.values_mut() {
            if stored.state == State::Claimed
                && stored.claimed_at.is_some_and(|at| now - at > timeout)
            {
                stored.state = State::Pending;
                stored.available_at = now;
                stored.claimed_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn pending_count(&self) -> Result<u64> {
        let inner = self.inner.read();
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.state == State::Pending)
            .count() as u64)
    }

    async fn failed_jobs(&self, limit: usize) -> Result<Vec<FailedJob<T>>> {
        let inner = self.inner.read();
        Ok(inner.failed.iter().take(limit).cloned().collect())
    }

    fn options(&self) -> &JobOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn immediate_options() -> JobOptions {
        JobOptions {
            initial_delay: Duration::ZERO,
            ..JobOptions::default()
        }
    }

    #[tokio::test]
    async fn enqueue_and_claim_roundtrip() {
        let queue = MemoryQueue::new(immediate_options());

        let id = queue.enqueue(&"payload".to_string()).await.unwrap();

        let claimed = queue.claim(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].attempt, 1);
        assert_eq!(claimed[0].payload, "payload");
    }

    #[tokio::test]
    async fn initial_delay_defers_claiming() {
        let queue = MemoryQueue::new(JobOptions {
            initial_delay: Duration::from_secs(60),
            ..JobOptions::default()
        });

        queue.enqueue(&1u32).await.unwrap();

        // Still within the batching window: nothing claimable.
        let claimed = queue.claim(10).await.unwrap();
        assert!(claimed.is_empty());
        assert_eq!(queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claimed_jobs_are_not_redelivered() {
        let queue = MemoryQueue::new(immediate_options());
        queue.enqueue(&1u32).await.unwrap();

        let first = queue.claim(10).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = queue.claim(10).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn release_makes_job_claimable_again_with_bumped_attempt() {
        let queue = MemoryQueue::new(immediate_options());
        let id = queue.enqueue(&1u32).await.unwrap();

        let claimed = queue.claim(10).await.unwrap();
        assert_eq!(claimed[0].attempt, 1);

        queue.release(id, Utc::now()).await.unwrap();

        let reclaimed = queue.claim(10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempt, 2);
    }

    #[tokio::test]
    async fn complete_deletes_the_job() {
        let queue = MemoryQueue::new(immediate_options());
        let id = queue.enqueue(&1u32).await.unwrap();
        queue.claim(10).await.unwrap();

        queue.complete(id).await.unwrap();

        assert_eq!(queue.pending_count().await.unwrap(), 0);
        assert!(matches!(
            queue.complete(id).await,
            Err(SluiceError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_jobs_are_retained_newest_first_and_bounded() {
        let queue = MemoryQueue::new(JobOptions {
            initial_delay: Duration::ZERO,
            max_retained_failures: 2,
            ..JobOptions::default()
        });

        for payload in 0..3u32 {
            let id = queue.enqueue(&payload).await.unwrap();
            queue.claim(10).await.unwrap();
            queue.fail(id, "boom").await.unwrap();
        }

        let failed = queue.failed_jobs(10).await.unwrap();
        assert_eq!(failed.len(), 2);
        // Newest failure first; the oldest was pruned.
        assert_eq!(failed[0].payload, 2);
        assert_eq!(failed[1].payload, 1);
        assert_eq!(failed[0].error, "boom");
    }

    #[tokio::test]
    async fn claim_order_is_oldest_available_first() {
        let queue = MemoryQueue::new(immediate_options());
        let first = queue.enqueue(&"first".to_string()).await.unwrap();
        let second = queue.enqueue(&"second".to_string()).await.unwrap();

        let claimed = queue.claim(1).await.unwrap();
        assert_eq!(claimed[0].id, first);

        let claimed = queue.claim(1).await.unwrap();
        assert_eq!(claimed[0].id, second);
    }

    #[tokio::test]
    async fn reclaim_stale_recovers_orphaned_claims() {
        let queue = MemoryQueue::new(JobOptions {
            initial_delay: Duration::ZERO,
            claim_timeout: Duration::ZERO,
            ..JobOptions::default()
        });
        queue.enqueue(&1u32).await.unwrap();
        queue.claim(10).await.unwrap();

        // Claim timeout of zero: the claim is immediately stale.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = queue.reclaim_stale().await.unwrap();
        assert_eq!(reclaimed, 1);

        let claimed = queue.claim(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt, 2);
    }
}
