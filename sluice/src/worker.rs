//! Consumer worker loop.
//!
//! The worker continuously claims jobs and feeds them to a [`Handler`].
//! Jobs are processed one at a time: the queue exists to serialize writes
//! against a slower durable store, so single-flight processing trades
//! throughput for not racing aggregate updates.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::job::Job;
use crate::queue::Queue;

/// How a handler failed, which decides the job's fate.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure: the job is redelivered with backoff until the
    /// attempt budget runs out.
    #[error("retryable: {0}")]
    Retry(#[source] anyhow::Error),

    /// Structural failure (e.g. a malformed payload): retrying cannot fix
    /// it, so the job is failed immediately.
    #[error("fatal: {0}")]
    Fatal(#[source] anyhow::Error),
}

/// Processes claimed jobs.
#[async_trait]
pub trait Handler<T>: Send + Sync {
    /// Handle one delivery of a job.
    ///
    /// Called at least once per job; implementations must be idempotent.
    async fn handle(&self, job: &Job<T>) -> std::result::Result<(), HandlerError>;
}

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to sleep when the queue is empty.
    pub poll_interval: Duration,
    /// Maximum jobs to claim per iteration. They are still processed
    /// sequentially.
    pub claim_batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            claim_batch_size: 50,
        }
    }
}

/// Queue consumer that drives a [`Handler`] until shutdown.
pub struct Worker<T, Q, H>
where
    Q: Queue<T>,
    H: Handler<T>,
    T: Send + Sync + 'static,
{
    queue: Arc<Q>,
    handler: Arc<H>,
    config: WorkerConfig,
    _payload: PhantomData<fn() -> T>,
}

impl<T, Q, H> Worker<T, Q, H>
where
    Q: Queue<T>,
    H: Handler<T>,
    T: Send + Sync + 'static,
{
    pub fn new(queue: Arc<Q>, handler: Arc<H>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
            _payload: PhantomData,
        }
    }

    /// Run the worker until the token is cancelled.
    ///
    /// Jobs in flight when cancellation arrives finish processing; claimed
    /// but unprocessed jobs are recovered later via the claim timeout.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            claim_batch_size = self.config.claim_batch_size,
            "Queue worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                tracing::info!("Queue worker shutting down");
                return Ok(());
            }

            let reclaimed = self.queue.reclaim_stale().await?;
            if reclaimed > 0 {
                tracing::warn!(reclaimed, "Recovered jobs from expired claims");
            }

            let claimed = self.queue.claim(self.config.claim_batch_size).await?;
            if claimed.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Queue worker shutting down");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            tracing::debug!(count = claimed.len(), "Claimed jobs");

            for job in claimed {
                self.process(job).await?;
            }
        }
    }

    async fn process(&self, job: Job<T>) -> Result<()> {
        let job_id = job.id;
        let attempt = job.attempt;
        let max_attempts = self.queue.options().max_attempts;

        match self.handler.handle(&job).await {
            Ok(()) => {
                tracing::debug!(job_id = %job_id, attempt, "Job completed");
                self.queue.complete(job_id).await
            }
            Err(HandlerError::Fatal(error)) => {
                tracing::error!(job_id = %job_id, attempt, error = %error, "Job failed fatally");
                self.queue.fail(job_id, &format!("{error:#}")).await
            }
            Err(HandlerError::Retry(error)) if attempt >= max_attempts => {
                tracing::error!(
                    job_id = %job_id,
                    attempt,
                    max_attempts,
                    error = %error,
                    "Job exhausted its retry budget"
                );
                self.queue.fail(job_id, &format!("{error:#}")).await
            }
            Err(HandlerError::Retry(error)) => {
                let delay = self.queue.options().backoff_delay(attempt);
                tracing::warn!(
                    job_id = %job_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job failed, scheduling redelivery"
                );
                let not_before = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                self.queue.release(job_id, not_before).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use anyhow::anyhow;

    use super::*;
    use crate::job::JobOptions;
    use crate::queue::memory::MemoryQueue;

    struct CountingHandler {
        calls: AtomicU32,
        failures_before_success: u32,
        fatal: bool,
    }

    impl CountingHandler {
        fn succeeding() -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures_before_success: 0,
                fatal: false,
            }
        }

        fn failing_times(n: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures_before_success: n,
                fatal: false,
            }
        }

        fn fatal() -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures_before_success: 0,
                fatal: true,
            }
        }
    }

    #[async_trait]
    impl Handler<u32> for CountingHandler {
        async fn handle(&self, _job: &Job<u32>) -> std::result::Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                return Err(HandlerError::Fatal(anyhow!("malformed")));
            }
            if call < self.failures_before_success {
                return Err(HandlerError::Retry(anyhow!("transient")));
            }
            Ok(())
        }
    }

    fn test_options() -> JobOptions {
        JobOptions {
            initial_delay: Duration::ZERO,
            backoff: Duration::from_millis(10),
            ..JobOptions::default()
        }
    }

    fn spawn_worker(
        queue: Arc<MemoryQueue<u32>>,
        handler: Arc<CountingHandler>,
    ) -> (CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            queue,
            handler,
            WorkerConfig {
                poll_interval: Duration::from_millis(5),
                claim_batch_size: 10,
            },
        );
        let handle = tokio::spawn(worker.run(shutdown.clone()));
        (shutdown, handle)
    }

    /// Poll until `cond` holds, or panic after ~5s.
    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within timeout");
    }

    #[tokio::test]
    async fn successful_job_is_completed_once() {
        let queue = Arc::new(MemoryQueue::new(test_options()));
        let handler = Arc::new(CountingHandler::succeeding());
        queue.enqueue(&7).await.unwrap();

        let (shutdown, handle) = spawn_worker(queue.clone(), handler.clone());
        wait_for(|| handler.calls.load(Ordering::SeqCst) == 1).await;
        // No redelivery should happen after success.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(queue.failed_jobs(10).await.unwrap().is_empty());
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_with_backoff() {
        let queue = Arc::new(MemoryQueue::new(test_options()));
        let handler = Arc::new(CountingHandler::failing_times(2));
        queue.enqueue(&7).await.unwrap();

        let (shutdown, handle) = spawn_worker(queue.clone(), handler.clone());
        // Two transient failures, then success on the third delivery.
        wait_for(|| handler.calls.load(Ordering::SeqCst) == 3).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert!(queue.failed_jobs(10).await.unwrap().is_empty());
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_retains_the_job() {
        let queue = Arc::new(MemoryQueue::new(JobOptions {
            max_attempts: 3,
            ..test_options()
        }));
        let handler = Arc::new(CountingHandler::failing_times(u32::MAX));
        queue.enqueue(&7).await.unwrap();

        let (shutdown, handle) = spawn_worker(queue.clone(), handler.clone());
        wait_for(|| handler.calls.load(Ordering::SeqCst) == 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        // Budget exhausted: no fourth delivery, job retained for inspection.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let failed = queue.failed_jobs(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
    }

    #[tokio::test]
    async fn fatal_failure_is_never_redelivered() {
        let queue = Arc::new(MemoryQueue::new(test_options()));
        let handler = Arc::new(CountingHandler::fatal());
        queue.enqueue(&7).await.unwrap();

        let (shutdown, handle) = spawn_worker(queue.clone(), handler.clone());
        wait_for(|| handler.calls.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let failed = queue.failed_jobs(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 1);
    }
}
