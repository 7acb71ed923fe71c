//! PostgreSQL queue backend.
//!
//! Jobs live in the `sluice_jobs` table with a JSONB payload. Claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never receive the same
//! job, and survive worker crashes via the claim timeout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{Result, SluiceError};
use crate::job::{FailedJob, Job, JobId, JobOptions};

use super::Queue;

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    payload: serde_json::Value,
    attempt: i32,
    available_at: DateTime<Utc>,
    enqueued_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct FailedJobRow {
    id: Uuid,
    payload: serde_json::Value,
    attempt: i32,
    error: Option<String>,
    failed_at: DateTime<Utc>,
}

/// PostgreSQL implementation of the [`Queue`] trait.
///
/// Multiple logical queues share the `sluice_jobs` table, separated by
/// queue name. Run [`crate::migrator`] against the pool before
/// constructing one.
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    name: String,
    options: JobOptions,
}

impl PostgresQueue {
    /// Create a named queue over an existing connection pool.
    pub fn new(pool: PgPool, name: impl Into<String>, options: JobOptions) -> Self {
        Self {
            pool,
            name: name.into(),
            options,
        }
    }

    /// The queue's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl<T> Queue<T> for PostgresQueue
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn enqueue(&self, payload: &T) -> Result<JobId> {
        let id = Uuid::new_v4();
        let payload = serde_json::to_value(payload)?;
        let available_at = Utc::now()
            + chrono::Duration::from_std(self.options.initial_delay)
                .unwrap_or_else(|_| chrono::Duration::zero());

        sqlx::query(
            r#"
            INSERT INTO sluice_jobs (id, queue, payload, state, attempt, available_at)
            VALUES ($1, $2, $3, 'pending', 0, $4)
            "#,
        )
        .bind(id)
        .bind(&self.name)
        .bind(payload)
        .bind(available_at)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim(&self, limit: usize) -> Result<Vec<Job<T>>> {
        let now = Utc::now();

        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            UPDATE sluice_jobs
            SET state = 'claimed', attempt = attempt + 1, claimed_at = $1
            WHERE id IN (
                SELECT id
                FROM sluice_jobs
                WHERE queue = $2 AND state = 'pending' AND available_at <= $1
                ORDER BY available_at ASC, enqueued_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempt, available_at, enqueued_at
            "#,
        )
        .bind(now)
        .bind(&self.name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(Job {
                id: row.id,
                payload: serde_json::from_value(row.payload)?,
                attempt: row.attempt as u32,
                available_at: row.available_at,
                enqueued_at: row.enqueued_at,
            });
        }
        Ok(jobs)
    }

    async fn complete(&self, id: JobId) -> Result<()> {
        let result = sqlx::query("DELETE FROM sluice_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SluiceError::JobNotFound(id));
        }
        Ok(())
    }

    async fn release(&self, id: JobId, not_before: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sluice_jobs
            SET state = 'pending', available_at = $2, claimed_at = NULL
            WHERE id = $1 AND state = 'claimed'
            "#,
        )
        .bind(id)
        .bind(not_before)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SluiceError::JobNotFound(id));
        }
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE sluice_jobs
            SET state = 'failed', failed_at = $2, error = $3, claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .bind(error)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SluiceError::JobNotFound(id));
        }

        // Keep only the newest failures.
        sqlx::query(
            r#"
            DELETE FROM sluice_jobs
            WHERE queue = $1 AND state = 'failed' AND id NOT IN (
                SELECT id FROM sluice_jobs
                WHERE queue = $1 AND state = 'failed'
                ORDER BY failed_at DESC
                LIMIT $2
            )
            "#,
        )
        .bind(&self.name)
        .bind(self.options.max_retained_failures as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reclaim_stale(&self) -> Result<u64> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(self.options.claim_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let result = sqlx::query(
            r#"
            UPDATE sluice_jobs
            SET state = 'pending', available_at = $1, claimed_at = NULL
            WHERE queue = $3 AND state = 'claimed' AND claimed_at < $2
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .bind(&self.name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn pending_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sluice_jobs WHERE queue = $1 AND state = 'pending'",
        )
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn failed_jobs(&self, limit: usize) -> Result<Vec<FailedJob<T>>> {
        let rows: Vec<FailedJobRow> = sqlx::query_as(
            r#"
            SELECT id, payload, attempt, error, failed_at
            FROM sluice_jobs
            WHERE queue = $1 AND state = 'failed'
            ORDER BY failed_at DESC
            LIMIT $2
            "#,
        )
        .bind(&self.name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut failed = Vec::with_capacity(rows.len());
        for row in rows {
            failed.push(FailedJob {
                id: row.id,
                payload: serde_json::from_value(row.payload)?,
                attempts: row.attempt as u32,
                error: row.error.unwrap_or_default(),
                failed_at: row.failed_at,
            });
        }
        Ok(failed)
    }

    fn options(&self) -> &JobOptions {
        &self.options
    }
}
