//! PostgreSQL implementation of the durable store.
//!
//! Aggregate rows are only ever written through the idempotent apply path,
//! inside a single database transaction with the transaction/event record
//! insert. A redelivered record hits the `ON CONFLICT (id) DO NOTHING`
//! insert, affects zero rows, and skips the aggregate update entirely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::{
    BalanceAggregate, TokenUsageAggregate, Transaction, TransactionKind, UsageEvent,
};
use crate::types::{CredentialId, UserId};

use super::{Applied, LedgerStore};

#[derive(FromRow)]
struct TransactionRow {
    id: uuid::Uuid,
    subject_id: uuid::Uuid,
    amount: rust_decimal::Decimal,
    kind: TransactionKind,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<TransactionRow> for Transaction {
    fn from(row: TransactionRow) -> Self {
        Self {
            id: row.id,
            subject_id: row.subject_id,
            amount: row.amount,
            kind: row.kind,
            description: row.description,
            timestamp: row.created_at,
        }
    }
}

/// PostgreSQL durable-store client.
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self), err)]
    async fn balance_aggregate(&self, user_id: UserId) -> Result<Option<BalanceAggregate>> {
        let row = sqlx::query_as::<_, BalanceAggregate>(
            r#"
            SELECT user_id, current, total_topups, total_usage, updated_at
            FROM balance_aggregates
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    #[instrument(skip(self), err)]
    async fn all_balance_aggregates(&self) -> Result<Vec<BalanceAggregate>> {
        let rows = sqlx::query_as::<_, BalanceAggregate>(
            r#"
            SELECT user_id, current, total_topups, total_usage, updated_at
            FROM balance_aggregates
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    #[instrument(skip(self, tx), fields(transaction_id = %tx.id), err)]
    async fn apply_transaction(&self, tx: &Transaction) -> Result<Applied> {
        let mut db_tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO ledger_transactions (id, subject_id, amount, kind, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(tx.id)
        .bind(tx.subject_id)
        .bind(tx.amount)
        .bind(tx.kind)
        .bind(&tx.description)
        .bind(tx.timestamp)
        .execute(&mut *db_tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Already applied by a previous delivery.
            db_tx.rollback().await?;
            return Ok(Applied::Duplicate);
        }

        let delta_topups = if tx.kind.adds_to_topups() {
            tx.amount
        } else {
            rust_decimal::Decimal::ZERO
        };
        let delta_usage = if tx.kind.adds_to_usage() {
            tx.amount
        } else {
            rust_decimal::Decimal::ZERO
        };

        sqlx::query(
            r#"
            INSERT INTO balance_aggregates (user_id, current, total_topups, total_usage, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE SET
                current = balance_aggregates.current + EXCLUDED.current,
                total_topups = balance_aggregates.total_topups + EXCLUDED.total_topups,
                total_usage = balance_aggregates.total_usage + EXCLUDED.total_usage,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(tx.subject_id)
        .bind(tx.kind.signed_amount(tx.amount))
        .bind(delta_topups)
        .bind(delta_usage)
        .bind(tx.timestamp)
        .execute(&mut *db_tx)
        .await?;

        db_tx.commit().await?;
        Ok(Applied::Applied)
    }

    #[instrument(skip(self), err)]
    async fn transaction_history(
        &self,
        subject_id: UserId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT id, subject_id, amount, kind, description, created_at
            FROM ledger_transactions
            WHERE subject_id = $1
              AND ($2::timestamptz IS NULL OR created_at >= $2)
              AND ($3::timestamptz IS NULL OR created_at <= $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(subject_id)
        .bind(from)
        .bind(to)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Transaction::from).collect())
    }

    #[instrument(skip(self), err)]
    async fn token_usage_aggregate(
        &self,
        credential_id: CredentialId,
    ) -> Result<Option<TokenUsageAggregate>> {
        let row = sqlx::query_as::<_, TokenUsageAggregate>(
            r#"
            SELECT credential_id, tokens, cost, updated_at
            FROM token_usage_aggregates
            WHERE credential_id = $1
            "#,
        )
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    #[instrument(skip(self), err)]
    async fn all_token_usage_aggregates(&self) -> Result<Vec<TokenUsageAggregate>> {
        let rows = sqlx::query_as::<_, TokenUsageAggregate>(
            r#"
            SELECT credential_id, tokens, cost, updated_at
            FROM token_usage_aggregates
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    #[instrument(skip(self, event), fields(event_id = %event.id), err)]
    async fn apply_usage_event(&self, event: &UsageEvent) -> Result<Applied> {
        let mut db_tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO token_usage_events (id, credential_id, tokens, cost, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(event.credential_id)
        .bind(event.tokens)
        .bind(event.cost)
        .bind(&event.description)
        .bind(event.timestamp)
        .execute(&mut *db_tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            db_tx.rollback().await?;
            return Ok(Applied::Duplicate);
        }

        // An unknown cost leaves the aggregate cost untouched; a known cost
        // folds into it, starting from 0 if it was unknown so far.
        sqlx::query(
            r#"
            INSERT INTO token_usage_aggregates (credential_id, tokens, cost, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (credential_id) DO UPDATE SET
                tokens = token_usage_aggregates.tokens + EXCLUDED.tokens,
                cost = CASE
                    WHEN EXCLUDED.cost IS NULL THEN token_usage_aggregates.cost
                    ELSE COALESCE(token_usage_aggregates.cost, 0) + EXCLUDED.cost
                END,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(event.credential_id)
        .bind(event.tokens)
        .bind(event.cost)
        .bind(event.timestamp)
        .execute(&mut *db_tx)
        .await?;

        db_tx.commit().await?;
        Ok(Applied::Applied)
    }
}
