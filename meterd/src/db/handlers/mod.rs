//! Durable-store access layer.
//!
//! The [`LedgerStore`] trait is the ledger's entire surface against the
//! durable store: aggregate reads for cache seeding, idempotent transaction
//! application for the queue consumer, and bounded history queries. There
//! is no retry logic at this layer; retries belong to the queue and the
//! optimistic-update protocol above it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::errors::Result;
use crate::db::models::{
    BalanceAggregate, TokenUsageAggregate, Transaction, UsageEvent,
};
use crate::types::{CredentialId, UserId};

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PostgresLedgerStore;

/// Outcome of an idempotent apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The record was new and the aggregate was updated.
    Applied,
    /// The record was seen before; nothing changed.
    Duplicate,
}

/// Query and write surface of the durable analytical store.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Per-user balance aggregate, if the user has durable history.
    async fn balance_aggregate(&self, user_id: UserId) -> Result<Option<BalanceAggregate>>;

    /// All balance aggregates. Used only for full cache resynchronization
    /// at process startup.
    async fn all_balance_aggregates(&self) -> Result<Vec<BalanceAggregate>>;

    /// Apply a balance transaction: record it and fold it into the
    /// subject's aggregate, atomically and exactly once per transaction id.
    async fn apply_transaction(&self, tx: &Transaction) -> Result<Applied>;

    /// A subject's transactions, most recent first, capped at `limit`.
    async fn transaction_history(
        &self,
        subject_id: UserId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Transaction>>;

    /// Per-credential token-usage aggregate, if the credential has durable
    /// history.
    async fn token_usage_aggregate(
        &self,
        credential_id: CredentialId,
    ) -> Result<Option<TokenUsageAggregate>>;

    /// All token-usage aggregates, for startup resynchronization.
    async fn all_token_usage_aggregates(&self) -> Result<Vec<TokenUsageAggregate>>;

    /// Apply a usage event, idempotently, like
    /// [`apply_transaction`](LedgerStore::apply_transaction).
    async fn apply_usage_event(&self, event: &UsageEvent) -> Result<Applied>;
}
