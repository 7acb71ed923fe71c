//! In-memory implementation of the durable store.
//!
//! Keeps aggregates and records in process memory behind a `parking_lot`
//! lock. Suitable for tests and single-process deployments; everything is
//! lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::db::errors::Result;
use crate::db::models::{
    BalanceAggregate, TokenUsageAggregate, Transaction, UsageEvent,
};
use crate::types::{CredentialId, TransactionId, UserId};

use super::{Applied, LedgerStore};

#[derive(Default)]
struct Inner {
    balances: HashMap<UserId, BalanceAggregate>,
    usage: HashMap<CredentialId, TokenUsageAggregate>,
    transactions: HashMap<TransactionId, Transaction>,
    usage_events: HashMap<TransactionId, UsageEvent>,
}

/// In-memory durable store.
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load a balance aggregate, for seeding test fixtures.
    pub fn put_balance_aggregate(&self, row: BalanceAggregate) {
        self.inner.write().balances.insert(row.user_id, row);
    }

    /// Pre-load a usage aggregate, for seeding test fixtures.
    pub fn put_token_usage_aggregate(&self, row: TokenUsageAggregate) {
        self.inner.write().usage.insert(row.credential_id, row);
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn balance_aggregate(&self, user_id: UserId) -> Result<Option<BalanceAggregate>> {
        Ok(self.inner.read().balances.get(&user_id).cloned())
    }

    async fn all_balance_aggregates(&self) -> Result<Vec<BalanceAggregate>> {
        Ok(self.inner.read().balances.values().cloned().collect())
    }

    async fn apply_transaction(&self, tx: &Transaction) -> Result<Applied> {
        let mut inner = self.inner.write();

        if inner.transactions.contains_key(&tx.id) {
            return Ok(Applied::Duplicate);
        }
        inner.transactions.insert(tx.id, tx.clone());

        let row = inner
            .balances
            .entry(tx.subject_id)
            .or_insert_with(|| BalanceAggregate {
                user_id: tx.subject_id,
                current: Decimal::ZERO,
                total_topups: Decimal::ZERO,
                total_usage: Decimal::ZERO,
                updated_at: tx.timestamp,
            });
        row.current += tx.kind.signed_amount(tx.amount);
        if tx.kind.adds_to_topups() {
            row.total_topups += tx.amount;
        }
        if tx.kind.adds_to_usage() {
            row.total_usage += tx.amount;
        }
        row.updated_at = tx.timestamp;

        Ok(Applied::Applied)
    }

    async fn transaction_history(
        &self,
        subject_id: UserId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Transaction>> {
        let inner = self.inner.read();
        let mut matching: Vec<Transaction> = inner
            .transactions
            .values()
            .filter(|tx| tx.subject_id == subject_id)
            .filter(|tx| from.is_none_or(|from| tx.timestamp >= from))
            .filter(|tx| to.is_none_or(|to| tx.timestamp <= to))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn token_usage_aggregate(
        &self,
        credential_id: CredentialId,
    ) -> Result<Option<TokenUsageAggregate>> {
        Ok(self.inner.read().usage.get(&credential_id).cloned())
    }

    async fn all_token_usage_aggregates(&self) -> Result<Vec<TokenUsageAggregate>> {
        Ok(self.inner.read().usage.values().cloned().collect())
    }

    async fn apply_usage_event(&self, event: &UsageEvent) -> Result<Applied> {
        let mut inner = self.inner.write();

        if inner.usage_events.contains_key(&event.id) {
            return Ok(Applied::Duplicate);
        }
        inner.usage_events.insert(event.id, event.clone());

        let row = inner
            .usage
            .entry(event.credential_id)
            .or_insert_with(|| TokenUsageAggregate {
                credential_id: event.credential_id,
                tokens: 0,
                cost: None,
                updated_at: event.timestamp,
            });
        row.tokens += event.tokens;
        if let Some(cost) = event.cost {
            row.cost = Some(row.cost.unwrap_or(Decimal::ZERO) + cost);
        }
        row.updated_at = event.timestamp;

        Ok(Applied::Applied)
    }
}
