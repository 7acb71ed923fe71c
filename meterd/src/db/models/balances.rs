//! Balance snapshots and durable aggregate rows.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::transactions::TransactionKind;
use crate::types::UserId;

/// Cached view of one user's balance.
///
/// `current` may go negative: debit beyond zero is permitted, and callers
/// that care must pre-check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub current: Decimal,
    pub total_topups: Decimal,
    pub total_usage: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    /// The snapshot for a user with no durable history.
    pub fn zero(now: DateTime<Utc>) -> Self {
        Self {
            current: Decimal::ZERO,
            total_topups: Decimal::ZERO,
            total_usage: Decimal::ZERO,
            updated_at: now,
        }
    }

    /// The snapshot after applying one transaction of `kind` with the given
    /// non-negative magnitude. Arithmetic comes from the
    /// [`TransactionKind`] effect table.
    pub fn apply(&self, kind: TransactionKind, amount: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            current: self.current + kind.signed_amount(amount),
            total_topups: if kind.adds_to_topups() {
                self.total_topups + amount
            } else {
                self.total_topups
            },
            total_usage: if kind.adds_to_usage() {
                self.total_usage + amount
            } else {
                self.total_usage
            },
            updated_at: now,
        }
    }
}

/// Durable per-user balance aggregate row.
///
/// Mutated only by the queue consumer; the synchronous path reads it for
/// cache seeding.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BalanceAggregate {
    pub user_id: UserId,
    pub current: Decimal,
    pub total_topups: Decimal,
    pub total_usage: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl From<BalanceAggregate> for BalanceSnapshot {
    fn from(row: BalanceAggregate) -> Self {
        Self {
            current: row.current,
            total_topups: row.total_topups,
            total_usage: row.total_usage,
            updated_at: row.updated_at,
        }
    }
}
