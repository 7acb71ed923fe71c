//! Token-usage snapshots and durable aggregate rows.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::CredentialId;

/// Cached view of one credential's accumulated token usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageSnapshot {
    pub tokens: i64,
    /// `None` while no priced usage has been recorded. Unknown, not zero:
    /// an unknown cost must never be folded into the aggregate as `0`.
    pub cost: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl TokenUsageSnapshot {
    /// The snapshot for a credential with no durable history.
    pub fn zero(now: DateTime<Utc>) -> Self {
        Self {
            tokens: 0,
            cost: None,
            updated_at: now,
        }
    }

    /// The snapshot after recording `tokens` more tokens, adding `cost`
    /// to the aggregate cost only when it is known.
    pub fn add(&self, tokens: i64, cost: Option<Decimal>, now: DateTime<Utc>) -> Self {
        Self {
            tokens: self.tokens + tokens,
            cost: match (self.cost, cost) {
                (Some(total), Some(cost)) => Some(total + cost),
                (Some(total), None) => Some(total),
                (None, Some(cost)) => Some(cost),
                (None, None) => None,
            },
            updated_at: now,
        }
    }
}

/// Durable per-credential usage aggregate row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TokenUsageAggregate {
    pub credential_id: CredentialId,
    pub tokens: i64,
    pub cost: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl From<TokenUsageAggregate> for TokenUsageSnapshot {
    fn from(row: TokenUsageAggregate) -> Self {
        Self {
            tokens: row.tokens,
            cost: row.cost,
            updated_at: row.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_cost_adds_nothing() {
        let now = Utc::now();
        let snapshot = TokenUsageSnapshot::zero(now).add(100, None, now);
        assert_eq!(snapshot.tokens, 100);
        assert_eq!(snapshot.cost, None);

        let priced = snapshot.add(50, Some(Decimal::new(25, 2)), now);
        assert_eq!(priced.tokens, 150);
        assert_eq!(priced.cost, Some(Decimal::new(25, 2)));

        // A later unknown cost leaves the known total untouched.
        let mixed = priced.add(10, None, now);
        assert_eq!(mixed.cost, Some(Decimal::new(25, 2)));
    }
}
