//! Ledger transaction records and the transaction-kind effect table.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Error;
use crate::types::{CredentialId, TransactionId, UserId};

/// Transaction kind, stored as TEXT in the database.
///
/// The kind alone determines the sign of a transaction's effect; the amount
/// is always a non-negative magnitude. This is the single effect table used
/// by both the cache-update path and the durable-store consumer:
///
/// | kind   | `current`  | `total_topups` | `total_usage` |
/// |--------|------------|----------------|---------------|
/// | Topup  | `+ amount` | `+ amount`     |               |
/// | Refund | `- amount` |                | `+ amount`    |
/// | Usage  | `- amount` |                | `+ amount`    |
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Topup,
    Refund,
    Usage,
}

impl TransactionKind {
    /// Signed effect on `current` for a non-negative magnitude.
    pub fn signed_amount(self, magnitude: Decimal) -> Decimal {
        match self {
            TransactionKind::Topup => magnitude,
            TransactionKind::Refund | TransactionKind::Usage => -magnitude,
        }
    }

    /// Whether this kind feeds the `total_topups` running total.
    pub fn adds_to_topups(self) -> bool {
        matches!(self, TransactionKind::Topup)
    }

    /// Whether this kind feeds the `total_usage` running total.
    pub fn adds_to_usage(self) -> bool {
        matches!(self, TransactionKind::Refund | TransactionKind::Usage)
    }
}

/// An immutable balance transaction, emitted once per mutation.
///
/// Created by the ledger after a successful cache commit, carried through
/// the write-behind queue, and applied to the durable store exactly once
/// (duplicate deliveries are detected by `id`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: TransactionId,
    pub subject_id: UserId,
    /// Non-negative magnitude; the kind determines the sign.
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    /// Build a validated transaction with a fresh id and timestamp.
    pub fn new(
        subject_id: UserId,
        amount: Decimal,
        kind: TransactionKind,
        description: Option<String>,
    ) -> Result<Self, Error> {
        let tx = Self {
            id: Uuid::new_v4(),
            subject_id,
            amount,
            kind,
            description,
            timestamp: Utc::now(),
        };
        tx.validate()?;
        Ok(tx)
    }

    /// Structural validation, also applied to payloads arriving off the
    /// queue (which may have been enqueued by an older or foreign writer).
    pub fn validate(&self) -> Result<(), Error> {
        if self.subject_id.is_nil() {
            return Err(Error::InvalidTransaction {
                reason: "subject id is nil".to_string(),
            });
        }
        if self.amount < Decimal::ZERO {
            return Err(Error::InvalidTransaction {
                reason: format!("amount {} is negative; kind determines sign", self.amount),
            });
        }
        Ok(())
    }
}

/// An immutable token-usage event for one credential.
///
/// The token-usage analogue of [`Transaction`]: same queue lifecycle, same
/// idempotent apply, but counted in tokens with an optional known cost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageEvent {
    pub id: TransactionId,
    pub credential_id: CredentialId,
    pub tokens: i64,
    /// `None` means the cost is unknown and contributes nothing to the
    /// aggregate cost (not zero).
    pub cost: Option<Decimal>,
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    /// Build a validated usage event with a fresh id and timestamp.
    pub fn new(
        credential_id: CredentialId,
        tokens: i64,
        cost: Option<Decimal>,
        description: Option<String>,
    ) -> Result<Self, Error> {
        let event = Self {
            id: Uuid::new_v4(),
            credential_id,
            tokens,
            cost,
            description,
            timestamp: Utc::now(),
        };
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.credential_id.is_nil() {
            return Err(Error::InvalidTransaction {
                reason: "credential id is nil".to_string(),
            });
        }
        if self.tokens < 0 {
            return Err(Error::InvalidTransaction {
                reason: format!("token count {} is negative", self.tokens),
            });
        }
        if self.cost.is_some_and(|cost| cost < Decimal::ZERO) {
            return Err(Error::InvalidTransaction {
                reason: "cost is negative".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effect_table_signs() {
        let five = Decimal::from(5);
        assert_eq!(TransactionKind::Topup.signed_amount(five), five);
        assert_eq!(TransactionKind::Refund.signed_amount(five), -five);
        assert_eq!(TransactionKind::Usage.signed_amount(five), -five);
    }

    #[test]
    fn effect_table_targets() {
        assert!(TransactionKind::Topup.adds_to_topups());
        assert!(!TransactionKind::Topup.adds_to_usage());
        assert!(TransactionKind::Refund.adds_to_usage());
        assert!(!TransactionKind::Refund.adds_to_topups());
        assert!(TransactionKind::Usage.adds_to_usage());
    }

    #[test]
    fn negative_amount_is_rejected() {
        let err = Transaction::new(
            Uuid::new_v4(),
            Decimal::from(-1),
            TransactionKind::Usage,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidTransaction { .. }));
    }

    #[test]
    fn nil_subject_is_rejected() {
        let err = Transaction::new(Uuid::nil(), Decimal::ONE, TransactionKind::Topup, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransaction { .. }));
    }

    #[test]
    fn usage_event_rejects_negative_tokens_and_cost() {
        assert!(UsageEvent::new(Uuid::new_v4(), -1, None, None).is_err());
        assert!(UsageEvent::new(Uuid::new_v4(), 1, Some(Decimal::new(-1, 2)), None).is_err());
        assert!(UsageEvent::new(Uuid::new_v4(), 1, None, None).is_ok());
    }
}
