//! Queue consumers that reconcile the durable store with the cache.
//!
//! Each applier implements [`sluice::Handler`] for one payload type and
//! applies deliveries through the store's idempotent apply path, so
//! at-least-once delivery still mutates each aggregate exactly once.
//!
//! Failure classification follows the propagation policy: a malformed
//! payload is structural (fatal, the job is retained immediately), a
//! durable-store error is transient (the job is redelivered with backoff).

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use sluice::{Handler, HandlerError, Job};

use crate::db::handlers::{Applied, LedgerStore};
use crate::db::models::{Transaction, UsageEvent};

/// Applies balance transactions to the durable store.
pub struct TransactionApplier {
    store: Arc<dyn LedgerStore>,
}

impl TransactionApplier {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler<Transaction> for TransactionApplier {
    async fn handle(&self, job: &Job<Transaction>) -> Result<(), HandlerError> {
        let tx = &job.payload;
        tx.validate().map_err(|e| HandlerError::Fatal(e.into()))?;

        match self.store.apply_transaction(tx).await {
            Ok(Applied::Applied) => {
                counter!("meterd_transactions_applied_total").increment(1);
                Ok(())
            }
            Ok(Applied::Duplicate) => {
                counter!("meterd_transactions_duplicate_total").increment(1);
                tracing::debug!(transaction_id = %tx.id, "Redelivered transaction already applied");
                Ok(())
            }
            Err(error) => Err(HandlerError::Retry(error.into())),
        }
    }
}

/// Applies token-usage events to the durable store.
pub struct UsageEventApplier {
    store: Arc<dyn LedgerStore>,
}

impl UsageEventApplier {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler<UsageEvent> for UsageEventApplier {
    async fn handle(&self, job: &Job<UsageEvent>) -> Result<(), HandlerError> {
        let event = &job.payload;
        event.validate().map_err(|e| HandlerError::Fatal(e.into()))?;

        match self.store.apply_usage_event(event).await {
            Ok(Applied::Applied) => {
                counter!("meterd_usage_events_applied_total").increment(1);
                Ok(())
            }
            Ok(Applied::Duplicate) => {
                counter!("meterd_usage_events_duplicate_total").increment(1);
                tracing::debug!(event_id = %event.id, "Redelivered usage event already applied");
                Ok(())
            }
            Err(error) => Err(HandlerError::Retry(error.into())),
        }
    }
}
