//! Balance operations.

use std::collections::HashMap;

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use tracing::instrument;

use crate::cache::{CasOutcome, Observed};
use crate::db::models::{BalanceSnapshot, Transaction, TransactionKind};
use crate::errors::{Error, Result};
use crate::types::UserId;

use super::{balance_key, Ledger};

/// One entry of a batch balance update.
#[derive(Debug, Clone)]
pub struct BalanceUpdate {
    pub user_id: UserId,
    /// Non-negative magnitude; the kind determines the sign.
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub description: Option<String>,
}

impl Ledger {
    /// Seed a user's cache entry from the durable store.
    ///
    /// Overwrite, not merge: every concurrent seeder read the same source
    /// of truth, so last writer wins is safe.
    #[instrument(skip(self), err)]
    pub async fn init_balance(&self, user_id: UserId) -> Result<BalanceSnapshot> {
        let snapshot = match self.store.balance_aggregate(user_id).await? {
            Some(row) => BalanceSnapshot::from(row),
            None => BalanceSnapshot::zero(Utc::now()),
        };
        self.balances
            .overwrite(&balance_key(user_id), snapshot.clone(), self.balance_ttl)
            .await;
        Ok(snapshot)
    }

    /// A user's current balance. May be negative.
    pub async fn get_balance(&self, user_id: UserId) -> Result<Decimal> {
        Ok(self.get_balance_details(user_id).await?.current)
    }

    /// A user's full balance snapshot, read through the cache.
    #[instrument(skip(self), err)]
    pub async fn get_balance_details(&self, user_id: UserId) -> Result<BalanceSnapshot> {
        let key = balance_key(user_id);
        if let Some(hit) = self.balances.read(&key).await {
            return Ok(hit.value);
        }

        let seeded = self.init_balance(user_id).await?;
        match self.balances.read(&key).await {
            Some(hit) => Ok(hit.value),
            // The seed expired before we could read it back (sub-millisecond
            // TTLs only); the seeded value itself is still authoritative.
            None => Ok(seeded),
        }
    }

    /// A user's transaction history from the durable store, most recent
    /// first, capped at the configured bound. Lags the cache by
    /// queue-processing time.
    #[instrument(skip(self), err)]
    pub async fn transaction_history(
        &self,
        user_id: UserId,
        from: Option<chrono::DateTime<Utc>>,
        to: Option<chrono::DateTime<Utc>>,
    ) -> Result<Vec<Transaction>> {
        Ok(self
            .store
            .transaction_history(user_id, from, to, self.history_limit)
            .await?)
    }

    /// Apply one balance mutation.
    ///
    /// Returns `Ok(true)` once the cache commit lands and the transaction
    /// is handed to the write-behind queue. Returns `Ok(false)` when the
    /// optimistic retries are exhausted: the balance is unknown, nothing
    /// was enqueued, and the caller decides whether to retry later.
    #[instrument(skip(self, description), err)]
    pub async fn update_balance(
        &self,
        user_id: UserId,
        amount: Decimal,
        kind: TransactionKind,
        description: Option<String>,
    ) -> Result<bool> {
        let tx = Transaction::new(user_id, amount, kind, description)?;

        match self.commit_balance_update(&tx).await {
            Ok(_) => {
                self.enqueue_transaction(tx).await;
                Ok(true)
            }
            Err(Error::ConcurrencyExhausted { key, attempts }) => {
                counter!("meterd_cas_exhausted_total", "cache" => "balance").increment(1);
                tracing::warn!(key = %key, attempts, "Balance update gave up under contention");
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    /// Apply several balance mutations in a single optimistic round:
    /// observe all keys, compute all deltas, commit all-or-nothing.
    ///
    /// Subjects missing from the cache are seeded within the attempt, which
    /// invalidates the round's observations, so the round restarts.
    #[instrument(skip(self, updates), fields(count = updates.len()), err)]
    pub async fn update_balances(&self, updates: Vec<BalanceUpdate>) -> Result<bool> {
        if updates.is_empty() {
            return Ok(true);
        }

        let txs = updates
            .iter()
            .map(|u| Transaction::new(u.user_id, u.amount, u.kind, u.description.clone()))
            .collect::<Result<Vec<_>>>()?;

        match self.commit_balance_batch(&updates).await {
            Ok(()) => {
                for tx in txs {
                    self.enqueue_transaction(tx).await;
                }
                Ok(true)
            }
            Err(Error::ConcurrencyExhausted { key, attempts }) => {
                counter!("meterd_cas_exhausted_total", "cache" => "balance").increment(1);
                tracing::warn!(key = %key, attempts, "Batch balance update gave up under contention");
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    /// The optimistic read-compute-commit loop for a single subject.
    async fn commit_balance_update(&self, tx: &Transaction) -> Result<BalanceSnapshot> {
        let key = balance_key(tx.subject_id);

        for attempt in 1..=self.retry.max_attempts {
            let (observed, snapshot) = match self.balances.read(&key).await {
                Some(hit) => (Some(hit.version), hit.value),
                None => {
                    let seeded = self.init_balance(tx.subject_id).await?;
                    match self.balances.read(&key).await {
                        Some(hit) => (Some(hit.version), hit.value),
                        None => (None, seeded),
                    }
                }
            };

            let next = snapshot.apply(tx.kind, tx.amount, Utc::now());
            match self
                .balances
                .compare_and_swap(&key, observed, next.clone(), self.balance_ttl)
                .await
            {
                CasOutcome::Committed => return Ok(next),
                CasOutcome::Conflict => {
                    counter!("meterd_cas_conflicts_total", "cache" => "balance").increment(1);
                    tracing::debug!(key = %key, attempt, "Commit conflicted, retrying");
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                    }
                }
            }
        }

        Err(Error::ConcurrencyExhausted {
            key,
            attempts: self.retry.max_attempts,
        })
    }

    /// The whole-batch variant: one watch/commit round over every key.
    async fn commit_balance_batch(&self, updates: &[BalanceUpdate]) -> Result<()> {
        for attempt in 1..=self.retry.max_attempts {
            // Observation pass. Seeding an absent subject invalidates any
            // observation taken in this round, so restart (without burning
            // a backoff sleep) once everything is seeded.
            let mut observed: HashMap<String, (Observed, BalanceSnapshot)> = HashMap::new();
            let mut seeded_any = false;
            for update in updates {
                let key = balance_key(update.user_id);
                if observed.contains_key(&key) {
                    continue;
                }
                match self.balances.read(&key).await {
                    Some(hit) => {
                        observed.insert(key, (Some(hit.version), hit.value));
                    }
                    None => {
                        self.init_balance(update.user_id).await?;
                        seeded_any = true;
                    }
                }
            }
            if seeded_any {
                continue;
            }

            // Compute pass: fold every update into its subject's snapshot,
            // so one subject appearing twice accumulates both deltas.
            let now = Utc::now();
            for update in updates {
                let key = balance_key(update.user_id);
                if let Some(entry) = observed.get_mut(&key) {
                    entry.1 = entry.1.apply(update.kind, update.amount, now);
                }
            }

            let writes = observed
                .into_iter()
                .map(|(key, (version, value))| (key, version, value))
                .collect();
            match self
                .balances
                .compare_and_swap_many(writes, self.balance_ttl)
                .await
            {
                CasOutcome::Committed => return Ok(()),
                CasOutcome::Conflict => {
                    counter!("meterd_cas_conflicts_total", "cache" => "balance").increment(1);
                    tracing::debug!(attempt, "Batch commit conflicted, retrying");
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                    }
                }
            }
        }

        Err(Error::ConcurrencyExhausted {
            key: format!("batch of {} updates", updates.len()),
            attempts: self.retry.max_attempts,
        })
    }

    /// Hand a committed transaction to the write-behind queue.
    ///
    /// Enqueue failure does not roll back the cache commit: the cache is
    /// authoritative for reads, and the durable store stays behind until
    /// reconciled. Logged loudly instead.
    pub(crate) async fn enqueue_transaction(&self, tx: Transaction) {
        if let Err(source) = self.transactions.enqueue(&tx).await {
            let error = Error::Queue {
                what: "balance transaction",
                source,
            };
            counter!("meterd_enqueue_failures_total", "queue" => "transactions").increment(1);
            tracing::error!(
                transaction_id = %tx.id,
                subject_id = %tx.subject_id,
                error = %error,
                "Enqueue failed after cache commit; durable store is behind"
            );
        }
    }
}
