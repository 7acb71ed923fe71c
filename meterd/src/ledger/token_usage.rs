//! Token-usage operations and least-usage credential selection.

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use tracing::instrument;

use crate::cache::CasOutcome;
use crate::db::models::{TokenUsageSnapshot, UsageEvent};
use crate::errors::{Error, Result};
use crate::types::CredentialId;

use super::{token_usage_key, Ledger};

impl Ledger {
    /// Seed a credential's cache entry from the durable store.
    ///
    /// De-duplicated per credential within the process: concurrent callers
    /// share one in-flight durable read instead of issuing redundant ones.
    /// The in-flight entry is cleared once initialization completes, so a
    /// later call starts fresh.
    #[instrument(skip(self), err)]
    pub async fn init_token_usage(&self, credential_id: CredentialId) -> Result<TokenUsageSnapshot> {
        let store = self.store.clone();
        let cache = self.usage.clone();
        let ttl = self.token_usage_ttl;

        let outcome = self
            .usage_inits
            .run(credential_id, async move {
                let snapshot = match store.token_usage_aggregate(credential_id).await {
                    Ok(Some(row)) => TokenUsageSnapshot::from(row),
                    Ok(None) => TokenUsageSnapshot::zero(Utc::now()),
                    Err(error) => return Err(format!("{error:#}")),
                };
                cache
                    .overwrite(&token_usage_key(credential_id), snapshot.clone(), ttl)
                    .await;
                Ok(snapshot)
            })
            .await;

        outcome.map_err(|message| Error::SharedInit { message })
    }

    /// A credential's usage snapshot, read through the cache.
    #[instrument(skip(self), err)]
    pub async fn get_token_usage(&self, credential_id: CredentialId) -> Result<TokenUsageSnapshot> {
        let key = token_usage_key(credential_id);
        if let Some(hit) = self.usage.read(&key).await {
            return Ok(hit.value);
        }

        let seeded = self.init_token_usage(credential_id).await?;
        match self.usage.read(&key).await {
            Some(hit) => Ok(hit.value),
            None => Ok(seeded),
        }
    }

    /// Record tokens (and cost, when known) against a credential.
    ///
    /// Same contract as [`Ledger::update_balance`]: `Ok(false)` means the
    /// optimistic retries were exhausted and nothing was enqueued.
    #[instrument(skip(self, description), err)]
    pub async fn update_token_usage(
        &self,
        credential_id: CredentialId,
        tokens: i64,
        cost: Option<Decimal>,
        description: Option<String>,
    ) -> Result<bool> {
        let event = UsageEvent::new(credential_id, tokens, cost, description)?;

        match self.commit_usage_update(&event).await {
            Ok(_) => {
                self.enqueue_usage_event(event).await;
                Ok(true)
            }
            Err(Error::ConcurrencyExhausted { key, attempts }) => {
                counter!("meterd_cas_exhausted_total", "cache" => "token_usage").increment(1);
                tracing::warn!(key = %key, attempts, "Token-usage update gave up under contention");
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    /// Pick the candidate with the minimum current token count.
    ///
    /// Cache first; a candidate missing from the cache is resolved from
    /// the durable store (0 tokens if absent there too) and backfilled
    /// before the comparison. Ties go to the first candidate in input
    /// order. Empty input yields `None`.
    #[instrument(skip(self, candidates), fields(candidates = candidates.len()), err)]
    pub async fn choose_least_used_credential(
        &self,
        candidates: &[CredentialId],
    ) -> Result<Option<CredentialId>> {
        let mut best: Option<(CredentialId, i64)> = None;

        for &candidate in candidates {
            let tokens = match self.usage.read(&token_usage_key(candidate)).await {
                Some(hit) => hit.value.tokens,
                None => self.init_token_usage(candidate).await?.tokens,
            };
            if best.is_none_or(|(_, min)| tokens < min) {
                best = Some((candidate, tokens));
            }
        }

        Ok(best.map(|(candidate, _)| candidate))
    }

    async fn commit_usage_update(&self, event: &UsageEvent) -> Result<TokenUsageSnapshot> {
        let key = token_usage_key(event.credential_id);

        for attempt in 1..=self.retry.max_attempts {
            let (observed, snapshot) = match self.usage.read(&key).await {
                Some(hit) => (Some(hit.version), hit.value),
                None => {
                    let seeded = self.init_token_usage(event.credential_id).await?;
                    match self.usage.read(&key).await {
                        Some(hit) => (Some(hit.version), hit.value),
                        None => (None, seeded),
                    }
                }
            };

            let next = snapshot.add(event.tokens, event.cost, Utc::now());
            match self
                .usage
                .compare_and_swap(&key, observed, next.clone(), self.token_usage_ttl)
                .await
            {
                CasOutcome::Committed => return Ok(next),
                CasOutcome::Conflict => {
                    counter!("meterd_cas_conflicts_total", "cache" => "token_usage").increment(1);
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

    pub(crate) async fn enqueue_usage_event(&self, event: UsageEvent) {
        if let Err(source) = self.usage_events.enqueue(&event).await {
            let error = Error::Queue {
                what: "usage event",
                source,
            };
            counter!("meterd_enqueue_failures_total", "queue" => "usage_events").increment(1);
            tracing::error!(
                event_id = %event.id,
                credential_id = %event.credential_id,
                error = %error,
                "Enqueue failed after cache commit; durable store is behind"
            );
        }
    }
}
