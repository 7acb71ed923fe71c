//! The ledger service.
//!
//! [`Ledger`] orchestrates the accounting engine: read-through cache
//! misses, the optimistic cache-update protocol, write-behind enqueueing,
//! and least-usage credential selection. The cache is authoritative for
//! reads the moment an update commits; the durable store converges
//! asynchronously through the queue consumer.
//!
//! Balance operations live in [`balance`], token-usage operations (and
//! credential selection) in [`token_usage`].

use std::sync::Arc;
use std::time::Duration;

use sluice::Queue;

use crate::cache::{RetryPolicy, SnapshotCache};
use crate::db::handlers::LedgerStore;
use crate::db::models::{BalanceSnapshot, TokenUsageSnapshot, Transaction, UsageEvent};
use crate::errors::{Error, Result};
use crate::singleflight::SingleFlight;
use crate::types::{CredentialId, UserId};

pub mod balance;
pub mod token_usage;

pub use balance::BalanceUpdate;

/// Cache key for a user's balance snapshot.
pub(crate) fn balance_key(user_id: UserId) -> String {
    format!("balance:{user_id}")
}

/// Cache key for a credential's token-usage snapshot.
pub(crate) fn token_usage_key(credential_id: CredentialId) -> String {
    format!("token_usage:{credential_id}")
}

/// The balance and token-usage ledger.
///
/// Cheap to share: wrap it in an [`Arc`] and hand clones to request
/// handlers. All dependencies are injected at construction via
/// [`Ledger::builder`]; construction fails fast if a cache is missing,
/// since the ledger cannot operate correctly without one.
pub struct Ledger {
    pub(crate) balances: Arc<dyn SnapshotCache<BalanceSnapshot>>,
    pub(crate) usage: Arc<dyn SnapshotCache<TokenUsageSnapshot>>,
    pub(crate) store: Arc<dyn LedgerStore>,
    pub(crate) transactions: Arc<dyn Queue<Transaction>>,
    pub(crate) usage_events: Arc<dyn Queue<UsageEvent>>,
    pub(crate) balance_ttl: Duration,
    pub(crate) token_usage_ttl: Duration,
    pub(crate) retry: RetryPolicy,
    pub(crate) history_limit: i64,
    pub(crate) usage_inits: SingleFlight<CredentialId, std::result::Result<TokenUsageSnapshot, String>>,
}

impl Ledger {
    pub fn builder() -> LedgerBuilder {
        LedgerBuilder::default()
    }

    /// Warm the cache from the durable store.
    ///
    /// Called once at process startup; every aggregate row is seeded as a
    /// fresh snapshot. Anything that expires afterwards is resurrected
    /// lazily by the read-through path.
    pub async fn resync(&self) -> Result<()> {
        let balances = self.store.all_balance_aggregates().await?;
        let balance_count = balances.len();
        for row in balances {
            let key = balance_key(row.user_id);
            self.balances
                .overwrite(&key, row.into(), self.balance_ttl)
                .await;
        }

        let usage = self.store.all_token_usage_aggregates().await?;
        let credential_count = usage.len();
        for row in usage {
            let key = token_usage_key(row.credential_id);
            self.usage
                .overwrite(&key, row.into(), self.token_usage_ttl)
                .await;
        }

        tracing::info!(
            balances = balance_count,
            credentials = credential_count,
            "Resynchronized cache from durable store"
        );
        Ok(())
    }
}

/// Builder for [`Ledger`].
#[derive(Default)]
pub struct LedgerBuilder {
    balances: Option<Arc<dyn SnapshotCache<BalanceSnapshot>>>,
    usage: Option<Arc<dyn SnapshotCache<TokenUsageSnapshot>>>,
    store: Option<Arc<dyn LedgerStore>>,
    transactions: Option<Arc<dyn Queue<Transaction>>>,
    usage_events: Option<Arc<dyn Queue<UsageEvent>>>,
    balance_ttl: Option<Duration>,
    token_usage_ttl: Option<Duration>,
    retry: Option<RetryPolicy>,
    history_limit: Option<i64>,
}

impl LedgerBuilder {
    pub fn balance_cache(mut self, cache: Arc<dyn SnapshotCache<BalanceSnapshot>>) -> Self {
        self.balances = Some(cache);
        self
    }

    pub fn token_usage_cache(mut self, cache: Arc<dyn SnapshotCache<TokenUsageSnapshot>>) -> Self {
        self.usage = Some(cache);
        self
    }

    pub fn store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transaction_queue(mut self, queue: Arc<dyn Queue<Transaction>>) -> Self {
        self.transactions = Some(queue);
        self
    }

    pub fn usage_event_queue(mut self, queue: Arc<dyn Queue<UsageEvent>>) -> Self {
        self.usage_events = Some(queue);
        self
    }

    /// TTL for balance snapshots (default 120s).
    pub fn balance_ttl(mut self, ttl: Duration) -> Self {
        self.balance_ttl = Some(ttl);
        self
    }

    /// TTL for token-usage snapshots (default 120s).
    pub fn token_usage_ttl(mut self, ttl: Duration) -> Self {
        self.token_usage_ttl = Some(ttl);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Cap on rows returned by history queries (default 100).
    pub fn history_limit(mut self, limit: i64) -> Self {
        self.history_limit = Some(limit);
        self
    }

    pub fn build(self) -> Result<Ledger> {
        let balances = self
            .balances
            .ok_or(Error::CacheUnavailable { which: "balance" })?;
        let usage = self.usage.ok_or(Error::CacheUnavailable {
            which: "token-usage",
        })?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("Ledger requires a durable store"))?;
        let transactions = self
            .transactions
            .ok_or_else(|| anyhow::anyhow!("Ledger requires a transaction queue"))?;
        let usage_events = self
            .usage_events
            .ok_or_else(|| anyhow::anyhow!("Ledger requires a usage-event queue"))?;

        Ok(Ledger {
            balances,
            usage,
            store,
            transactions,
            usage_events,
            balance_ttl: self.balance_ttl.unwrap_or(Duration::from_secs(120)),
            token_usage_ttl: self.token_usage_ttl.unwrap_or(Duration::from_secs(120)),
            retry: self.retry.unwrap_or_default(),
            history_limit: self.history_limit.unwrap_or(100),
            usage_inits: SingleFlight::new(),
        })
    }
}
