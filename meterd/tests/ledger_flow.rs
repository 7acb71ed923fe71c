//! End-to-end ledger behavior over the in-memory cache, store, and queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use meterd::cache::{
    CasOutcome, MemorySnapshotCache, Observed, RetryPolicy, SnapshotCache, Versioned,
};
use meterd::consumer::TransactionApplier;
use meterd::db::errors::Result as DbResult;
use meterd::db::handlers::{Applied, LedgerStore, MemoryLedgerStore};
use meterd::db::models::{
    BalanceAggregate, TokenUsageAggregate, Transaction, TransactionKind, UsageEvent,
};
use meterd::ledger::{BalanceUpdate, Ledger};
use meterd::types::{CredentialId, UserId};
use sluice::{JobOptions, MemoryQueue, Queue, Worker, WorkerConfig};

fn money(s: &str) -> Decimal {
    s.parse().unwrap()
}

struct Fixture {
    store: Arc<MemoryLedgerStore>,
    transactions: Arc<MemoryQueue<Transaction>>,
    usage_events: Arc<MemoryQueue<UsageEvent>>,
    ledger: Arc<Ledger>,
}

/// Ledger over in-memory everything. Queue jobs become claimable
/// immediately so tests can inspect them.
fn fixture() -> Fixture {
    fixture_with(RetryPolicy::default(), Duration::from_secs(120))
}

fn fixture_with(retry: RetryPolicy, ttl: Duration) -> Fixture {
    let store = Arc::new(MemoryLedgerStore::new());
    let queue_options = JobOptions {
        initial_delay: Duration::ZERO,
        ..JobOptions::default()
    };
    let transactions = Arc::new(MemoryQueue::new(queue_options.clone()));
    let usage_events = Arc::new(MemoryQueue::new(queue_options));

    let ledger = Ledger::builder()
        .balance_cache(Arc::new(MemorySnapshotCache::new()))
        .token_usage_cache(Arc::new(MemorySnapshotCache::new()))
        .store(store.clone())
        .transaction_queue(transactions.clone())
        .usage_event_queue(usage_events.clone())
        .balance_ttl(ttl)
        .token_usage_ttl(ttl)
        .retry_policy(retry)
        .build()
        .unwrap();

    Fixture {
        store,
        transactions,
        usage_events,
        ledger: Arc::new(ledger),
    }
}

fn balance_row(user_id: UserId, current: &str, topups: &str, usage: &str) -> BalanceAggregate {
    BalanceAggregate {
        user_id,
        current: money(current),
        total_topups: money(topups),
        total_usage: money(usage),
        updated_at: Utc::now(),
    }
}

fn usage_row(credential_id: CredentialId, tokens: i64) -> TokenUsageAggregate {
    TokenUsageAggregate {
        credential_id,
        tokens,
        cost: None,
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn scenario_a_concurrent_usage_loses_nothing() {
    let fx = fixture();
    let user = Uuid::new_v4();
    fx.store
        .put_balance_aggregate(balance_row(user, "10.00", "10.00", "0"));

    let first = {
        let ledger = fx.ledger.clone();
        tokio::spawn(async move {
            ledger
                .update_balance(user, money("5.00"), TransactionKind::Usage, None)
                .await
        })
    };
    let second = {
        let ledger = fx.ledger.clone();
        tokio::spawn(async move {
            ledger
                .update_balance(user, money("5.00"), TransactionKind::Usage, None)
                .await
        })
    };

    assert!(first.await.unwrap().unwrap());
    assert!(second.await.unwrap().unwrap());

    let details = fx.ledger.get_balance_details(user).await.unwrap();
    assert_eq!(details.current, money("0.00"));
    assert_eq!(details.total_usage, money("10.00"));
    assert_eq!(fx.transactions.pending_count().await.unwrap(), 2);
}

#[tokio::test]
async fn scenario_b_cache_miss_reads_through_and_reseeds() {
    let fx = fixture();
    let user = Uuid::new_v4();
    fx.store
        .put_balance_aggregate(balance_row(user, "42.00", "42.00", "0"));

    assert_eq!(fx.ledger.get_balance(user).await.unwrap(), money("42.00"));

    // Mutating the durable store now must not show up: the cache entry
    // exists and is authoritative until it expires.
    fx.store
        .put_balance_aggregate(balance_row(user, "1.00", "1.00", "0"));
    assert_eq!(fx.ledger.get_balance(user).await.unwrap(), money("42.00"));
}

/// Cache that refuses every conditional commit.
struct ContendedCache<V> {
    inner: MemorySnapshotCache<V>,
}

#[async_trait]
impl<V> SnapshotCache<V> for ContendedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn read(&self, key: &str) -> Option<Versioned<V>> {
        self.inner.read(key).await
    }

    async fn compare_and_swap(&self, _: &str, _: Observed, _: V, _: Duration) -> CasOutcome {
        CasOutcome::Conflict
    }

    async fn compare_and_swap_many(
        &self,
        _: Vec<(String, Observed, V)>,
        _: Duration,
    ) -> CasOutcome {
        CasOutcome::Conflict
    }

    async fn overwrite(&self, key: &str, value: V, ttl: Duration) {
        self.inner.overwrite(key, value, ttl).await
    }

    async fn remove(&self, key: &str) {
        self.inner.remove(key).await
    }
}

#[tokio::test]
async fn scenario_c_exhausted_retries_fail_softly_and_enqueue_nothing() {
    let store = Arc::new(MemoryLedgerStore::new());
    let transactions: Arc<MemoryQueue<Transaction>> = Arc::new(MemoryQueue::new(JobOptions {
        initial_delay: Duration::ZERO,
        ..JobOptions::default()
    }));
    let usage_events: Arc<MemoryQueue<UsageEvent>> = Arc::new(MemoryQueue::default());

    let ledger = Ledger::builder()
        .balance_cache(Arc::new(ContendedCache {
            inner: MemorySnapshotCache::new(),
        }))
        .token_usage_cache(Arc::new(MemorySnapshotCache::new()))
        .store(store)
        .transaction_queue(transactions.clone())
        .usage_event_queue(usage_events)
        .retry_policy(RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
        })
        .build()
        .unwrap();

    let user = Uuid::new_v4();
    let ok = ledger
        .update_balance(user, money("5.00"), TransactionKind::Usage, None)
        .await
        .unwrap();

    assert!(!ok);
    assert_eq!(transactions.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn scenario_d_least_used_credential_with_tie_break() {
    let fx = fixture();
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    fx.store.put_token_usage_aggregate(usage_row(a, 100));
    fx.store.put_token_usage_aggregate(usage_row(b, 50));
    fx.store.put_token_usage_aggregate(usage_row(c, 50));

    let chosen = fx
        .ledger
        .choose_least_used_credential(&[a, b, c])
        .await
        .unwrap();
    assert_eq!(chosen, Some(b));

    // Tie between b and c: first in input order wins.
    let chosen = fx
        .ledger
        .choose_least_used_credential(&[a, c, b])
        .await
        .unwrap();
    assert_eq!(chosen, Some(c));

    // A candidate with no history anywhere defaults to 0 tokens.
    let fresh = Uuid::new_v4();
    let chosen = fx
        .ledger
        .choose_least_used_credential(&[a, b, fresh])
        .await
        .unwrap();
    assert_eq!(chosen, Some(fresh));

    let none = fx.ledger.choose_least_used_credential(&[]).await.unwrap();
    assert_eq!(none, None);
}

#[tokio::test]
async fn no_lost_updates_under_heavy_contention() {
    // Zero backoff keeps the test fast; every conflicted round means some
    // other writer committed, so progress is guaranteed.
    let fx = fixture_with(
        RetryPolicy {
            max_attempts: 50,
            base_delay: Duration::ZERO,
        },
        Duration::from_secs(120),
    );
    let user = Uuid::new_v4();

    let mut handles = Vec::new();
    for i in 0..12u32 {
        let ledger = fx.ledger.clone();
        handles.push(tokio::spawn(async move {
            let (amount, kind) = if i % 3 == 0 {
                (money("9.00"), TransactionKind::Topup)
            } else {
                (money("2.00"), TransactionKind::Usage)
            };
            ledger.update_balance(user, amount, kind, None).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap());
    }

    // 4 topups of 9.00, 8 usages of 2.00.
    let details = fx.ledger.get_balance_details(user).await.unwrap();
    assert_eq!(details.total_topups, money("36.00"));
    assert_eq!(details.total_usage, money("16.00"));
    assert_eq!(details.current, money("20.00"));
    assert_eq!(fx.transactions.pending_count().await.unwrap(), 12);
}

#[tokio::test]
async fn seeding_twice_is_idempotent() {
    let fx = fixture();
    let user = Uuid::new_v4();
    fx.store
        .put_balance_aggregate(balance_row(user, "7.50", "10.00", "2.50"));

    let first = fx.ledger.init_balance(user).await.unwrap();
    let second = fx.ledger.init_balance(user).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn expired_entry_is_resurrected_from_the_store() {
    let fx = fixture_with(RetryPolicy::default(), Duration::from_millis(40));
    let user = Uuid::new_v4();
    fx.store
        .put_balance_aggregate(balance_row(user, "5.00", "5.00", "0"));

    assert_eq!(fx.ledger.get_balance(user).await.unwrap(), money("5.00"));

    // The consumer catches the durable store up while the entry ages out.
    fx.store
        .put_balance_aggregate(balance_row(user, "3.00", "5.00", "2.00"));
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(fx.ledger.get_balance(user).await.unwrap(), money("3.00"));
}

/// Store wrapper that counts usage-aggregate reads and makes them slow
/// enough to overlap.
struct CountingStore {
    inner: MemoryLedgerStore,
    usage_reads: AtomicU32,
}

#[async_trait]
impl LedgerStore for CountingStore {
    async fn balance_aggregate(&self, user_id: UserId) -> DbResult<Option<BalanceAggregate>> {
        self.inner.balance_aggregate(user_id).await
    }
    async fn all_balance_aggregates(&self) -> DbResult<Vec<BalanceAggregate>> {
        self.inner.all_balance_aggregates().await
    }
    async fn apply_transaction(&self, tx: &Transaction) -> DbResult<Applied> {
        self.inner.apply_transaction(tx).await
    }
    async fn transaction_history(
        &self,
        subject_id: UserId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: i64,
    ) -> DbResult<Vec<Transaction>> {
        self.inner.transaction_history(subject_id, from, to, limit).await
    }
    async fn token_usage_aggregate(
        &self,
        credential_id: CredentialId,
    ) -> DbResult<Option<TokenUsageAggregate>> {
        self.usage_reads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.token_usage_aggregate(credential_id).await
    }
    async fn all_token_usage_aggregates(&self) -> DbResult<Vec<TokenUsageAggregate>> {
        self.inner.all_token_usage_aggregates().await
    }
    async fn apply_usage_event(&self, event: &UsageEvent) -> DbResult<Applied> {
        self.inner.apply_usage_event(event).await
    }
}

#[tokio::test]
async fn concurrent_usage_misses_share_one_store_read() {
    let store = Arc::new(CountingStore {
        inner: MemoryLedgerStore::new(),
        usage_reads: AtomicU32::new(0),
    });
    let ledger = Arc::new(
        Ledger::builder()
            .balance_cache(Arc::new(MemorySnapshotCache::new()))
            .token_usage_cache(Arc::new(MemorySnapshotCache::new()))
            .store(store.clone())
            .transaction_queue(Arc::new(MemoryQueue::<Transaction>::default()))
            .usage_event_queue(Arc::new(MemoryQueue::<UsageEvent>::default()))
            .build()
            .unwrap(),
    );
    let credential = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(
            async move { ledger.get_token_usage(credential).await },
        ));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().tokens, 0);
    }

    assert_eq!(store.usage_reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn batch_update_commits_every_subject_and_enqueues_each() {
    let fx = fixture();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    fx.store
        .put_balance_aggregate(balance_row(alice, "10.00", "10.00", "0"));
    // bob has no durable history and gets seeded at zero mid-round.

    let ok = fx
        .ledger
        .update_balances(vec![
            BalanceUpdate {
                user_id: alice,
                amount: money("4.00"),
                kind: TransactionKind::Usage,
                description: None,
            },
            BalanceUpdate {
                user_id: bob,
                amount: money("25.00"),
                kind: TransactionKind::Topup,
                description: Some("welcome grant".to_string()),
            },
            BalanceUpdate {
                user_id: alice,
                amount: money("1.00"),
                kind: TransactionKind::Usage,
                description: None,
            },
        ])
        .await
        .unwrap();
    assert!(ok);

    assert_eq!(fx.ledger.get_balance(alice).await.unwrap(), money("5.00"));
    assert_eq!(fx.ledger.get_balance(bob).await.unwrap(), money("25.00"));
    assert_eq!(fx.transactions.pending_count().await.unwrap(), 3);
}

#[tokio::test]
async fn committed_updates_survive_a_broken_queue() {
    /// Queue whose enqueue always fails.
    struct BrokenQueue;

    #[async_trait]
    impl Queue<Transaction> for BrokenQueue {
        async fn enqueue(&self, _: &Transaction) -> sluice::Result<sluice::JobId> {
            Err(sluice::SluiceError::Other(anyhow::anyhow!(
                "queue unavailable"
            )))
        }
        async fn claim(&self, _: usize) -> sluice::Result<Vec<sluice::Job<Transaction>>> {
            Ok(Vec::new())
        }
        async fn complete(&self, id: sluice::JobId) -> sluice::Result<()> {
            Err(sluice::SluiceError::JobNotFound(id))
        }
        async fn release(&self, id: sluice::JobId, _: DateTime<Utc>) -> sluice::Result<()> {
            Err(sluice::SluiceError::JobNotFound(id))
        }
        async fn fail(&self, id: sluice::JobId, _: &str) -> sluice::Result<()> {
            Err(sluice::SluiceError::JobNotFound(id))
        }
        async fn reclaim_stale(&self) -> sluice::Result<u64> {
            Ok(0)
        }
        async fn pending_count(&self) -> sluice::Result<u64> {
            Ok(0)
        }
        async fn failed_jobs(&self, _: usize) -> sluice::Result<Vec<sluice::FailedJob<Transaction>>> {
            Ok(Vec::new())
        }
        fn options(&self) -> &JobOptions {
            static OPTIONS: std::sync::OnceLock<JobOptions> = std::sync::OnceLock::new();
            OPTIONS.get_or_init(JobOptions::default)
        }
    }

    let store = Arc::new(MemoryLedgerStore::new());
    let ledger = Ledger::builder()
        .balance_cache(Arc::new(MemorySnapshotCache::new()))
        .token_usage_cache(Arc::new(MemorySnapshotCache::new()))
        .store(store)
        .transaction_queue(Arc::new(BrokenQueue))
        .usage_event_queue(Arc::new(MemoryQueue::<UsageEvent>::default()))
        .build()
        .unwrap();

    let user = Uuid::new_v4();
    // The cache commit already happened; a dead queue only delays
    // durability, it does not fail the update.
    let ok = ledger
        .update_balance(user, money("9.99"), TransactionKind::Topup, None)
        .await
        .unwrap();
    assert!(ok);
    assert_eq!(ledger.get_balance(user).await.unwrap(), money("9.99"));
}

#[test_log::test(tokio::test)]
async fn durable_store_converges_through_the_worker() {
    let fx = fixture();
    let user = Uuid::new_v4();

    assert!(
        fx.ledger
            .update_balance(user, money("30.00"), TransactionKind::Topup, None)
            .await
            .unwrap()
    );
    assert!(
        fx.ledger
            .update_balance(user, money("12.50"), TransactionKind::Usage, None)
            .await
            .unwrap()
    );

    let shutdown = CancellationToken::new();
    let worker = Worker::new(
        fx.transactions.clone(),
        Arc::new(TransactionApplier::new(fx.store.clone())),
        WorkerConfig {
            poll_interval: Duration::from_millis(5),
            claim_batch_size: 10,
        },
    );
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    // Wait for both transactions to land in the durable store.
    let mut converged = false;
    for _ in 0..200 {
        if let Some(row) = fx.store.balance_aggregate(user).await.unwrap() {
            if row.current == money("17.50") {
                converged = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert!(converged, "durable store never caught up with the cache");
    let row = fx.store.balance_aggregate(user).await.unwrap().unwrap();
    assert_eq!(row.total_topups, money("30.00"));
    assert_eq!(row.total_usage, money("12.50"));

    // And the history shows both records, newest first.
    let history = fx
        .ledger
        .transaction_history(user, None, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].timestamp >= history[1].timestamp);
}

#[tokio::test]
async fn resync_warms_the_cache_for_every_subject() {
    let fx = fixture();
    let user = Uuid::new_v4();
    let credential = Uuid::new_v4();
    fx.store
        .put_balance_aggregate(balance_row(user, "11.00", "11.00", "0"));
    fx.store.put_token_usage_aggregate(usage_row(credential, 77));

    fx.ledger.resync().await.unwrap();

    // Wipe the durable store; reads must now be served by the cache alone.
    fx.store
        .put_balance_aggregate(balance_row(user, "0", "0", "0"));
    fx.store.put_token_usage_aggregate(usage_row(credential, 0));

    assert_eq!(fx.ledger.get_balance(user).await.unwrap(), money("11.00"));
    assert_eq!(
        fx.ledger.get_token_usage(credential).await.unwrap().tokens,
        77
    );
}

#[tokio::test]
async fn builder_without_a_cache_fails_fast() {
    let result = Ledger::builder()
        .store(Arc::new(MemoryLedgerStore::new()))
        .transaction_queue(Arc::new(MemoryQueue::<Transaction>::default()))
        .usage_event_queue(Arc::new(MemoryQueue::<UsageEvent>::default()))
        .build();

    assert!(matches!(
        result,
        Err(meterd::Error::CacheUnavailable { .. })
    ));
}

#[tokio::test]
async fn token_usage_updates_flow_to_their_own_queue() {
    let fx = fixture();
    let credential = Uuid::new_v4();

    let ok = fx
        .ledger
        .update_token_usage(credential, 1200, Some(money("0.04")), Some("chat".to_string()))
        .await
        .unwrap();
    assert!(ok);
    let ok = fx
        .ledger
        .update_token_usage(credential, 300, None, None)
        .await
        .unwrap();
    assert!(ok);

    let snapshot = fx.ledger.get_token_usage(credential).await.unwrap();
    assert_eq!(snapshot.tokens, 1500);
    // The second update's unknown cost added nothing.
    assert_eq!(snapshot.cost, Some(money("0.04")));

    assert_eq!(fx.usage_events.pending_count().await.unwrap(), 2);
    let claimed = fx.usage_events.claim(10).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].payload.tokens, 1200);
}
