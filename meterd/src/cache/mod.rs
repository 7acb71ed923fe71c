//! Snapshot cache with versioned compare-and-swap writes.
//!
//! The cache holds the authoritative current view of balances and token
//! usage. Writers follow a watch-then-conditional-commit protocol: observe
//! a key's version, compute the new value from the observed one, and
//! commit only if no other writer touched the key in between. A conflict
//! means the whole read-compute-commit round is repeated, with backoff,
//! under [`RetryPolicy`].
//!
//! The [`SnapshotCache`] trait only requires versioned conditional writes,
//! so any KV store with a version tag, ETag, or native CAS can implement
//! it; the retry loop lives in the callers, not the store.
//!
//! Key absence is meaningful: an absent (or expired) key means "must
//! resynchronize from the durable store", never "value is zero".

use std::time::Duration;

use async_trait::async_trait;

pub mod memory;

pub use memory::MemorySnapshotCache;

/// Monotonic write tag. Unique per committed write within a cache instance,
/// so a stale observation can never match a newer entry.
pub type Version = u64;

/// A cached value together with the version observed when reading it.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<V> {
    pub value: V,
    pub version: Version,
}

/// What a writer observed about a key before computing its new value.
/// `None` means the key was absent (or expired) at observation time.
pub type Observed = Option<Version>;

/// Outcome of a conditional commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The observation still held and the new value was committed.
    Committed,
    /// Another writer touched at least one watched key; nothing was
    /// written.
    Conflict,
}

/// A replicated key/value snapshot store with TTL expiry and optimistic
/// field-level locking.
#[async_trait]
pub trait SnapshotCache<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Current live value and version. Expired entries read as absent.
    async fn read(&self, key: &str) -> Option<Versioned<V>>;

    /// Conditionally commit `value` if the key's state still matches
    /// `observed`. A successful commit refreshes the key's TTL.
    async fn compare_and_swap(
        &self,
        key: &str,
        observed: Observed,
        value: V,
        ttl: Duration,
    ) -> CasOutcome;

    /// Conditionally commit a set of writes, all-or-nothing: if any key's
    /// state no longer matches its observation, nothing is written.
    async fn compare_and_swap_many(
        &self,
        writes: Vec<(String, Observed, V)>,
        ttl: Duration,
    ) -> CasOutcome;

    /// Unconditional write, last writer wins. Only used when seeding from
    /// the source of truth, where every concurrent writer carries an
    /// equally valid value.
    async fn overwrite(&self, key: &str, value: V, ttl: Duration);

    /// Drop a key.
    async fn remove(&self, key: &str);
}

/// Bounded retry with exponential backoff for optimistic commit rounds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given failed attempt (1-based): 100ms, 200ms,
    /// 400ms, ... for the default base.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_from_the_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(1600));
    }
}
