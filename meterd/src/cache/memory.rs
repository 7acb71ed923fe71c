//! In-memory snapshot cache.
//!
//! Entries live in a `parking_lot`-guarded map. Versions come from one
//! atomic counter shared by all keys, so a version can never repeat: an
//! observation taken before a key expired and was reseeded can never match
//! the reseeded entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CasOutcome, Observed, SnapshotCache, Version, Versioned};

struct Entry<V> {
    value: V,
    version: Version,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory implementation of [`SnapshotCache`].
pub struct MemorySnapshotCache<V> {
    entries: Arc<RwLock<HashMap<String, Entry<V>>>>,
    versions: AtomicU64,
}

impl<V> MemorySnapshotCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            versions: AtomicU64::new(1),
        }
    }

    fn next_version(&self) -> Version {
        self.versions.fetch_add(1, Ordering::Relaxed)
    }
}

impl<V> Default for MemorySnapshotCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> SnapshotCache<V> for MemorySnapshotCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn read(&self, key: &str) -> Option<Versioned<V>> {
        let now = Instant::now();
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| Versioned {
                value: entry.value.clone(),
                version: entry.version,
            })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        observed: Observed,
        value: V,
        ttl: Duration,
    ) -> CasOutcome {
        let now = Instant::now();
        let mut entries = self.entries.write();

        let current = entries.get(key).filter(|entry| entry.live(now));
        let matches = match (current, observed) {
            (Some(entry), Some(version)) => entry.version == version,
            (None, None) => true,
            _ => false,
        };
        if !matches {
            return CasOutcome::Conflict;
        }

        entries.insert(
            key.to_string(),
            Entry {
                value,
                version: self.next_version(),
                expires_at: now + ttl,
            },
        );
        CasOutcome::Committed
    }

    async fn compare_and_swap_many(
        &self,
        writes: Vec<(String, Observed, V)>,
        ttl: Duration,
    ) -> CasOutcome {
        let now = Instant::now();
        let mut entries = self.entries.write();

        // Verify every observation before writing anything.
        for (key, observed, _) in &writes {
            let current = entries.get(key).filter(|entry| entry.live(now));
            let matches = match (current, observed) {
                (Some(entry), Some(version)) => entry.version == *version,
                (None, None) => true,
                _ => false,
            };
            if !matches {
                return CasOutcome::Conflict;
            }
        }

        for (key, _, value) in writes {
            entries.insert(
                key,
                Entry {
                    value,
                    version: self.next_version(),
                    expires_at: now + ttl,
                },
            );
        }
        CasOutcome::Committed
    }

    async fn overwrite(&self, key: &str, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.insert(
            key.to_string(),
            Entry {
                value,
                version: self.next_version(),
                expires_at: now + ttl,
            },
        );
    }

    async fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }
}
