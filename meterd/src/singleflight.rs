//! Keyed single-flight de-duplication.
//!
//! Collapses concurrent work for the same key into one in-flight future:
//! the first caller's work runs, every concurrent caller for that key
//! awaits the same shared outcome, and the entry is removed once the work
//! completes (success or failure) so later calls start fresh.
//!
//! Used to de-duplicate cache initialization reads against the durable
//! store: N concurrent cache misses for one credential must produce one
//! store query, not N.

use std::future::Future;
use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

/// Map of in-flight work, keyed by `K`, yielding cloneable `V`.
pub struct SingleFlight<K, V>
where
    K: Eq + Hash,
{
    inflight: DashMap<K, Shared<BoxFuture<'static, V>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Run `work` for `key`, unless work for the same key is already in
    /// flight, in which case await that instead. `work` is only polled if
    /// this call starts the flight.
    pub async fn run<Fut>(&self, key: K, work: Fut) -> V
    where
        Fut: Future<Output = V> + Send + 'static,
    {
        let shared = match self.inflight.entry(key.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let shared = work.boxed().shared();
                slot.insert(shared.clone());
                shared
            }
        };

        let value = shared.clone().await;

        // Only the flight we actually awaited may be cleared. A plain
        // remove could tear down a newer flight started after this one
        // completed.
        self.inflight
            .remove_if(&key, |_, current| current.ptr_eq(&shared));

        value
    }

    /// Number of keys with work currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
