//! Request coalescer (singleflight): at most one concurrent upstream fetch
//! per cache key. Late arrivals await the in-flight result instead of
//! re-invoking the upstream.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as DashEntry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::trace;

/// Default grace delay before an in-flight entry is evicted after
/// completion — see `COALESCE_GRACE_MS` in `crate::config`.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(1000);

struct Inner<T> {
    in_flight: DashMap<String, Arc<OnceCell<T>>>,
    grace: Duration,
}

/// Followers never re-invoke the upstream: they always observe exactly what
/// the leader computed, success or failure, via a shared `OnceCell`.
///
/// `T` is the outcome type shared between leader and followers — callers
/// that need to distinguish success from failure should make `T` a
/// `Result`-like enum that is itself `Clone`, since a single `OnceCell` slot
/// is used for both.
pub struct Coalescer<T: Clone + Send + Sync + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Coalescer<T> {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                in_flight: DashMap::new(),
                grace,
            }),
        }
    }

    pub fn with_default_grace() -> Self {
        Self::new(DEFAULT_GRACE)
    }

    /// Runs `fetch` at most once per `key` among concurrent callers. The
    /// first caller to register the cell for `key` is the leader and drives
    /// `fetch` to completion; every other concurrent caller for the same key
    /// is a follower that awaits the leader's result through the same cell.
    ///
    /// Returns the shared value alongside whether this caller was the
    /// leader — callers that want to count coalesced (follower) waits for
    /// observability should key off the returned flag.
    pub async fn coalesce<F, Fut>(&self, key: &str, fetch: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let (cell, is_leader) = match self.inner.in_flight.entry(key.to_string()) {
            DashEntry::Occupied(entry) => (entry.get().clone(), false),
            DashEntry::Vacant(entry) => {
                let cell = Arc::new(OnceCell::new());
                entry.insert(cell.clone());
                (cell, true)
            }
        };

        if is_leader {
            trace!(key, "coalescer: leader computing");
            let value = fetch().await;
            // get_or_init never actually calls the closure a second time here
            // since this is the only writer for a fresh cell.
            let value = cell
                .get_or_init(|| async { value })
                .await
                .clone();
            self.schedule_eviction(key.to_string());
            (value, true)
        } else {
            trace!(key, "coalescer: follower waiting");
            (cell.wait().await.clone(), false)
        }
    }

    fn schedule_eviction(&self, key: String) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.grace).await;
            inner.in_flight.remove(&key);
        });
    }

    /// Number of keys with an in-flight (not yet evicted) entry. Test/
    /// observability use only.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Coalescer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::task::JoinSet;

    #[tokio::test]
    async fn concurrent_callers_for_same_key_trigger_one_fetch() {
        let coalescer: Coalescer<u32> = Coalescer::new(Duration::from_millis(50));
        let compute_calls = Arc::new(AtomicU32::new(0));

        let mut tasks = JoinSet::new();
        for _ in 0..100 {
            let coalescer = coalescer.clone();
            let compute_calls = compute_calls.clone();
            tasks.spawn(async move {
                coalescer
                    .coalesce("same-key", || {
                        let compute_calls = compute_calls.clone();
                        async move {
                            compute_calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            42u32
                        }
                    })
                    .await
            });
        }

        let mut results = Vec::new();
        let mut leader_count = 0;
        while let Some(result) = tasks.join_next().await {
            let (value, is_leader) = result.unwrap_or_else(|e| panic!("task panicked: {e}"));
            if is_leader {
                leader_count += 1;
            }
            results.push(value);
        }

        assert_eq!(results.len(), 100);
        assert!(results.iter().all(|&v| v == 42));
        assert_eq!(compute_calls.load(Ordering::SeqCst), 1);
        assert_eq!(leader_count, 1);
    }

    #[tokio::test]
    async fn distinct_keys_each_compute_independently() {
        let coalescer: Coalescer<u32> = Coalescer::new(Duration::from_millis(50));
        let (a, a_leader) = coalescer.coalesce("a", || async { 1u32 }).await;
        let (b, b_leader) = coalescer.coalesce("b", || async { 2u32 }).await;
        assert_eq!((a, b), (1, 2));
        assert!(a_leader && b_leader);
    }

    #[tokio::test]
    async fn entry_is_evicted_after_grace_period() {
        let coalescer: Coalescer<u32> = Coalescer::new(Duration::from_millis(20));
        coalescer.coalesce("k", || async { 1u32 }).await;
        assert_eq!(coalescer.in_flight_count(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(coalescer.in_flight_count(), 0);
    }
}
