//! Key-value store adapter: the persistence boundary beneath the cache
//! engine. Backing store details stay hidden behind [`KvStore`] — the
//! engine only ever speaks bytes.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Persistent map of string to bytes, with iteration and clear.
///
/// Implementors own their own locking/sharding; every method must be safe
/// to call concurrently from many tasks.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()>;

    /// Like `set`, but the entry expires (and is treated as absent) after
    /// `ttl`. A `None` ttl means the entry never expires on its own.
    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Keys currently present whose name starts with `prefix`. Used by
    /// admin/maintenance paths only, never on the hot request path.
    async fn iterate_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>>;

    async fn clear(&self) -> anyhow::Result<()>;

    async fn health_check(&self) -> anyhow::Result<bool>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Default in-process backend: a sharded concurrent map with lazy
/// expiry-on-read, plus a background sweep for entries nobody reads again.
pub struct InMemoryKvStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Drops expired entries proactively. Correctness never depends on this
    /// running; it only bounds memory growth.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self.entries.get(key) {
            Some(entry) if entry.is_expired() => {
                drop(entry);
                self.entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn iterate_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired() && entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.entries.clear();
        Ok(())
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        const PROBE_KEY: &str = "__kv_health_check__";
        self.set(PROBE_KEY, b"ok".to_vec()).await?;
        let ok = self.get(PROBE_KEY).await?.as_deref() == Some(b"ok".as_slice());
        self.delete(PROBE_KEY).await?;
        Ok(ok)
    }
}
