//! The persistent cache store.
//!
//! Wraps a [`CacheBackend`] with serialization, a fixed entry TTL, a
//! namespace, and the invalidation journal used for settle-time
//! invalidation.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use syncline_core::{CacheError, CacheKey, SyncResult};
use tracing::{debug, warn};

use super::freshness::CacheRead;
use super::journal::{InvalidationJournal, Watermark};
use super::namespaced_key::{NamespacedKey, DEFAULT_NAMESPACE};
use super::traits::{CacheBackend, CacheStats};

/// Entries older than this are treated as absent and evicted on read.
pub const TTL_FIXED: Duration = Duration::from_secs(5 * 60);

/// Configuration for the cache store.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prefix applied to every key this store writes.
    pub namespace: String,
    /// Maximum entry age before reads report the entry as absent.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl: TTL_FIXED,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the namespace prefix.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Durable key/value store for query results.
///
/// Cloning is cheap; clones share the backend, the journal and the
/// expiration counter.
///
/// # Example
///
/// ```ignore
/// let store = CacheStore::new(backend, journal, CacheConfig::default());
///
/// let orders: Vec<Order> = store
///     .get_or_fetch(&key, || remote.fetch_orders(), false)
///     .await?;
/// ```
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    journal: Arc<dyn InvalidationJournal>,
    config: CacheConfig,
    expirations: Arc<AtomicU64>,
}

impl CacheStore {
    /// Create a new cache store.
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        journal: Arc<dyn InvalidationJournal>,
        config: CacheConfig,
    ) -> Self {
        Self {
            backend,
            journal,
            config,
            expirations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a cache store with default configuration.
    pub fn with_defaults(
        backend: Arc<dyn CacheBackend>,
        journal: Arc<dyn InvalidationJournal>,
    ) -> Self {
        Self::new(backend, journal, CacheConfig::default())
    }

    /// Get the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn namespaced(&self, key: &CacheKey) -> NamespacedKey {
        NamespacedKey::new(self.config.namespace.clone(), key.clone())
    }

    /// Store `value` under `key`, stamped with the current time.
    pub async fn set<T>(&self, key: &CacheKey, value: &T) -> SyncResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.set_written_at(key, value, Utc::now()).await
    }

    /// Store `value` under `key` with an explicit write time.
    ///
    /// Fetches pass the time their remote read began, so the entry is never
    /// newer than the data it holds.
    pub async fn set_written_at<T>(
        &self,
        key: &CacheKey,
        value: &T,
        written_at: DateTime<Utc>,
    ) -> SyncResult<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(value).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        self.backend
            .put(&self.namespaced(key), &payload, written_at)
            .await?;
        debug!(key = %key, bytes = payload.len(), "cache entry written");
        Ok(())
    }

    /// Read `key` with staleness metadata.
    ///
    /// Expired and undecodable entries are evicted and reported as absent.
    pub async fn read<T>(&self, key: &CacheKey) -> SyncResult<Option<CacheRead<T>>>
    where
        T: DeserializeOwned,
    {
        let namespaced = self.namespaced(key);
        let Some((payload, written_at)) = self.backend.get(&namespaced).await? else {
            return Ok(None);
        };

        let age = Utc::now()
            .signed_duration_since(written_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age > self.config.ttl {
            self.backend.delete(&namespaced).await?;
            self.expirations.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, age_ms = age.as_millis() as u64, "cache entry expired");
            return Ok(None);
        }

        let value = match serde_json::from_slice::<T>(&payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "evicting undecodable cache entry");
                self.backend.delete(&namespaced).await?;
                return Ok(None);
            }
        };

        let invalidated = self.journal.invalidated_since(key, written_at).await?;
        Ok(Some(CacheRead::new(value, written_at, invalidated)))
    }

    /// Read `key`, returning only the payload.
    pub async fn get<T>(&self, key: &CacheKey) -> SyncResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        Ok(self.read(key).await?.map(CacheRead::into_value))
    }

    /// Remove a single entry. Returns true if an entry existed.
    pub async fn remove(&self, key: &CacheKey) -> SyncResult<bool> {
        self.backend.delete(&self.namespaced(key)).await
    }

    /// Remove every entry under this store's namespace.
    pub async fn clear(&self) -> SyncResult<u64> {
        let prefix = NamespacedKey::namespace_prefix(&self.config.namespace);
        let removed = self.backend.delete_prefix(&prefix).await?;
        debug!(namespace = %self.config.namespace, removed, "cache cleared");
        Ok(removed)
    }

    /// Return the cached value for `key`, or fetch, store and return it.
    ///
    /// With `force_refresh` the cache is bypassed on read but still written
    /// on success. Fetch errors propagate unchanged and leave any existing
    /// entry untouched.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        key: &CacheKey,
        fetch: F,
        force_refresh: bool,
    ) -> SyncResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        if !force_refresh {
            if let Some(cached) = self.get::<T>(key).await? {
                return Ok(cached);
            }
        }

        let fresh = fetch().await?;
        self.set(key, &fresh).await?;
        Ok(fresh)
    }

    /// Mark the entry under `key` stale.
    ///
    /// The entry stays readable, but every read reports it as invalidated
    /// until it is rewritten.
    pub async fn invalidate(&self, key: &CacheKey) -> SyncResult<Watermark> {
        let watermark = self.journal.record_invalidation(key).await?;
        debug!(key = %key, sequence = watermark.sequence, "cache entry invalidated");
        Ok(watermark)
    }

    /// Drop journal records that can no longer affect a live entry.
    pub async fn prune_journal(&self) -> SyncResult<u64> {
        let horizon = chrono::Duration::from_std(self.config.ttl)
            .map(|ttl| Utc::now() - ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.journal.prune(horizon).await
    }

    /// Backend statistics merged with the store's expiration count.
    pub async fn stats(&self) -> SyncResult<CacheStats> {
        let mut stats = self.backend.stats().await?;
        stats.expirations += self.expirations.load(Ordering::Relaxed);
        Ok(stats)
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("config", &self.config)
            .field("expirations", &self.expirations.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::journal::InMemoryInvalidationJournal;
    use crate::cache::memory_backend::InMemoryCacheBackend;
    use syncline_core::{FetchError, SyncError};

    fn store() -> (CacheStore, Arc<InMemoryCacheBackend>) {
        let backend = Arc::new(InMemoryCacheBackend::new());
        let store = CacheStore::with_defaults(
            backend.clone(),
            Arc::new(InMemoryInvalidationJournal::new()),
        );
        (store, backend)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (store, _) = store();
        let key = CacheKey::custom("orders");
        store.set(&key, &vec![1, 2, 3]).await.expect("set");
        let value: Option<Vec<i32>> = store.get(&key).await.expect("get");
        assert_eq!(value, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_expired_entry_is_evicted() {
        let (store, backend) = store();
        let key = CacheKey::custom("orders");
        store
            .set_written_at(&key, &vec![1], Utc::now() - chrono::Duration::minutes(6))
            .await
            .expect("set");

        let value: Option<Vec<i32>> = store.get(&key).await.expect("get");
        assert_eq!(value, None);
        assert!(backend.is_empty());
        assert_eq!(store.stats().await.expect("stats").expirations, 1);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_evicted() {
        let (store, backend) = store();
        let key = CacheKey::custom("orders");
        store.set(&key, "not a list").await.expect("set");

        let value: Option<Vec<i32>> = store.get(&key).await.expect("get");
        assert_eq!(value, None);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_get_or_fetch_uses_cache_unless_forced() {
        let (store, _) = store();
        let key = CacheKey::custom("orders");
        store.set(&key, &vec![1]).await.expect("set");

        let cached: Vec<i32> = store
            .get_or_fetch(&key, || async { Ok(vec![2]) }, false)
            .await
            .expect("cached");
        assert_eq!(cached, vec![1]);

        let forced: Vec<i32> = store
            .get_or_fetch(&key, || async { Ok(vec![2]) }, true)
            .await
            .expect("forced");
        assert_eq!(forced, vec![2]);
        assert_eq!(store.get::<Vec<i32>>(&key).await.expect("get"), Some(vec![2]));
    }

    #[tokio::test]
    async fn test_get_or_fetch_error_leaves_entry() {
        let (store, _) = store();
        let key = CacheKey::custom("orders");
        store.set(&key, &vec![1]).await.expect("set");

        let err = store
            .get_or_fetch::<Vec<i32>, _, _>(
                &key,
                || async {
                    Err(FetchError::Transport {
                        reason: "offline".into(),
                    }
                    .into())
                },
                true,
            )
            .await
            .expect_err("fetch should fail");
        assert!(matches!(err, SyncError::Fetch(_)));
        assert_eq!(store.get::<Vec<i32>>(&key).await.expect("get"), Some(vec![1]));
    }

    #[tokio::test]
    async fn test_invalidate_flags_existing_entry() {
        let (store, _) = store();
        let key = CacheKey::custom("orders");
        store.set(&key, &vec![1]).await.expect("set");
        store.invalidate(&key).await.expect("invalidate");

        let read = store
            .read::<Vec<i32>>(&key)
            .await
            .expect("read")
            .expect("entry present");
        assert!(read.is_invalidated());
        assert!(read.is_stale(Duration::from_secs(3600)));

        store.set(&key, &vec![2]).await.expect("rewrite");
        let read = store
            .read::<Vec<i32>>(&key)
            .await
            .expect("read")
            .expect("entry present");
        assert!(!read.is_invalidated());
    }
}
