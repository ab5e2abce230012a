//! In-memory cache backend for tests and ephemeral sessions.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use syncline_core::{CacheError, SyncResult};

use super::namespaced_key::NamespacedKey;
use super::traits::{CacheBackend, CacheStats};

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<Vec<u8>, (Vec<u8>, DateTime<Utc>)>,
    hits: u64,
    misses: u64,
}

/// Cache backend holding entries in a process-local ordered map.
///
/// Keys are ordered by their encoded bytes, so prefix deletion is a range
/// scan exactly as it is in LMDB.
#[derive(Debug, Default)]
pub struct InMemoryCacheBackend {
    inner: RwLock<Inner>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries across every namespace.
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &NamespacedKey) -> SyncResult<Option<(Vec<u8>, DateTime<Utc>)>> {
        let mut inner = self.inner.write().map_err(|_| CacheError::LockPoisoned)?;
        let found = inner.entries.get(&key.encode()).cloned();
        match found {
            Some(entry) => {
                inner.hits += 1;
                Ok(Some(entry))
            }
            None => {
                inner.misses += 1;
                Ok(None)
            }
        }
    }

    async fn put(
        &self,
        key: &NamespacedKey,
        payload: &[u8],
        written_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let mut inner = self.inner.write().map_err(|_| CacheError::LockPoisoned)?;
        inner
            .entries
            .insert(key.encode(), (payload.to_vec(), written_at));
        Ok(())
    }

    async fn delete(&self, key: &NamespacedKey) -> SyncResult<bool> {
        let mut inner = self.inner.write().map_err(|_| CacheError::LockPoisoned)?;
        Ok(inner.entries.remove(&key.encode()).is_some())
    }

    async fn delete_prefix(&self, prefix: &[u8]) -> SyncResult<u64> {
        let mut inner = self.inner.write().map_err(|_| CacheError::LockPoisoned)?;
        let doomed: Vec<Vec<u8>> = inner
            .entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            inner.entries.remove(k);
        }
        Ok(doomed.len() as u64)
    }

    async fn stats(&self) -> SyncResult<CacheStats> {
        let inner = self.inner.read().map_err(|_| CacheError::LockPoisoned)?;
        Ok(CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entry_count: inner.entries.len() as u64,
            expirations: 0,
        })
    }
}
