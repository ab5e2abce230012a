//! Cache backend trait and statistics.
//!
//! Backends store opaque payload bytes together with the instant they were
//! written. Serialization and expiry live one level up, in
//! [`CacheStore`](super::CacheStore).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use syncline_core::SyncResult;

use super::namespaced_key::NamespacedKey;

/// Cache backend trait for pluggable storage media.
///
/// Implementations should be thread-safe. Writes to a key replace the
/// previous entry wholesale.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get the raw payload and its write time, or None if not found.
    async fn get(&self, key: &NamespacedKey) -> SyncResult<Option<(Vec<u8>, DateTime<Utc>)>>;

    /// Store a raw payload with its write time.
    async fn put(
        &self,
        key: &NamespacedKey,
        payload: &[u8],
        written_at: DateTime<Utc>,
    ) -> SyncResult<()>;

    /// Delete a single entry. Returns true if an entry was removed.
    async fn delete(&self, key: &NamespacedKey) -> SyncResult<bool>;

    /// Delete every entry whose encoded key starts with `prefix`.
    async fn delete_prefix(&self, prefix: &[u8]) -> SyncResult<u64>;

    /// Get cache statistics.
    async fn stats(&self) -> SyncResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of entries evicted because they outlived the TTL.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
