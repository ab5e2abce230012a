//! Syncline Storage - Persistent Cache Store
//!
//! Durable key/value storage for query results with per-entry write
//! timestamps, a fixed expiry, and an invalidation journal used to mark
//! entries stale after mutations settle.

pub mod cache;

pub use cache::{
    CacheBackend, CacheConfig, CacheRead, CacheStats, CacheStore, InMemoryCacheBackend,
    InMemoryInvalidationJournal, InvalidationJournal, LmdbCacheBackend, LmdbCacheError,
    NamespacedKey, Watermark, DEFAULT_NAMESPACE, NAMESPACE_TERMINATOR, TTL_FIXED,
};
