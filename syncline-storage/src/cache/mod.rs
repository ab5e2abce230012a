//! Cache layer with explicit expiry and staleness metadata.
//!
//! # Design Philosophy
//!
//! Entries are never silently stale. Every read reports when its payload was
//! written and whether a mutation has invalidated it since, via
//! [`CacheRead<T>`]. Entries older than [`TTL_FIXED`] are evicted on read and
//! reported as absent.
//!
//! # Example
//!
//! ```ignore
//! let store = CacheStore::new(backend, journal, CacheConfig::default());
//!
//! store.set(&key, &orders).await?;
//! let orders: Option<Vec<Order>> = store.get(&key).await?;
//!
//! // Inspect staleness before deciding to refresh
//! if let Some(read) = store.read::<Vec<Order>>(&key).await? {
//!     if read.is_invalidated() || read.age() > stale_time {
//!         // refresh in background
//!     }
//! }
//! ```

pub mod freshness;
pub mod journal;
pub mod lmdb_backend;
pub mod memory_backend;
pub mod namespaced_key;
pub mod store;
pub mod traits;

pub use freshness::CacheRead;
pub use journal::{InMemoryInvalidationJournal, InvalidationJournal, Watermark};
pub use lmdb_backend::{LmdbCacheBackend, LmdbCacheError};
pub use memory_backend::InMemoryCacheBackend;
pub use namespaced_key::{NamespacedKey, DEFAULT_NAMESPACE, NAMESPACE_TERMINATOR};
pub use store::{CacheConfig, CacheStore, TTL_FIXED};
pub use traits::{CacheBackend, CacheStats};
