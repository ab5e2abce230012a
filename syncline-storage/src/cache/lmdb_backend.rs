//! LMDB-backed cache implementation.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a durable,
//! memory-mapped key-value store for cached query results that survives
//! application restarts.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The backend uses:
//! - Read transactions for `get` operations
//! - Write transactions for `put`, `delete`, and `delete_prefix`
//! - Statistics are tracked behind a lock

use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use syncline_core::{CacheError, SyncError, SyncResult};

use super::namespaced_key::NamespacedKey;
use super::traits::{CacheBackend, CacheStats};

/// Length of the write-time header preceding every stored payload.
const HEADER_LEN: usize = 8;

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Stored bytes are not a valid entry.
    #[error("Corrupt entry: {0}")]
    Corrupt(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for SyncError {
    fn from(e: LmdbCacheError) -> Self {
        SyncError::Cache(CacheError::Backend {
            reason: e.to_string(),
        })
    }
}

/// LMDB-backed cache.
///
/// # Value Layout
///
/// `[written_at: i64 microseconds, little endian][payload bytes]`
///
/// # Example
///
/// ```ignore
/// let backend = LmdbCacheBackend::new("/tmp/syncline-cache", 64)?;
/// let store = CacheStore::new(Arc::new(backend), journal, CacheConfig::default());
/// ```
pub struct LmdbCacheBackend {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    /// Usage statistics.
    stats: Arc<RwLock<CacheStats>>,
}

impl LmdbCacheBackend {
    /// Create a new LMDB cache backend.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let entry_count = {
            let rtxn = env
                .read_txn()
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
            db.len(&rtxn)
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?
        };

        Ok(Self {
            env,
            db,
            stats: Arc::new(RwLock::new(CacheStats {
                entry_count,
                ..CacheStats::default()
            })),
        })
    }

    fn record(&self, f: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }
}

fn decode_entry(bytes: &[u8]) -> Result<(Vec<u8>, DateTime<Utc>), LmdbCacheError> {
    if bytes.len() < HEADER_LEN {
        return Err(LmdbCacheError::Corrupt("entry shorter than header".into()));
    }
    let header: [u8; HEADER_LEN] = bytes[0..HEADER_LEN]
        .try_into()
        .map_err(|_| LmdbCacheError::Corrupt("invalid timestamp".into()))?;
    let micros = i64::from_le_bytes(header);
    let written_at = DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| LmdbCacheError::Corrupt(format!("timestamp out of range: {micros}")))?;
    Ok((bytes[HEADER_LEN..].to_vec(), written_at))
}

#[async_trait]
impl CacheBackend for LmdbCacheBackend {
    async fn get(&self, key: &NamespacedKey) -> SyncResult<Option<(Vec<u8>, DateTime<Utc>)>> {
        let encoded_key = key.encode();

        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        match self.db.get(&rtxn, encoded_key.as_slice()) {
            Ok(Some(bytes)) => {
                self.record(|s| s.hits += 1);
                Ok(Some(decode_entry(bytes)?))
            }
            Ok(None) => {
                self.record(|s| s.misses += 1);
                Ok(None)
            }
            Err(e) => {
                self.record(|s| s.misses += 1);
                Err(LmdbCacheError::Transaction(e.to_string()).into())
            }
        }
    }

    async fn put(
        &self,
        key: &NamespacedKey,
        payload: &[u8],
        written_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let encoded_key = key.encode();

        let mut full_bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        full_bytes.extend_from_slice(&written_at.timestamp_micros().to_le_bytes());
        full_bytes.extend_from_slice(payload);

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let is_new = self
            .db
            .get(&wtxn, encoded_key.as_slice())
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?
            .is_none();

        self.db
            .put(&mut wtxn, encoded_key.as_slice(), full_bytes.as_slice())
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        if is_new {
            self.record(|s| s.entry_count += 1);
        }

        Ok(())
    }

    async fn delete(&self, key: &NamespacedKey) -> SyncResult<bool> {
        let encoded_key = key.encode();

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let deleted = self
            .db
            .delete(&mut wtxn, encoded_key.as_slice())
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        if deleted {
            self.record(|s| s.entry_count = s.entry_count.saturating_sub(1));
        }

        Ok(deleted)
    }

    async fn delete_prefix(&self, prefix: &[u8]) -> SyncResult<u64> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let keys = self
            .db
            .prefix_iter(&wtxn, prefix)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?
            .map(|entry| {
                entry
                    .map(|(key, _)| key.to_vec())
                    .map_err(|e| LmdbCacheError::Transaction(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut deleted = 0u64;
        for key in &keys {
            if self
                .db
                .delete(&mut wtxn, key.as_slice())
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?
            {
                deleted += 1;
            }
        }

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        self.record(|s| s.entry_count = s.entry_count.saturating_sub(deleted));

        Ok(deleted)
    }

    async fn stats(&self) -> SyncResult<CacheStats> {
        Ok(self.stats.read().map(|s| s.clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncline_core::CacheKey;
    use tempfile::TempDir;

    fn create_test_backend() -> (LmdbCacheBackend, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let backend =
            LmdbCacheBackend::new(temp_dir.path(), 10).expect("backend creation should succeed");
        (backend, temp_dir)
    }

    fn key(ns: &str, k: &str) -> NamespacedKey {
        NamespacedKey::new(ns, CacheKey::custom(k))
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (backend, _temp_dir) = create_test_backend();
        let written_at = Utc::now();

        backend
            .put(&key("ns:", "orders"), br#"[{"id":42}]"#, written_at)
            .await
            .expect("put should succeed");

        let (payload, retrieved_at) = backend
            .get(&key("ns:", "orders"))
            .await
            .expect("get should succeed")
            .expect("entry should exist");
        assert_eq!(payload, br#"[{"id":42}]"#.to_vec());
        assert_eq!(
            written_at.timestamp_micros(),
            retrieved_at.timestamp_micros()
        );
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (backend, _temp_dir) = create_test_backend();
        let cached = backend
            .get(&key("ns:", "missing"))
            .await
            .expect("get should succeed");
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let (backend, _temp_dir) = create_test_backend();
        backend
            .put(&key("ns:", "orders"), b"[]", Utc::now())
            .await
            .expect("put should succeed");

        assert!(backend
            .delete(&key("ns:", "orders"))
            .await
            .expect("delete should succeed"));
        assert!(!backend
            .delete(&key("ns:", "orders"))
            .await
            .expect("second delete should succeed"));
        assert!(backend
            .get(&key("ns:", "orders"))
            .await
            .expect("get should succeed")
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_prefix_only_touches_namespace() {
        let (backend, _temp_dir) = create_test_backend();
        for k in ["a", "b", "c"] {
            backend
                .put(&key("mine:", k), b"[]", Utc::now())
                .await
                .expect("put should succeed");
        }
        backend
            .put(&key("other:", "a"), b"[]", Utc::now())
            .await
            .expect("put should succeed");

        let deleted = backend
            .delete_prefix(&NamespacedKey::namespace_prefix("mine:"))
            .await
            .expect("delete_prefix should succeed");
        assert_eq!(deleted, 3);
        assert!(backend
            .get(&key("other:", "a"))
            .await
            .expect("get should succeed")
            .is_some());
        assert_eq!(backend.stats().await.expect("stats").entry_count, 1);
    }

    #[tokio::test]
    async fn test_delete_prefix_skips_namespace_extensions() {
        let (backend, _temp_dir) = create_test_backend();
        backend
            .put(&key("a:", "orders"), b"[]", Utc::now())
            .await
            .expect("put should succeed");
        backend
            .put(&key("a:b", "orders"), b"[]", Utc::now())
            .await
            .expect("put should succeed");

        let deleted = backend
            .delete_prefix(&NamespacedKey::namespace_prefix("a:"))
            .await
            .expect("delete_prefix should succeed");
        assert_eq!(deleted, 1);
        assert!(backend
            .get(&key("a:b", "orders"))
            .await
            .expect("get should succeed")
            .is_some());
        assert!(backend
            .get(&key("a:", "orders"))
            .await
            .expect("get should succeed")
            .is_none());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_single_entry() {
        let (backend, _temp_dir) = create_test_backend();
        backend
            .put(&key("ns:", "orders"), b"[1]", Utc::now())
            .await
            .expect("put should succeed");
        backend
            .put(&key("ns:", "orders"), b"[2]", Utc::now())
            .await
            .expect("put should succeed");

        let (payload, _) = backend
            .get(&key("ns:", "orders"))
            .await
            .expect("get should succeed")
            .expect("entry should exist");
        assert_eq!(payload, b"[2]".to_vec());
        assert_eq!(backend.stats().await.expect("stats").entry_count, 1);
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        {
            let backend = LmdbCacheBackend::new(temp_dir.path(), 10).expect("open");
            backend
                .put(&key("ns:", "orders"), b"[]", Utc::now())
                .await
                .expect("put should succeed");
        }
        let reopened = LmdbCacheBackend::new(temp_dir.path(), 10).expect("reopen");
        assert_eq!(reopened.stats().await.expect("stats").entry_count, 1);
        assert!(reopened
            .get(&key("ns:", "orders"))
            .await
            .expect("get should succeed")
            .is_some());
    }

    #[tokio::test]
    async fn test_stats() {
        let (backend, _temp_dir) = create_test_backend();
        let _ = backend.get(&key("ns:", "orders")).await;
        backend
            .put(&key("ns:", "orders"), b"[]", Utc::now())
            .await
            .expect("put should succeed");
        let _ = backend.get(&key("ns:", "orders")).await;
        let _ = backend.get(&key("ns:", "orders")).await;

        let stats = backend.stats().await.expect("stats should succeed");
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entry_count, 1);
    }

    #[test]
    fn test_decode_rejects_short_entries() {
        assert!(decode_entry(&[1, 2, 3]).is_err());
    }
}
