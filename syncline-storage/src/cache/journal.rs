//! Watermarks and the invalidation journal.
//!
//! The journal records, per canonical key, the last time a mutation settled
//! against it. A cache entry written before that point is reported as
//! invalidated: still served, but always refreshed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use syncline_core::{CacheKey, SyncResult};

/// A watermark representing a point in the invalidation journal.
///
/// Watermarks are monotonically increasing across the whole journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark {
    /// Monotonically increasing sequence number.
    pub sequence: i64,
    /// When this watermark was recorded.
    pub observed_at: DateTime<Utc>,
}

impl Watermark {
    pub fn with_timestamp(sequence: i64, observed_at: DateTime<Utc>) -> Self {
        Self {
            sequence,
            observed_at,
        }
    }

    /// Create a zero watermark (beginning of time).
    pub fn zero() -> Self {
        Self {
            sequence: 0,
            observed_at: DateTime::UNIX_EPOCH,
        }
    }

    /// Check if this watermark is newer than another.
    pub fn is_newer_than(&self, other: &Watermark) -> bool {
        self.sequence > other.sequence
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::zero()
    }
}

/// Invalidation journal for settle-time cache invalidation.
#[async_trait]
pub trait InvalidationJournal: Send + Sync {
    /// Latest watermark recorded for `key`, or zero if never invalidated.
    async fn current_watermark(&self, key: &CacheKey) -> SyncResult<Watermark>;

    /// Record an invalidation of `key` at the current time.
    async fn record_invalidation(&self, key: &CacheKey) -> SyncResult<Watermark>;

    /// True if `key` was invalidated after `written_at`, compared at the
    /// microsecond resolution entries are stored with. An entry dated in
    /// the same microsecond as the invalidation was read after it.
    async fn invalidated_since(&self, key: &CacheKey, written_at: DateTime<Utc>)
        -> SyncResult<bool>;

    /// Drop records older than `before`. Entries written before them have
    /// already outlived the TTL.
    async fn prune(&self, before: DateTime<Utc>) -> SyncResult<u64>;
}

/// In-memory invalidation journal scoped to one application session.
#[derive(Debug, Default)]
pub struct InMemoryInvalidationJournal {
    sequence: AtomicI64,
    latest: tokio::sync::RwLock<HashMap<CacheKey, Watermark>>,
}

impl InMemoryInvalidationJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvalidationJournal for InMemoryInvalidationJournal {
    async fn current_watermark(&self, key: &CacheKey) -> SyncResult<Watermark> {
        let latest = self.latest.read().await;
        Ok(latest.get(key).copied().unwrap_or_default())
    }

    async fn record_invalidation(&self, key: &CacheKey) -> SyncResult<Watermark> {
        let mut latest = self.latest.write().await;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let watermark = Watermark::with_timestamp(sequence, Utc::now());
        latest.insert(key.clone(), watermark);
        Ok(watermark)
    }

    async fn invalidated_since(
        &self,
        key: &CacheKey,
        written_at: DateTime<Utc>,
    ) -> SyncResult<bool> {
        let latest = self.latest.read().await;
        Ok(latest
            .get(key)
            .map(|w| w.observed_at.timestamp_micros() > written_at.timestamp_micros())
            .unwrap_or(false))
    }

    async fn prune(&self, before: DateTime<Utc>) -> SyncResult<u64> {
        let mut latest = self.latest.write().await;
        let before_len = latest.len();
        latest.retain(|_, w| w.observed_at >= before);
        Ok((before_len - latest.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_key_has_zero_watermark() {
        let journal = InMemoryInvalidationJournal::new();
        let key = CacheKey::custom("orders");
        assert_eq!(
            journal.current_watermark(&key).await.expect("watermark"),
            Watermark::zero()
        );
        assert!(!journal
            .invalidated_since(&key, Utc::now())
            .await
            .expect("lookup"));
    }

    #[tokio::test]
    async fn test_watermarks_increase_across_keys() {
        let journal = InMemoryInvalidationJournal::new();
        let a = journal
            .record_invalidation(&CacheKey::custom("a"))
            .await
            .expect("record");
        let b = journal
            .record_invalidation(&CacheKey::custom("b"))
            .await
            .expect("record");
        assert!(b.is_newer_than(&a));
    }

    #[tokio::test]
    async fn test_invalidated_since_compares_write_time() {
        let journal = InMemoryInvalidationJournal::new();
        let key = CacheKey::custom("orders");
        let written_before = Utc::now() - chrono::Duration::seconds(5);

        journal.record_invalidation(&key).await.expect("record");
        let written_after = Utc::now() + chrono::Duration::seconds(5);

        assert!(journal
            .invalidated_since(&key, written_before)
            .await
            .expect("lookup"));
        assert!(!journal
            .invalidated_since(&key, written_after)
            .await
            .expect("lookup"));
    }

    #[tokio::test]
    async fn test_entry_dated_at_invalidation_is_current() {
        let journal = InMemoryInvalidationJournal::new();
        let key = CacheKey::custom("orders");
        let watermark = journal.record_invalidation(&key).await.expect("record");

        assert!(!journal
            .invalidated_since(&key, watermark.observed_at)
            .await
            .expect("lookup"));
        assert!(journal
            .invalidated_since(&key, watermark.observed_at - chrono::Duration::microseconds(1))
            .await
            .expect("lookup"));
    }

    #[tokio::test]
    async fn test_prune_drops_old_records() {
        let journal = InMemoryInvalidationJournal::new();
        journal
            .record_invalidation(&CacheKey::custom("orders"))
            .await
            .expect("record");

        let pruned = journal
            .prune(Utc::now() - chrono::Duration::minutes(5))
            .await
            .expect("prune");
        assert_eq!(pruned, 0);

        let pruned = journal
            .prune(Utc::now() + chrono::Duration::seconds(1))
            .await
            .expect("prune");
        assert_eq!(pruned, 1);
    }
}
