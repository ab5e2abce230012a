//! Staleness metadata for cache reads.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Result of a cache read, carrying staleness metadata.
///
/// The write time is the entry's true write time as recorded by the
/// backend, so callers can make stale-while-revalidate decisions against
/// the real age of the payload.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    /// The cached value.
    value: T,
    /// When this value was written to the cache.
    written_at: DateTime<Utc>,
    /// Whether an invalidation was recorded after `written_at`.
    invalidated: bool,
}

impl<T> CacheRead<T> {
    pub fn new(value: T, written_at: DateTime<Utc>, invalidated: bool) -> Self {
        Self {
            value,
            written_at,
            invalidated,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    /// Get a reference to the underlying value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Get when this value was written.
    pub fn written_at(&self) -> DateTime<Utc> {
        self.written_at
    }

    /// Whether a mutation invalidated this entry after it was written.
    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Age of the entry relative to `now`.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.written_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Age of the entry relative to the current time.
    pub fn age(&self) -> Duration {
        self.age_at(Utc::now())
    }

    /// An entry is stale once it is older than `stale_time` or has been invalidated.
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        self.invalidated || self.age() > stale_time
    }

    /// Check if the data was written at or after the given timestamp.
    pub fn is_fresh_as_of(&self, timestamp: DateTime<Utc>) -> bool {
        self.written_at >= timestamp
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            written_at: self.written_at,
            invalidated: self.invalidated,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
