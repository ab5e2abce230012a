//! Query executor.
//!
//! Serves cached results synchronously and refreshes them in the background
//! once they outlive the caller's stale time. Every canonical key maps to one
//! shared [`QuerySlot`] per client, regardless of how many handles observe
//! it.
//!
//! # Fencing
//!
//! Each fetch takes a new generation number for its slot. A completion is
//! published and cached only while its generation is still the latest, so a
//! slow fetch can never overwrite a newer one. Optimistic patches and
//! rollbacks also take a generation, which discards any fetch that was
//! already in flight when they were applied.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use syncline_core::{CacheKey, Entity, QueryDescriptor, SyncError, SyncResult};
use syncline_storage::CacheStore;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::mutation::MutationLocks;
use crate::remote::RemoteQuery;

/// Default age after which a cache hit triggers a background refresh.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(5 * 60);

/// Observable state of one query slot.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    pub data: Option<Vec<T>>,
    pub loading: bool,
    pub error: Option<SyncError>,
    pub is_stale: bool,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
            is_stale: false,
        }
    }
}

/// Per-call query options.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Disabled queries never touch the cache or the remote.
    pub enabled: bool,
    /// Overrides the descriptor's canonical key.
    pub cache_key: Option<CacheKey>,
    /// Falls back to the client's default when unset.
    pub stale_time: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_key: None,
            stale_time: None,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn cache_key(mut self, key: CacheKey) -> Self {
        self.cache_key = Some(key);
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }
}

/// Shared in-memory state for one canonical key.
pub(crate) struct QuerySlot<T> {
    key: CacheKey,
    state: watch::Sender<QueryState<T>>,
    generation: AtomicU64,
    in_flight: AtomicUsize,
    descriptor: Mutex<Option<QueryDescriptor>>,
}

impl<T: Entity> QuerySlot<T> {
    fn new(key: CacheKey) -> Self {
        let (state, _) = watch::channel(QueryState::default());
        Self {
            key,
            state,
            generation: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            descriptor: Mutex::new(None),
        }
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    fn set_descriptor(&self, descriptor: &QueryDescriptor) {
        let mut current = self.descriptor.lock().unwrap_or_else(|e| e.into_inner());
        *current = Some(descriptor.clone());
    }

    fn descriptor(&self) -> Option<QueryDescriptor> {
        self.descriptor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn still_loading(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn state(&self) -> QueryState<T> {
        self.state.borrow().clone()
    }

    pub(crate) fn data(&self) -> Option<Vec<T>> {
        self.state.borrow().data.clone()
    }

    fn begin_fetch(&self) -> u64 {
        let generation = self.next_generation();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.state.send_modify(|s| s.loading = true);
        generation
    }

    /// Publish a fetch result. Returns false if the completion was fenced off.
    fn finish_fetch(&self, generation: u64, result: &SyncResult<Vec<T>>) -> bool {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let mut applied = false;
        self.state.send_modify(|s| {
            s.loading = self.still_loading();
            if !self.is_current(generation) {
                return;
            }
            applied = true;
            match result {
                Ok(rows) => {
                    s.data = Some(rows.clone());
                    s.error = None;
                    s.is_stale = false;
                }
                Err(e) => s.error = Some(e.clone()),
            }
        });
        applied
    }

    /// Publish a cache hit. Data already held in memory is at least as new
    /// as the cache entry and is kept.
    fn publish_cached(&self, rows: Vec<T>, is_stale: bool) {
        self.state.send_modify(|s| {
            if s.data.is_none() {
                s.data = Some(rows);
            }
            s.loading = self.still_loading();
            s.error = None;
            s.is_stale = is_stale;
        });
    }

    /// Replace the data, fencing off in-flight fetches.
    pub(crate) fn replace_data(&self, data: Vec<T>) {
        self.state.send_modify(|s| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            s.data = Some(data);
        });
    }

    /// Apply `patch` to the current data and return the pre-patch snapshot.
    /// Slots without data are left alone.
    pub(crate) fn apply_patch(&self, patch: impl FnOnce(&[T]) -> Vec<T>) -> Option<Vec<T>> {
        let mut snapshot = None;
        self.state.send_if_modified(|s| {
            let Some(rows) = s.data.as_deref() else {
                return false;
            };
            let next = patch(rows);
            self.generation.fetch_add(1, Ordering::SeqCst);
            snapshot = s.data.replace(next);
            true
        });
        snapshot
    }
}

/// Type-erased view of a slot, used where the entity type is unknown.
trait ErasedSlot: Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn fence(&self);
    fn mark_stale(&self);
    fn has_subscribers(&self) -> bool;
    fn spawn_refetch(self: Arc<Self>, client: QueryClient);
}

impl<T: Entity> ErasedSlot for QuerySlot<T> {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn fence(&self) {
        self.next_generation();
    }

    fn mark_stale(&self) {
        self.state.send_if_modified(|s| {
            let changed = s.data.is_some() && !s.is_stale;
            if changed {
                s.is_stale = true;
            }
            changed
        });
    }

    fn has_subscribers(&self) -> bool {
        self.state.receiver_count() > 0
    }

    fn spawn_refetch(self: Arc<Self>, client: QueryClient) {
        let Some(descriptor) = self.descriptor() else {
            return;
        };
        tokio::spawn(async move {
            let _ = client.execute_fetch(&self, &descriptor).await;
        });
    }
}

struct ClientInner {
    cache: CacheStore,
    remote: Arc<dyn RemoteQuery>,
    slots: DashMap<CacheKey, Arc<dyn ErasedSlot>>,
    locks: MutationLocks,
    stale_time: Duration,
}

/// Session-scoped query client.
///
/// Cloning is cheap; clones share the cache store, the remote accessor and
/// every query slot.
///
/// # Example
///
/// ```ignore
/// let client = QueryClient::new(cache, remote);
/// let orders = client
///     .use_query::<Order>(
///         QueryDescriptor::new("orders").filter("sale_id", user_id),
///         QueryOptions::default(),
///     )
///     .await?;
///
/// if let Some(rows) = orders.state().data {
///     render(&rows);
/// }
/// ```
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    pub fn new(cache: CacheStore, remote: Arc<dyn RemoteQuery>) -> Self {
        Self::with_stale_time(cache, remote, DEFAULT_STALE_TIME)
    }

    /// Create a client whose queries default to `stale_time`.
    pub fn with_stale_time(
        cache: CacheStore,
        remote: Arc<dyn RemoteQuery>,
        stale_time: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                cache,
                remote,
                slots: DashMap::new(),
                locks: MutationLocks::default(),
                stale_time,
            }),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn default_stale_time(&self) -> Duration {
        self.inner.stale_time
    }

    pub(crate) fn locks(&self) -> &MutationLocks {
        &self.inner.locks
    }

    /// Get or create the slot for `key`.
    pub(crate) fn slot<T: Entity>(&self, key: &CacheKey) -> SyncResult<Arc<QuerySlot<T>>> {
        let erased = self
            .inner
            .slots
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(QuerySlot::<T>::new(key.clone())) as Arc<dyn ErasedSlot>
            })
            .value()
            .clone();
        downcast_slot(key, erased)
    }

    fn existing_slot<T: Entity>(&self, key: &CacheKey) -> SyncResult<Option<Arc<QuerySlot<T>>>> {
        let erased = self.inner.slots.get(key).map(|s| s.value().clone());
        erased.map(|s| downcast_slot(key, s)).transpose()
    }

    /// Resolve a query and return a handle observing its slot.
    ///
    /// A cache hit is published before this returns. If the hit is older
    /// than the stale time, a background refresh is started and the cached
    /// value stays visible until it completes. A miss fetches from the
    /// remote before returning; fetch errors are published in the state,
    /// not returned.
    pub async fn use_query<T: Entity>(
        &self,
        descriptor: QueryDescriptor,
        options: QueryOptions,
    ) -> SyncResult<QueryHandle<T>> {
        let key = options
            .cache_key
            .clone()
            .unwrap_or_else(|| descriptor.cache_key());
        let stale_time = options.stale_time.unwrap_or(self.inner.stale_time);

        if !options.enabled {
            debug!(key = %key, "query disabled");
            let slot = Arc::new(QuerySlot::new(key));
            return Ok(QueryHandle::new(self.clone(), slot, descriptor, stale_time, false));
        }

        let slot = self.slot::<T>(&key)?;
        slot.set_descriptor(&descriptor);
        let handle = QueryHandle::new(self.clone(), slot, descriptor, stale_time, true);
        self.load(&handle.slot, &handle.descriptor, stale_time, false)
            .await;
        Ok(handle)
    }

    async fn load<T: Entity>(
        &self,
        slot: &Arc<QuerySlot<T>>,
        descriptor: &QueryDescriptor,
        stale_time: Duration,
        force_refresh: bool,
    ) -> QueryState<T> {
        if !force_refresh {
            match self.inner.cache.read::<Vec<T>>(slot.key()).await {
                Ok(Some(read)) => {
                    let is_stale = read.is_stale(stale_time);
                    debug!(
                        key = %slot.key(),
                        age_ms = read.age().as_millis() as u64,
                        invalidated = read.is_invalidated(),
                        is_stale,
                        "serving cached query result"
                    );
                    slot.publish_cached(read.into_value(), is_stale);
                    if is_stale {
                        self.spawn_fetch(Arc::clone(slot), descriptor.clone());
                    }
                    return slot.state();
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %slot.key(), error = %e, "cache read failed, fetching from remote");
                }
            }
        }

        let _ = self.execute_fetch(slot, descriptor).await;
        slot.state()
    }

    fn spawn_fetch<T: Entity>(&self, slot: Arc<QuerySlot<T>>, descriptor: QueryDescriptor) {
        let client = self.clone();
        tokio::spawn(async move {
            let _ = client.execute_fetch(&slot, &descriptor).await;
        });
    }

    async fn execute_fetch<T: Entity>(
        &self,
        slot: &QuerySlot<T>,
        descriptor: &QueryDescriptor,
    ) -> SyncResult<Vec<T>> {
        let started_at = Utc::now();
        let generation = slot.begin_fetch();
        debug!(key = %slot.key(), generation, resource = %descriptor.resource, "fetch started");

        let result = match self.inner.remote.query(descriptor).await {
            Ok(rows) => decode_rows::<T>(rows),
            Err(e) => Err(e),
        };

        let applied = slot.finish_fetch(generation, &result);
        match &result {
            Ok(rows) if applied => {
                // Dated by the read, so an invalidation recorded while the
                // fetch was out still marks the entry.
                if let Err(e) = self
                    .inner
                    .cache
                    .set_written_at(slot.key(), rows, started_at)
                    .await
                {
                    warn!(key = %slot.key(), error = %e, "failed to cache fetch result");
                }
                debug!(key = %slot.key(), generation, rows = rows.len(), "fetch completed");
            }
            Ok(_) => {
                debug!(key = %slot.key(), generation, "discarding out-of-generation fetch completion");
            }
            Err(e) => {
                warn!(key = %slot.key(), generation, error = %e, "fetch failed");
            }
        }
        result
    }

    /// Mark `key` stale so its next read re-synchronizes with the remote.
    ///
    /// Fetches already in flight for `key` are fenced off and neither
    /// publish nor cache their rows. Slots with live handles are refetched
    /// in the background right away.
    pub async fn invalidate(&self, key: &CacheKey) -> SyncResult<()> {
        let slot = self.inner.slots.get(key).map(|s| s.value().clone());
        if let Some(slot) = &slot {
            slot.fence();
        }
        self.inner.cache.invalidate(key).await?;
        if let Some(slot) = slot {
            slot.mark_stale();
            if slot.has_subscribers() {
                debug!(key = %key, "refetching invalidated query");
                slot.spawn_refetch(self.clone());
            }
        }
        Ok(())
    }

    /// Replace the in-memory data for `key`.
    ///
    /// The cache store is not written; the next successful fetch does that.
    pub fn set_query_data<T: Entity>(&self, key: &CacheKey, data: Vec<T>) -> SyncResult<()> {
        self.slot::<T>(key)?.replace_data(data);
        Ok(())
    }

    /// Current in-memory data for `key`, if any slot holds some.
    pub fn query_data<T: Entity>(&self, key: &CacheKey) -> SyncResult<Option<Vec<T>>> {
        Ok(self.existing_slot::<T>(key)?.and_then(|slot| slot.data()))
    }

    /// Current state for `key`, if a slot exists.
    pub fn query_state<T: Entity>(&self, key: &CacheKey) -> SyncResult<Option<QueryState<T>>> {
        Ok(self.existing_slot::<T>(key)?.map(|slot| slot.state()))
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("slots", &self.inner.slots.len())
            .field("stale_time", &self.inner.stale_time)
            .finish_non_exhaustive()
    }
}

fn downcast_slot<T: Entity>(
    key: &CacheKey,
    erased: Arc<dyn ErasedSlot>,
) -> SyncResult<Arc<QuerySlot<T>>> {
    erased
        .into_any()
        .downcast::<QuerySlot<T>>()
        .map_err(|_| SyncError::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
        })
}

fn decode_rows<T: Entity>(rows: Vec<Value>) -> SyncResult<Vec<T>> {
    rows.into_iter()
        .map(|row| serde_json::from_value::<T>(row).map_err(SyncError::decode::<T>))
        .collect()
}

/// A consumer's view of one query.
///
/// Holding a handle keeps its slot "live": invalidating the key refetches
/// it in the background.
pub struct QueryHandle<T: Entity> {
    client: QueryClient,
    slot: Arc<QuerySlot<T>>,
    receiver: watch::Receiver<QueryState<T>>,
    descriptor: QueryDescriptor,
    stale_time: Duration,
    enabled: bool,
}

impl<T: Entity> QueryHandle<T> {
    fn new(
        client: QueryClient,
        slot: Arc<QuerySlot<T>>,
        descriptor: QueryDescriptor,
        stale_time: Duration,
        enabled: bool,
    ) -> Self {
        let receiver = slot.state.subscribe();
        Self {
            client,
            slot,
            receiver,
            descriptor,
            stale_time,
            enabled,
        }
    }

    pub fn key(&self) -> &CacheKey {
        self.slot.key()
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Synchronous snapshot of the current state.
    pub fn state(&self) -> QueryState<T> {
        self.receiver.borrow().clone()
    }

    pub fn data(&self) -> Option<Vec<T>> {
        self.receiver.borrow().data.clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.receiver.clone()
    }

    /// Re-run the query. `force_refresh` bypasses the cache entirely.
    pub async fn refetch(&self, force_refresh: bool) -> QueryState<T> {
        if !self.enabled {
            return self.state();
        }
        self.client
            .load(&self.slot, &self.descriptor, self.stale_time, force_refresh)
            .await
    }
}

impl<T: Entity> std::fmt::Debug for QueryHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("key", self.slot.key())
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}
