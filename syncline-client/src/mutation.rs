//! Mutation executor.
//!
//! A mutation snapshots the query slots it targets, applies an optimistic
//! patch, performs the remote write, restores the snapshots if the write
//! fails, and finally invalidates every affected key whatever the outcome.
//!
//! # Overlap
//!
//! Mutations declare the fields they touch. Two mutations that share a
//! `(key, field)` pair run one after the other, so the second always
//! snapshots settled state. A mutation that declares no fields locks its
//! target slots exclusively. Mutations on disjoint fields still interleave.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt};
use syncline_core::{CacheKey, Entity, SyncResult};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};

use crate::query::QueryClient;

type WriteFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, SyncResult<O>> + Send + Sync>;
type PatchFn<T, I> = Arc<dyn Fn(&[T], &I) -> Vec<T> + Send + Sync>;
type SuccessFn<I, O> = Arc<dyn Fn(&O, &I) + Send + Sync>;

/// Lock table serializing overlapping mutations.
#[derive(Default)]
pub(crate) struct MutationLocks {
    slots: DashMap<CacheKey, Arc<RwLock<()>>>,
    fields: DashMap<(CacheKey, String), Arc<Mutex<()>>>,
}

/// Locks held by one in-flight mutation until it settles.
#[derive(Default)]
pub(crate) struct MutationGuard {
    _shared: Vec<OwnedRwLockReadGuard<()>>,
    _exclusive: Vec<OwnedRwLockWriteGuard<()>>,
    _fields: Vec<OwnedMutexGuard<()>>,
}

impl MutationLocks {
    /// Acquire slot locks, then field locks, each in sorted order.
    pub(crate) async fn acquire(&self, keys: &[CacheKey], fields: &[String]) -> MutationGuard {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();
        let mut fields = fields.to_vec();
        fields.sort();
        fields.dedup();

        let mut guard = MutationGuard::default();
        for key in &keys {
            let lock = self.slots.entry(key.clone()).or_default().value().clone();
            if fields.is_empty() {
                guard._exclusive.push(lock.write_owned().await);
            } else {
                guard._shared.push(lock.read_owned().await);
            }
        }
        for key in &keys {
            for field in &fields {
                let lock = self
                    .fields
                    .entry((key.clone(), field.clone()))
                    .or_default()
                    .value()
                    .clone();
                guard._fields.push(lock.lock_owned().await);
            }
        }
        guard
    }
}

/// A configured mutation over query slots holding `T` rows.
///
/// `I` is the caller's input, `O` the write's output.
pub struct Mutation<T, I, O> {
    client: QueryClient,
    write: WriteFn<I, O>,
    optimistic: Option<PatchFn<T, I>>,
    targets: Vec<CacheKey>,
    invalidates: Vec<CacheKey>,
    fields: Vec<String>,
    on_success: Option<SuccessFn<I, O>>,
}

impl<T, I, O> Clone for Mutation<T, I, O> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            write: Arc::clone(&self.write),
            optimistic: self.optimistic.clone(),
            targets: self.targets.clone(),
            invalidates: self.invalidates.clone(),
            fields: self.fields.clone(),
            on_success: self.on_success.clone(),
        }
    }
}

impl<T, I, O> Mutation<T, I, O>
where
    T: Entity,
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    /// Start building a mutation around a remote write.
    pub fn builder<F, Fut>(client: &QueryClient, write: F) -> MutationBuilder<T, I, O>
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<O>> + Send + 'static,
    {
        let write: WriteFn<I, O> = Arc::new(move |input| write(input).boxed());
        MutationBuilder {
            inner: Mutation {
                client: client.clone(),
                write,
                optimistic: None,
                targets: Vec::new(),
                invalidates: Vec::new(),
                fields: Vec::new(),
                on_success: None,
            },
        }
    }

    pub fn targets(&self) -> &[CacheKey] {
        &self.targets
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Run the mutation.
    ///
    /// The optimistic patch is visible to every handle on the target slots
    /// before the remote write starts. On failure each patched slot is
    /// restored to its exact pre-mutation snapshot and the write's error is
    /// returned. Invalidation runs after either outcome.
    pub async fn mutate(&self, input: I) -> SyncResult<O> {
        let _guard = self
            .client
            .locks()
            .acquire(&self.targets, &self.fields)
            .await;

        let slots = self
            .targets
            .iter()
            .map(|key| self.client.slot::<T>(key))
            .collect::<SyncResult<Vec<_>>>()?;

        let mut snapshots = Vec::new();
        if let Some(patch) = &self.optimistic {
            for slot in &slots {
                if let Some(snapshot) = slot.apply_patch(|rows| patch(rows, &input)) {
                    debug!(key = %slot.key(), "optimistic patch applied");
                    snapshots.push((Arc::clone(slot), snapshot));
                }
            }
        }

        let result = (self.write)(input.clone()).await;
        match &result {
            Ok(output) => {
                if let Some(on_success) = &self.on_success {
                    on_success(output, &input);
                }
                debug!(targets = self.targets.len(), "mutation succeeded");
            }
            Err(e) => {
                for (slot, snapshot) in snapshots {
                    slot.replace_data(snapshot);
                    debug!(key = %slot.key(), "optimistic patch rolled back");
                }
                warn!(error = %e, "mutation failed");
            }
        }

        self.settle().await;
        result
    }

    async fn settle(&self) {
        let mut keys: Vec<&CacheKey> = self.targets.iter().chain(&self.invalidates).collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            match self.client.invalidate(key).await {
                Ok(()) => debug!(key = %key, "invalidated on settle"),
                Err(e) => warn!(key = %key, error = %e, "settle invalidation failed"),
            }
        }
    }
}

/// Builder for [`Mutation`].
pub struct MutationBuilder<T, I, O> {
    inner: Mutation<T, I, O>,
}

impl<T, I, O> MutationBuilder<T, I, O>
where
    T: Entity,
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    /// Patch applied to every target slot before the write.
    pub fn optimistic<F>(mut self, patch: F) -> Self
    where
        F: Fn(&[T], &I) -> Vec<T> + Send + Sync + 'static,
    {
        self.inner.optimistic = Some(Arc::new(patch));
        self
    }

    /// Slots snapshotted, patched and invalidated by this mutation.
    pub fn targets(mut self, keys: impl IntoIterator<Item = CacheKey>) -> Self {
        self.inner.targets.extend(keys);
        self
    }

    /// Additional keys invalidated on settle.
    pub fn invalidates(mut self, keys: impl IntoIterator<Item = CacheKey>) -> Self {
        self.inner.invalidates.extend(keys);
        self
    }

    /// Fields of the target rows this mutation writes.
    pub fn fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.inner.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&O, &I) + Send + Sync + 'static,
    {
        self.inner.on_success = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Mutation<T, I, O> {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(k: &str) -> CacheKey {
        CacheKey::custom(k)
    }

    #[tokio::test]
    async fn test_disjoint_fields_do_not_block() {
        let locks = MutationLocks::default();
        let _status = locks
            .acquire(&[key("orders")], &["status".to_string()])
            .await;
        let notes = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(&[key("orders")], &["notes".to_string()]),
        )
        .await;
        assert!(notes.is_ok());
    }

    #[tokio::test]
    async fn test_shared_field_waits_for_settle() {
        let locks = MutationLocks::default();
        let first = locks
            .acquire(&[key("orders")], &["status".to_string()])
            .await;

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            locks.acquire(&[key("orders")], &["status".to_string()]),
        )
        .await;
        assert!(blocked.is_err());

        drop(first);
        let second = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(&[key("orders")], &["status".to_string()]),
        )
        .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_fieldless_mutation_is_exclusive() {
        let locks = MutationLocks::default();
        let _field = locks
            .acquire(&[key("orders")], &["status".to_string()])
            .await;
        let exclusive = tokio::time::timeout(
            Duration::from_millis(50),
            locks.acquire(&[key("orders")], &[]),
        )
        .await;
        assert!(exclusive.is_err());

        let other_slot = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(&[key("customers")], &[]),
        )
        .await;
        assert!(other_slot.is_ok());
    }
}
