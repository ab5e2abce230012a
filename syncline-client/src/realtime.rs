//! Realtime change subscriber.
//!
//! Applies server-pushed change events to an in-memory [`LiveList`],
//! independently of the query cache. Connection state moves
//! `Disconnected -> Connecting -> Connected -> Disconnected`; reconnection
//! after transport failures is the channel implementation's job.
//!
//! # Delivery
//!
//! Channels may deliver an event more than once, including after a
//! re-subscribe. Each owner scope keeps a bounded LRU of recently applied
//! event fingerprints and drops repeats. Events carrying a server event id
//! are fingerprinted by that id. Inserts and deletes without one are
//! fingerprinted by their content; updates without one are not deduplicated,
//! since replaying an update is harmless and two legitimate updates can
//! carry identical content.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use lru::LruCache;
use syncline_core::{
    compute_content_hash, ChangeEvent, ChangeKind, ChangePayload, Entity, OwnerScope,
    RawChangeEvent, SyncResult,
};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertLevel, AlertSink};
use crate::live_list::{Applied, LiveList};
use crate::remote::{RemoteChannel, Subscription};

/// Default number of remembered event fingerprints per owner scope.
pub const DEFAULT_DEDUP_WINDOW: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type EventCallback<T> = Arc<dyn Fn(&ChangeEvent<T>) + Send + Sync>;
type AlertFn<T> = Arc<dyn Fn(&T) -> Option<Alert> + Send + Sync>;
type SeenEvents = Arc<Mutex<LruCache<String, ()>>>;

struct SubscriberInner<T> {
    channel: Arc<dyn RemoteChannel>,
    list: watch::Sender<LiveList<T>>,
    connection: watch::Sender<ConnectionState>,
    seen: DashMap<OwnerScope, SeenEvents>,
    dedup_window: NonZeroUsize,
    alerts: Option<(AlertSink, AlertFn<T>)>,
    on_event: Option<EventCallback<T>>,
    epoch: AtomicU64,
    active_stop: Mutex<Option<Arc<Notify>>>,
}

/// Subscriber keeping one live list in sync with one owner scope's channel.
///
/// Cloning is cheap; clones share the list and the connection.
pub struct RealtimeSubscriber<T> {
    inner: Arc<SubscriberInner<T>>,
}

impl<T> Clone for RealtimeSubscriber<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity> RealtimeSubscriber<T> {
    /// `counter` selects the rows counted into [`LiveList::counted`].
    pub fn builder<F>(channel: Arc<dyn RemoteChannel>, counter: F) -> RealtimeSubscriberBuilder<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        RealtimeSubscriberBuilder {
            channel,
            list: LiveList::new(counter),
            dedup_window: DEFAULT_DEDUP_WINDOW,
            alerts: None,
            on_event: None,
        }
    }

    pub fn list(&self) -> LiveList<T> {
        self.inner.list.borrow().clone()
    }

    pub fn watch_list(&self) -> watch::Receiver<LiveList<T>> {
        self.inner.list.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    /// Replace the list wholesale, typically after a full reload.
    pub fn replace_items(&self, items: Vec<T>) {
        self.inner.list.send_modify(|list| list.replace_all(items));
    }

    /// Mutate the list and publish the result. Returns the pre-change list.
    pub(crate) fn modify_list(&self, f: impl FnOnce(&mut LiveList<T>)) -> LiveList<T> {
        let mut snapshot = None;
        self.inner.list.send_modify(|list| {
            snapshot = Some(list.clone());
            f(list);
        });
        snapshot.unwrap_or_else(|| self.list())
    }

    pub(crate) fn restore_list(&self, snapshot: LiveList<T>) {
        self.inner.list.send_replace(snapshot);
    }

    /// Open the channel for `scope` and start applying its events.
    ///
    /// A previous subscription on this subscriber is closed first. Events
    /// already applied before a re-subscribe are remembered and not
    /// applied again.
    pub async fn subscribe(&self, scope: OwnerScope) -> SyncResult<SubscriptionHandle> {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let stop = Arc::new(Notify::new());
        let previous = self
            .inner
            .active_stop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Arc::clone(&stop));
        if let Some(previous) = previous {
            previous.notify_one();
        }

        self.inner.connection.send_replace(ConnectionState::Connecting);
        debug!(scope = %scope, "opening change channel");
        let subscription = match self.inner.channel.open_channel(scope).await {
            Ok(subscription) => subscription,
            Err(e) => {
                if self.inner.epoch.load(Ordering::SeqCst) == epoch {
                    self.inner
                        .connection
                        .send_replace(ConnectionState::Disconnected);
                }
                warn!(scope = %scope, error = %e, "failed to open change channel");
                return Err(e);
            }
        };
        self.inner.connection.send_replace(ConnectionState::Connected);
        info!(scope = %scope, "change channel connected");

        let inner = Arc::clone(&self.inner);
        let task_stop = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            inner.pump(scope, subscription, task_stop).await;
            if inner.epoch.load(Ordering::SeqCst) == epoch {
                inner.connection.send_replace(ConnectionState::Disconnected);
                info!(scope = %scope, "change channel disconnected");
            }
        });

        Ok(SubscriptionHandle {
            scope,
            stop,
            task: Some(task),
        })
    }

    /// Apply one raw event as if it had arrived on `scope`'s channel.
    ///
    /// Returns `Applied::Ignored` for duplicates and undecodable events.
    pub fn apply_raw(&self, scope: OwnerScope, raw: RawChangeEvent) -> Applied {
        self.inner.apply_raw(scope, raw)
    }
}

impl<T: Entity> SubscriberInner<T> {
    async fn pump(&self, scope: OwnerScope, mut subscription: Subscription, stop: Arc<Notify>) {
        loop {
            tokio::select! {
                _ = stop.notified() => break,
                event = subscription.next_event() => match event {
                    Some(Ok(raw)) => {
                        self.apply_raw(scope, raw);
                    }
                    Some(Err(e)) => {
                        warn!(scope = %scope, error = %e, "change channel error");
                        if let Some((sink, _)) = &self.alerts {
                            sink.raise(Alert::new(AlertLevel::Warning, "Realtime", e.to_string()));
                        }
                    }
                    None => break,
                },
            }
        }
        subscription.close();
    }

    fn apply_raw(&self, scope: OwnerScope, raw: RawChangeEvent) -> Applied {
        if raw.owner_scope != scope {
            debug!(scope = %scope, event_scope = %raw.owner_scope, "ignoring event for another scope");
            return Applied::Ignored;
        }
        if let Some(fingerprint) = fingerprint(&raw) {
            if !self.remember(scope, fingerprint) {
                debug!(scope = %scope, kind = raw.kind.as_str(), "duplicate event dropped");
                return Applied::Ignored;
            }
        }

        let event = match raw.decode::<T>() {
            Ok(event) => event,
            Err(e) => {
                warn!(scope = %scope, error = %e, "undecodable change event");
                return Applied::Ignored;
            }
        };

        if let Some(on_event) = &self.on_event {
            on_event(&event);
        }

        let alert = match (&self.alerts, &event.payload) {
            (Some((_, alert_for)), ChangePayload::Entity(entity))
                if event.kind == ChangeKind::Insert =>
            {
                alert_for(entity)
            }
            _ => None,
        };

        let kind = event.kind;
        let mut applied = Applied::Ignored;
        self.list.send_if_modified(|list| {
            applied = list.apply(event);
            applied != Applied::Ignored
        });
        debug!(scope = %scope, kind = kind.as_str(), ?applied, "change event applied");

        if applied == Applied::Inserted {
            if let (Some((sink, _)), Some(alert)) = (&self.alerts, alert) {
                sink.raise(alert);
            }
        }
        applied
    }

    /// Record `fingerprint` for `scope`. Returns false if it was already seen.
    fn remember(&self, scope: OwnerScope, fingerprint: String) -> bool {
        let seen = self
            .seen
            .entry(scope)
            .or_insert_with(|| Arc::new(Mutex::new(LruCache::new(self.dedup_window))))
            .value()
            .clone();
        let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner());
        if seen.contains(&fingerprint) {
            seen.promote(&fingerprint);
            return false;
        }
        seen.put(fingerprint, ());
        true
    }
}

/// Dedup key for an event, or `None` if it should always be applied.
fn fingerprint(event: &RawChangeEvent) -> Option<String> {
    if let Some(event_id) = &event.event_id {
        return Some(format!("id:{event_id}"));
    }
    if event.kind == ChangeKind::Update {
        return None;
    }
    let mut material = Vec::new();
    material.extend_from_slice(event.kind.as_str().as_bytes());
    material.push(0);
    material.extend_from_slice(event.entity_id().as_str().as_bytes());
    material.push(0);
    if let ChangePayload::Entity(row) = &event.payload {
        material.extend_from_slice(row.to_string().as_bytes());
    }
    Some(format!(
        "sha256:{}",
        hex::encode(compute_content_hash(&material))
    ))
}

/// Builder for [`RealtimeSubscriber`].
pub struct RealtimeSubscriberBuilder<T> {
    channel: Arc<dyn RemoteChannel>,
    list: LiveList<T>,
    dedup_window: usize,
    alerts: Option<(AlertSink, AlertFn<T>)>,
    on_event: Option<EventCallback<T>>,
}

impl<T: Entity> RealtimeSubscriberBuilder<T> {
    pub fn dedup_window(mut self, window: usize) -> Self {
        self.dedup_window = window;
        self
    }

    /// Raise an alert for inserted rows for which `alert_for` returns one.
    pub fn alerts<F>(mut self, sink: AlertSink, alert_for: F) -> Self
    where
        F: Fn(&T) -> Option<Alert> + Send + Sync + 'static,
    {
        self.alerts = Some((sink, Arc::new(alert_for)));
        self
    }

    /// Callback invoked for every applied (non-duplicate) event.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangeEvent<T>) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(callback));
        self
    }

    pub fn initial_items(mut self, items: Vec<T>) -> Self {
        self.list.replace_all(items);
        self
    }

    pub fn build(self) -> RealtimeSubscriber<T> {
        let (list, _) = watch::channel(self.list);
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        let dedup_window =
            NonZeroUsize::new(self.dedup_window).unwrap_or(NonZeroUsize::MIN);
        RealtimeSubscriber {
            inner: Arc::new(SubscriberInner {
                channel: self.channel,
                list,
                connection,
                seen: DashMap::new(),
                dedup_window,
                alerts: self.alerts,
                on_event: self.on_event,
                epoch: AtomicU64::new(0),
                active_stop: Mutex::new(None),
            }),
        }
    }
}

/// Handle to an open subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct SubscriptionHandle {
    scope: OwnerScope,
    stop: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn scope(&self) -> OwnerScope {
        self.scope
    }

    /// Close the channel and wait until the subscriber has disconnected.
    pub async fn unsubscribe(mut self) {
        self.stop.notify_one();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.stop.notify_one();
    }
}
