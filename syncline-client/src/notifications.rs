//! Realtime-backed notification list.
//!
//! [`NotificationCenter`] keeps the signed-in user's notifications in a
//! [`LiveList`] fed by the change channel and exposes the list actions
//! (mark read, delete, clear) as optimistic writes that roll the list back
//! if the remote write fails.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use syncline_core::{
    ChannelError, Entity, EntityId, OrderBy, OwnerScope, QueryDescriptor, SyncError, SyncResult,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertLevel, AlertSink};
use crate::live_list::LiveList;
use crate::realtime::{ConnectionState, RealtimeSubscriber, SubscriptionHandle};
use crate::remote::{RemoteChannel, RemoteQuery, RemoteWrite, WriteRequest};

pub const NOTIFICATIONS_RESOURCE: &str = "notifications";

/// Most recent notifications loaded on refresh.
pub const NOTIFICATION_PAGE: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Notification {
    fn entity_id(&self) -> EntityId {
        EntityId::new(self.id.clone())
    }
}

/// Snapshot of the notification list.
#[derive(Debug, Clone, PartialEq)]
pub struct Notifications {
    /// Newest first.
    pub items: Vec<Notification>,
    pub unread_count: usize,
}

impl From<&LiveList<Notification>> for Notifications {
    fn from(list: &LiveList<Notification>) -> Self {
        Self {
            items: list.items().to_vec(),
            unread_count: list.counted(),
        }
    }
}

pub struct NotificationCenter {
    query: Arc<dyn RemoteQuery>,
    write: Arc<dyn RemoteWrite>,
    subscriber: RealtimeSubscriber<Notification>,
    alerts: Option<AlertSink>,
    scope: Mutex<Option<OwnerScope>>,
    actions: tokio::sync::Mutex<()>,
}

impl NotificationCenter {
    pub fn new(
        query: Arc<dyn RemoteQuery>,
        write: Arc<dyn RemoteWrite>,
        channel: Arc<dyn RemoteChannel>,
        dedup_window: usize,
    ) -> Self {
        let subscriber = RealtimeSubscriber::builder(channel, |n: &Notification| !n.read)
            .dedup_window(dedup_window)
            .build();
        Self {
            query,
            write,
            subscriber,
            alerts: None,
            scope: Mutex::new(None),
            actions: tokio::sync::Mutex::new(()),
        }
    }

    /// Raise an alert for every newly inserted notification and for the
    /// outcome of list actions.
    pub fn with_alerts(
        query: Arc<dyn RemoteQuery>,
        write: Arc<dyn RemoteWrite>,
        channel: Arc<dyn RemoteChannel>,
        dedup_window: usize,
        sink: AlertSink,
    ) -> Self {
        let subscriber = RealtimeSubscriber::builder(channel, |n: &Notification| !n.read)
            .dedup_window(dedup_window)
            .alerts(sink.clone(), |n: &Notification| {
                Some(Alert::new(AlertLevel::Info, n.title.clone(), n.message.clone()))
            })
            .build();
        Self {
            query,
            write,
            subscriber,
            alerts: Some(sink),
            scope: Mutex::new(None),
            actions: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> Notifications {
        Notifications::from(&self.subscriber.list())
    }

    pub fn unread_count(&self) -> usize {
        self.subscriber.list().counted()
    }

    pub fn watch(&self) -> watch::Receiver<LiveList<Notification>> {
        self.subscriber.watch_list()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.subscriber.connection_state()
    }

    pub fn subscriber(&self) -> &RealtimeSubscriber<Notification> {
        &self.subscriber
    }

    /// Load the list for `scope` and start following its change channel.
    pub async fn connect(&self, scope: OwnerScope) -> SyncResult<SubscriptionHandle> {
        *self.scope.lock().unwrap_or_else(|e| e.into_inner()) = Some(scope);
        self.refresh().await?;
        self.subscriber.subscribe(scope).await
    }

    /// Reload the newest notifications for the connected scope.
    pub async fn refresh(&self) -> SyncResult<()> {
        let scope = self.current_scope()?;
        let descriptor = QueryDescriptor::new(NOTIFICATIONS_RESOURCE)
            .filter("user_id", scope.to_string())
            .order_by(OrderBy::desc("created_at"))
            .limit(NOTIFICATION_PAGE);
        let rows = self.query.query(&descriptor).await.map_err(|e| {
            warn!(scope = %scope, error = %e, "failed to load notifications");
            e
        })?;
        let items = rows
            .into_iter()
            .map(serde_json::from_value::<Notification>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(SyncError::decode::<Notification>)?;
        debug!(scope = %scope, count = items.len(), "notifications loaded");
        self.subscriber.replace_items(items);
        Ok(())
    }

    pub async fn mark_as_read(&self, id: &str) -> SyncResult<()> {
        let id = EntityId::new(id);
        let request =
            WriteRequest::update(NOTIFICATIONS_RESOURCE, &id, json!({ "read": true }));
        self.run_action("mark_as_read", request, None, |list| {
            list.update_each(|n| {
                if n.entity_id() == id {
                    n.read = true;
                }
            })
        })
        .await
    }

    pub async fn mark_all_as_read(&self) -> SyncResult<()> {
        if self.unread_count() == 0 {
            return Ok(());
        }
        let scope = self.current_scope()?;
        let request = WriteRequest::update_matching(NOTIFICATIONS_RESOURCE, json!({ "read": true }))
            .matching("user_id", scope.to_string())
            .matching("read", false);
        self.run_action(
            "mark_all_as_read",
            request,
            Some("All notifications marked as read"),
            |list| list.update_each(|n| n.read = true),
        )
        .await
    }

    pub async fn delete(&self, id: &str) -> SyncResult<()> {
        let id = EntityId::new(id);
        let request = WriteRequest::delete(NOTIFICATIONS_RESOURCE, &id);
        self.run_action("delete", request, Some("Notification deleted"), |list| {
            list.retain(|n| n.entity_id() != id)
        })
        .await
    }

    pub async fn clear_all(&self) -> SyncResult<()> {
        let scope = self.current_scope()?;
        let request = WriteRequest::delete_matching(NOTIFICATIONS_RESOURCE)
            .matching("user_id", scope.to_string());
        self.run_action(
            "clear_all",
            request,
            Some("All notifications cleared"),
            |list| list.replace_all(Vec::new()),
        )
        .await
    }

    /// Patch the list, write, and restore the pre-patch list on failure.
    ///
    /// Actions are serialized so a rollback never discards another
    /// action's patch.
    async fn run_action(
        &self,
        action: &'static str,
        request: WriteRequest,
        success: Option<&str>,
        patch: impl FnOnce(&mut LiveList<Notification>),
    ) -> SyncResult<()> {
        let _serial = self.actions.lock().await;
        let snapshot = self.subscriber.modify_list(patch);
        debug!(action, "notification list patched");

        match self.write.write(request).await {
            Ok(_) => {
                info!(action, "notification action applied");
                if let Some(message) = success {
                    self.alert(AlertLevel::Success, message);
                }
                Ok(())
            }
            Err(e) => {
                warn!(action, error = %e, "notification action failed, rolling back");
                self.subscriber.restore_list(snapshot);
                self.alert(AlertLevel::Error, &format!("{action} failed: {e}"));
                Err(e)
            }
        }
    }

    fn alert(&self, level: AlertLevel, message: &str) {
        if let Some(sink) = &self.alerts {
            sink.raise(Alert::new(level, "Notifications", message));
        }
    }

    fn current_scope(&self) -> SyncResult<OwnerScope> {
        let scope = *self.scope.lock().unwrap_or_else(|e| e.into_inner());
        scope.ok_or_else(|| ChannelError::NotConnected.into())
    }
}
