//! Remote data accessor primitives.
//!
//! The synchronization layer is written against these three traits; the
//! surrounding application supplies the implementation (the PostgREST
//! accessor in [`crate::rest`], the WebSocket channel in [`crate::ws`], or
//! an in-process mock in tests).

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use syncline_core::{
    EntityId, MutationError, OwnerScope, QueryDescriptor, RawChangeEvent, Scalar, SyncResult,
};
use tokio::sync::{mpsc, oneshot};

/// Remote query primitive.
#[async_trait]
pub trait RemoteQuery: Send + Sync {
    /// Rows of `descriptor.resource` matching its filters, ordering and limit.
    async fn query(&self, descriptor: &QueryDescriptor) -> SyncResult<Vec<Value>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOperation {
    Insert,
    Update,
    Delete,
}

impl WriteOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A single remote write.
///
/// Updates and deletes apply to every row matching `filters`; the helpers
/// below target a single row by id.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub resource: String,
    pub operation: WriteOperation,
    pub payload: Value,
    pub filters: BTreeMap<String, Scalar>,
}

impl WriteRequest {
    pub fn insert(resource: impl Into<String>, row: Value) -> Self {
        Self {
            resource: resource.into(),
            operation: WriteOperation::Insert,
            payload: row,
            filters: BTreeMap::new(),
        }
    }

    pub fn update(resource: impl Into<String>, id: &EntityId, patch: Value) -> Self {
        Self::update_matching(resource, patch).matching("id", id_scalar(id))
    }

    pub fn update_matching(resource: impl Into<String>, patch: Value) -> Self {
        Self {
            resource: resource.into(),
            operation: WriteOperation::Update,
            payload: patch,
            filters: BTreeMap::new(),
        }
    }

    pub fn delete(resource: impl Into<String>, id: &EntityId) -> Self {
        Self::delete_matching(resource).matching("id", id_scalar(id))
    }

    pub fn delete_matching(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            operation: WriteOperation::Delete,
            payload: Value::Null,
            filters: BTreeMap::new(),
        }
    }

    /// Restrict the write to rows where `field` equals `value`.
    pub fn matching(mut self, field: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    /// Check whether a row is affected by this write.
    pub fn targets(&self, row: &Value) -> bool {
        self.filters
            .iter()
            .fold(QueryDescriptor::new(self.resource.clone()), |d, (field, value)| {
                d.filter(field.clone(), value.clone())
            })
            .matches(row)
    }
}

/// Numeric ids compare as numbers against remote rows. Text that only
/// looks numeric, like `"0042"` or `"+7"`, stays text.
fn id_scalar(id: &EntityId) -> Scalar {
    let text = id.as_str();
    match text.parse::<i64>() {
        Ok(n) if n.to_string() == text => Scalar::Int(n),
        _ => Scalar::Text(text.to_string()),
    }
}

/// Remote write primitive.
#[async_trait]
pub trait RemoteWrite: Send + Sync {
    /// Perform the write and return the affected rows as stored remotely.
    async fn write(&self, request: WriteRequest) -> SyncResult<Vec<Value>>;

    /// Perform a write expected to touch exactly one row and return it.
    async fn write_one(&self, request: WriteRequest) -> SyncResult<Value> {
        let resource = request.resource.clone();
        let rows = self.write(request).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| MutationError::NoRowsAffected { resource }.into())
    }
}

/// Remote channel primitive.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Open a push channel delivering change events for `scope`.
    async fn open_channel(&self, scope: OwnerScope) -> SyncResult<Subscription>;
}

/// Receiving end of an open push channel.
///
/// Dropping the subscription closes it.
#[derive(Debug)]
pub struct Subscription {
    scope: OwnerScope,
    events: mpsc::Receiver<SyncResult<RawChangeEvent>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Subscription {
    /// Wrap a stream of events. `shutdown` is signalled on close so a
    /// transport task can tear down its connection.
    pub fn new(
        scope: OwnerScope,
        events: mpsc::Receiver<SyncResult<RawChangeEvent>>,
        shutdown: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            scope,
            events,
            shutdown,
        }
    }

    pub fn scope(&self) -> OwnerScope {
        self.scope
    }

    /// Next event, or `None` once the channel has ended.
    pub async fn next_event(&mut self) -> Option<SyncResult<RawChangeEvent>> {
        self.events.recv().await
    }

    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.events.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncline_core::ChangeEvent;
    use uuid::Uuid;

    #[test]
    fn test_update_targets_single_row() {
        let request = WriteRequest::update("orders", &EntityId::from(42), json!({"status": "shipped"}));
        assert!(request.targets(&json!({"id": 42, "status": "pending"})));
        assert!(!request.targets(&json!({"id": 43, "status": "pending"})));
    }

    #[test]
    fn test_padded_text_ids_are_not_parsed() {
        let numeric = WriteRequest::delete("orders", &EntityId::from(42));
        assert_eq!(numeric.filters.get("id"), Some(&Scalar::Int(42)));

        let padded = WriteRequest::delete("orders", &EntityId::from("0042"));
        assert_eq!(padded.filters.get("id"), Some(&Scalar::Text("0042".into())));
        assert!(padded.targets(&json!({"id": "0042"})));
        assert!(!padded.targets(&json!({"id": 42})));
    }

    #[test]
    fn test_matching_combines_filters() {
        let request = WriteRequest::update_matching("notifications", json!({"read": true}))
            .matching("user_id", "u1")
            .matching("read", false);
        assert!(request.targets(&json!({"id": "n1", "user_id": "u1", "read": false})));
        assert!(!request.targets(&json!({"id": "n2", "user_id": "u1", "read": true})));
        assert!(!request.targets(&json!({"id": "n3", "user_id": "u2", "read": false})));
    }

    #[tokio::test]
    async fn test_close_signals_transport() {
        let scope = OwnerScope::new(Uuid::now_v7());
        let (tx, rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let mut subscription = Subscription::new(scope, rx, Some(shutdown_tx));

        tx.send(Ok(ChangeEvent::delete(scope, "n1")))
            .await
            .expect("send");
        assert!(subscription.next_event().await.is_some());

        subscription.close();
        assert!(shutdown_rx.await.is_ok());
        assert!(tx.is_closed());
    }
}
