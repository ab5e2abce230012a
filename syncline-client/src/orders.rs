//! Order status mutations.

use std::sync::Arc;

use serde_json::{json, Value};
use syncline_core::{CacheKey, Entity, EntityId, SyncError, SyncResult};

use crate::mutation::Mutation;
use crate::query::QueryClient;
use crate::remote::{RemoteWrite, WriteRequest};

pub const ORDERS_RESOURCE: &str = "orders";
pub const STATUS_CANCELLED: &str = "cancelled";

/// Rows carrying a mutable `status` column.
pub trait StatusRecord: Entity {
    fn set_status(&mut self, status: &str);
}

impl StatusRecord for Value {
    fn set_status(&mut self, status: &str) {
        if let Some(row) = self.as_object_mut() {
            row.insert("status".to_string(), Value::String(status.to_string()));
        }
    }
}

/// Input to [`update_order_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub order_id: EntityId,
    pub status: String,
}

impl StatusChange {
    pub fn new(order_id: impl Into<EntityId>, status: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            status: status.into(),
        }
    }
}

fn with_status<T: StatusRecord>(rows: &[T], id: &EntityId, status: &str) -> Vec<T> {
    rows.iter()
        .map(|row| {
            let mut row = row.clone();
            if row.entity_id() == *id {
                row.set_status(status);
            }
            row
        })
        .collect()
}

async fn write_status<T: StatusRecord>(
    remote: Arc<dyn RemoteWrite>,
    id: EntityId,
    status: String,
) -> SyncResult<T> {
    let row = remote
        .write_one(WriteRequest::update(
            ORDERS_RESOURCE,
            &id,
            json!({ "status": status }),
        ))
        .await?;
    serde_json::from_value(row).map_err(SyncError::decode::<T>)
}

/// Change an order's status, optimistically updating every list in `targets`.
pub fn update_order_status<T: StatusRecord>(
    client: &QueryClient,
    remote: Arc<dyn RemoteWrite>,
    targets: impl IntoIterator<Item = CacheKey>,
) -> Mutation<T, StatusChange, T> {
    Mutation::builder(client, move |change: StatusChange| {
        write_status::<T>(Arc::clone(&remote), change.order_id, change.status)
    })
    .optimistic(|rows: &[T], change: &StatusChange| {
        with_status(rows, &change.order_id, &change.status)
    })
    .targets(targets)
    .fields(["status"])
    .build()
}

/// Cancel an order.
pub fn cancel_order<T: StatusRecord>(
    client: &QueryClient,
    remote: Arc<dyn RemoteWrite>,
    targets: impl IntoIterator<Item = CacheKey>,
) -> Mutation<T, EntityId, T> {
    Mutation::builder(client, move |order_id: EntityId| {
        write_status::<T>(Arc::clone(&remote), order_id, STATUS_CANCELLED.to_string())
    })
    .optimistic(|rows: &[T], order_id: &EntityId| with_status(rows, order_id, STATUS_CANCELLED))
    .targets(targets)
    .fields(["status"])
    .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_status_only_touches_matching_row() {
        let rows = vec![
            json!({"id": 41, "status": "pending"}),
            json!({"id": 42, "status": "pending"}),
        ];
        let patched = with_status(&rows, &EntityId::from(42), "shipped");
        assert_eq!(patched[0], rows[0]);
        assert_eq!(patched[1], json!({"id": 42, "status": "shipped"}));
    }
}
