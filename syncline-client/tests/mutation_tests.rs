//! Optimistic mutations: rollback, settle-time invalidation, overlap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use syncline_client::orders::{cancel_order, update_order_status, StatusChange, StatusRecord};
use syncline_client::{Mutation, QueryClient, QueryHandle, QueryOptions, RemoteWrite, WriteRequest};
use syncline_core::{CacheKey, Entity, EntityId, QueryDescriptor, SyncError};
use syncline_test_utils::{assertions, fixtures, memory_cache, Gate, MockRemote};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: i64,
    customer_id: i64,
    status: String,
    total: f64,
}

impl Entity for Order {
    fn entity_id(&self) -> EntityId {
        self.id.into()
    }
}

impl StatusRecord for Order {
    fn set_status(&mut self, status: &str) {
        self.status = status.to_string();
    }
}

async fn orders_handle(client: &QueryClient) -> QueryHandle<Order> {
    client
        .use_query::<Order>(QueryDescriptor::new("orders"), QueryOptions::default())
        .await
        .expect("query")
}

fn status_of(rows: &[Order], id: i64) -> Option<&str> {
    rows.iter().find(|o| o.id == id).map(|o| o.status.as_str())
}

#[tokio::test]
async fn test_failed_status_update_restores_exact_snapshot() {
    let remote = MockRemote::with_rows("orders", fixtures::pending_orders());
    let client = QueryClient::new(memory_cache(), remote.clone());
    let handle = Arc::new(orders_handle(&client).await);
    let snapshot = handle.data().expect("loaded");
    let snapshot_bytes = serde_json::to_vec(&snapshot).expect("encode");

    let mutation = update_order_status::<Order>(&client, remote.clone(), [handle.key().clone()]);
    let gate = Gate::new();
    remote.gate_next_write(gate.clone());
    remote.fail_next_write(assertions::write_rejected("orders"));

    let pending = {
        let mutation = mutation.clone();
        tokio::spawn(async move { mutation.mutate(StatusChange::new(42_i64, "shipped")).await })
    };
    gate.entered().await;

    let patched = handle.data().expect("patched");
    assert_eq!(status_of(&patched, 42), Some("shipped"));
    assert_eq!(status_of(&patched, 41), Some("pending"));

    gate.release();
    let result = pending.await.expect("join");
    assertions::assert_mutation_error(&result);

    let restored = handle.data().expect("restored");
    assert_eq!(serde_json::to_vec(&restored).expect("encode"), snapshot_bytes);
    let stored = remote.rows("orders");
    assert_eq!(stored[2]["id"], 42);
    assert_eq!(stored[2]["status"], "pending");
}

#[tokio::test]
async fn test_successful_update_invalidates_and_refetches() {
    let remote = MockRemote::with_rows("orders", fixtures::pending_orders());
    let client = QueryClient::new(memory_cache(), remote.clone());
    let handle = orders_handle(&client).await;

    let mutation = update_order_status::<Order>(&client, remote.clone(), [handle.key().clone()]);
    let updated = mutation
        .mutate(StatusChange::new(42_i64, "shipped"))
        .await
        .expect("mutate");
    assert_eq!(updated.status, "shipped");

    let mut updates = handle.subscribe();
    let state = updates
        .wait_for(|s| !s.is_stale && !s.loading)
        .await
        .expect("refetch")
        .clone();
    assert_eq!(status_of(&state.data.expect("data"), 42), Some("shipped"));
    assert_eq!(remote.query_calls(), 2);

    let cached = client
        .cache()
        .read::<Vec<Order>>(handle.key())
        .await
        .expect("cache read")
        .expect("entry");
    assert!(!cached.is_invalidated());
}

#[tokio::test]
async fn test_settle_invalidates_extra_keys_after_failure() {
    let remote = MockRemote::with_rows("orders", fixtures::pending_orders());
    let client = QueryClient::new(memory_cache(), remote.clone());
    let handle = orders_handle(&client).await;

    let summary = CacheKey::custom("order-summary");
    client
        .cache()
        .set(&summary, &json!({"pending": 5}))
        .await
        .expect("seed summary");

    let mutation = Mutation::<Order, EntityId, Value>::builder(&client, {
        let remote = remote.clone();
        move |id: EntityId| {
            let remote = remote.clone();
            async move { remote.write_one(WriteRequest::delete("orders", &id)).await }
        }
    })
    .targets([handle.key().clone()])
    .invalidates([summary.clone()])
    .build();

    remote.fail_next_write(assertions::write_rejected("orders"));
    let result = mutation.mutate(EntityId::from(40_i64)).await;
    assertions::assert_mutation_error(&result);

    let read = client
        .cache()
        .read::<Value>(&summary)
        .await
        .expect("cache read")
        .expect("entry");
    assert!(read.is_invalidated());
}

#[tokio::test]
async fn test_cancel_order_sets_cancelled() {
    let remote = MockRemote::with_rows("orders", fixtures::pending_orders());
    let client = QueryClient::new(memory_cache(), remote.clone());
    let handle = orders_handle(&client).await;

    let cancel = cancel_order::<Order>(&client, remote.clone(), [handle.key().clone()]);
    let cancelled = cancel.mutate(EntityId::from(43_i64)).await.expect("cancel");
    assert_eq!(cancelled.status, "cancelled");

    let writes = remote.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].payload, json!({"status": "cancelled"}));
}

#[tokio::test]
async fn test_write_matching_no_rows_rolls_back() {
    let remote = MockRemote::with_rows("orders", fixtures::pending_orders());
    let client = QueryClient::new(memory_cache(), remote.clone());
    let handle = orders_handle(&client).await;
    let before = handle.data();

    let mutation = update_order_status::<Order>(&client, remote.clone(), [handle.key().clone()]);
    let err = mutation
        .mutate(StatusChange::new(7_i64, "shipped"))
        .await
        .expect_err("no such order");
    assert!(matches!(err, SyncError::Mutation(_)));
    assert_eq!(handle.data(), before);
}

#[tokio::test]
async fn test_overlapping_status_mutations_are_serialized() {
    let remote = MockRemote::with_rows("orders", fixtures::pending_orders());
    let client = QueryClient::new(memory_cache(), remote.clone());
    let handle = Arc::new(orders_handle(&client).await);
    let mutation = update_order_status::<Order>(&client, remote.clone(), [handle.key().clone()]);

    let gate = Gate::new();
    remote.gate_next_write(gate.clone());
    remote.fail_next_write(assertions::write_rejected("orders"));

    let first = {
        let mutation = mutation.clone();
        tokio::spawn(async move { mutation.mutate(StatusChange::new(42_i64, "shipped")).await })
    };
    gate.entered().await;

    let second = {
        let mutation = mutation.clone();
        tokio::spawn(async move { mutation.mutate(StatusChange::new(41_i64, "shipped")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.write_calls(), 1, "second mutation must wait for the first to settle");

    gate.release();
    assert!(first.await.expect("join").is_err());
    second.await.expect("join").expect("second mutation");

    // The first rollback happened before the second snapshot, so 42 stays
    // pending while 41 ships.
    let mut updates = handle.subscribe();
    let state = updates
        .wait_for(|s| !s.is_stale && !s.loading)
        .await
        .expect("settled")
        .clone();
    let rows = state.data.expect("data");
    assert_eq!(status_of(&rows, 42), Some("pending"));
    assert_eq!(status_of(&rows, 41), Some("shipped"));
}

#[tokio::test]
async fn test_disjoint_fields_run_concurrently() {
    let remote = MockRemote::with_rows("orders", fixtures::pending_orders());
    let client = QueryClient::new(memory_cache(), remote.clone());
    let handle = orders_handle(&client).await;
    let key = handle.key().clone();

    let status = update_order_status::<Order>(&client, remote.clone(), [key.clone()]);
    let notes_calls = Arc::new(AtomicUsize::new(0));
    let notes = Mutation::<Order, EntityId, Value>::builder(&client, {
        let remote = remote.clone();
        let notes_calls = Arc::clone(&notes_calls);
        move |id: EntityId| {
            let remote = remote.clone();
            notes_calls.fetch_add(1, Ordering::SeqCst);
            async move {
                remote
                    .write_one(WriteRequest::update("orders", &id, json!({"notes": "fragile"})))
                    .await
            }
        }
    })
    .targets([key])
    .fields(["notes"])
    .build();

    let gate = Gate::new();
    remote.gate_next_write(gate.clone());
    let held = tokio::spawn(async move { status.mutate(StatusChange::new(42_i64, "shipped")).await });
    gate.entered().await;

    tokio::time::timeout(Duration::from_secs(1), notes.mutate(EntityId::from(44_i64)))
        .await
        .expect("notes mutation must not wait")
        .expect("notes write");
    assert_eq!(notes_calls.load(Ordering::SeqCst), 1);

    gate.release();
    held.await.expect("join").expect("status write");
}

#[tokio::test]
async fn test_settle_fences_refresh_started_before_mutation() {
    let cache = memory_cache();
    let descriptor = QueryDescriptor::new("orders");
    cache
        .set_written_at(
            &descriptor.cache_key(),
            &fixtures::pending_orders(),
            chrono::Utc::now() - chrono::Duration::minutes(2),
        )
        .await
        .expect("seed cache");

    let remote = MockRemote::with_rows("orders", fixtures::pending_orders());
    let client = QueryClient::with_stale_time(cache, remote.clone(), Duration::from_secs(60));

    // The stale hit starts a refresh that reads all five orders and then
    // stalls before completing.
    let gate = Gate::new();
    remote.gate_next_query(gate.clone());
    let handle = client
        .use_query::<Order>(descriptor.clone(), QueryOptions::default())
        .await
        .expect("query");
    gate.entered().await;
    let key = handle.key().clone();
    drop(handle);

    let clear_pending = Mutation::<Order, (), Vec<Value>>::builder(&client, {
        let remote = remote.clone();
        move |_: ()| {
            let remote = remote.clone();
            async move {
                remote
                    .write(WriteRequest::delete_matching("orders").matching("status", "pending"))
                    .await
            }
        }
    })
    .targets([key.clone()])
    .build();
    let removed = clear_pending.mutate(()).await.expect("mutate");
    assert_eq!(removed.len(), 5);

    gate.release();
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let state = client.query_state::<Order>(&key).expect("slot type");
            if state.is_some_and(|s| !s.loading) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("refresh finished");

    let cached = client
        .cache()
        .read::<Vec<Order>>(&key)
        .await
        .expect("cache read")
        .expect("entry");
    assert!(cached.is_invalidated(), "pre-mutation rows must not be cached as fresh");
    assert_eq!(remote.query_calls(), 1);

    let reader = client
        .use_query::<Order>(descriptor, QueryOptions::default())
        .await
        .expect("query");
    assert!(reader.state().is_stale);

    let mut updates = reader.subscribe();
    let state = updates
        .wait_for(|s| !s.is_stale && !s.loading)
        .await
        .expect("refetch")
        .clone();
    assert_eq!(state.data.map(|rows| rows.len()), Some(0));
    assert_eq!(remote.query_calls(), 2);
}
