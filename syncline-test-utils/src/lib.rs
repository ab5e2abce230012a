//! Syncline Test Utilities
//!
//! Centralized test infrastructure for the Syncline workspace:
//! - A scripted in-memory remote with call counters, programmable failures
//!   and gates that hold calls open so races can be staged deterministically
//! - A test-driven change channel
//! - Proptest generators and fixtures for orders and notifications
//! - Custom assertions for error variants

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};

// Re-export the types tests touch most often
pub use syncline_client::{
    RemoteChannel, RemoteQuery, RemoteWrite, Subscription, WriteOperation, WriteRequest,
};
pub use syncline_core::{
    CacheKey, ChangeEvent, ChannelError, EntityId, FetchError, MutationError, OwnerScope,
    QueryDescriptor, RawChangeEvent, SyncError, SyncResult,
};
pub use syncline_storage::{CacheStore, InMemoryCacheBackend, InMemoryInvalidationJournal};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-memory cache store with a fresh journal.
pub fn memory_cache() -> CacheStore {
    CacheStore::with_defaults(
        Arc::new(InMemoryCacheBackend::new()),
        Arc::new(InMemoryInvalidationJournal::new()),
    )
}

// ============================================================================
// GATES
// ============================================================================

/// Holds a remote call open until the test releases it.
///
/// ```ignore
/// let gate = Gate::new();
/// remote.gate_next_query(gate.clone());
/// let pending = tokio::spawn(async move { handle.refetch(true).await });
/// gate.entered().await;   // the call is now in flight
/// // ... stage the race ...
/// gate.release();
/// ```
#[derive(Debug)]
pub struct Gate {
    entered: Semaphore,
    release: Semaphore,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Semaphore::new(0),
            release: Semaphore::new(0),
        })
    }

    /// Wait until a call has reached the gate.
    pub async fn entered(&self) {
        if let Ok(permit) = self.entered.acquire().await {
            permit.forget();
        }
    }

    /// Let one held call continue.
    pub fn release(&self) {
        self.release.add_permits(1);
    }

    async fn pass(&self) {
        self.entered.add_permits(1);
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }
}

// ============================================================================
// MOCK REMOTE
// ============================================================================

/// Scripted remote service backed by in-memory tables.
///
/// Queries evaluate the descriptor against the table as it was when the
/// call started. Writes apply to the table and return the affected rows.
#[derive(Debug, Default)]
pub struct MockRemote {
    tables: Mutex<BTreeMap<String, Vec<Value>>>,
    query_calls: AtomicUsize,
    write_calls: AtomicUsize,
    query_failures: Mutex<VecDeque<SyncError>>,
    write_failures: Mutex<VecDeque<SyncError>>,
    query_gates: Mutex<VecDeque<Arc<Gate>>>,
    write_gates: Mutex<VecDeque<Arc<Gate>>>,
    writes: Mutex<Vec<WriteRequest>>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_rows(resource: &str, rows: Vec<Value>) -> Arc<Self> {
        let remote = Self::new();
        remote.set_rows(resource, rows);
        remote
    }

    pub fn set_rows(&self, resource: &str, rows: Vec<Value>) {
        lock(&self.tables).insert(resource.to_string(), rows);
    }

    pub fn rows(&self, resource: &str) -> Vec<Value> {
        lock(&self.tables).get(resource).cloned().unwrap_or_default()
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Write requests received so far, in order.
    pub fn writes(&self) -> Vec<WriteRequest> {
        lock(&self.writes).clone()
    }

    /// Fail the next query with `error`.
    pub fn fail_next_query(&self, error: SyncError) {
        lock(&self.query_failures).push_back(error);
    }

    /// Fail the next write with `error`. The table is left untouched.
    pub fn fail_next_write(&self, error: SyncError) {
        lock(&self.write_failures).push_back(error);
    }

    pub fn gate_next_query(&self, gate: Arc<Gate>) {
        lock(&self.query_gates).push_back(gate);
    }

    pub fn gate_next_write(&self, gate: Arc<Gate>) {
        lock(&self.write_gates).push_back(gate);
    }

    fn apply(&self, request: &WriteRequest) -> Vec<Value> {
        let mut tables = lock(&self.tables);
        let table = tables.entry(request.resource.clone()).or_default();
        match request.operation {
            WriteOperation::Insert => {
                table.insert(0, request.payload.clone());
                vec![request.payload.clone()]
            }
            WriteOperation::Update => {
                let mut updated = Vec::new();
                for row in table.iter_mut().filter(|row| request.targets(row)) {
                    if let (Some(row), Some(patch)) =
                        (row.as_object_mut(), request.payload.as_object())
                    {
                        for (field, value) in patch {
                            row.insert(field.clone(), value.clone());
                        }
                    }
                    updated.push(row.clone());
                }
                updated
            }
            WriteOperation::Delete => {
                let (removed, kept): (Vec<Value>, Vec<Value>) =
                    table.drain(..).partition(|row| request.targets(row));
                *table = kept;
                removed
            }
        }
    }
}

#[async_trait]
impl RemoteQuery for MockRemote {
    async fn query(&self, descriptor: &QueryDescriptor) -> SyncResult<Vec<Value>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let failure = lock(&self.query_failures).pop_front();
        let rows = descriptor.evaluate(self.rows(&descriptor.resource));
        let gate = lock(&self.query_gates).pop_front();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(rows),
        }
    }
}

#[async_trait]
impl RemoteWrite for MockRemote {
    async fn write(&self, request: WriteRequest) -> SyncResult<Vec<Value>> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.writes).push(request.clone());
        let gate = lock(&self.write_gates).pop_front();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if let Some(error) = lock(&self.write_failures).pop_front() {
            return Err(error);
        }
        Ok(self.apply(&request))
    }
}

// ============================================================================
// MOCK CHANNEL
// ============================================================================

/// Change channel whose events are injected by the test.
#[derive(Debug, Default)]
pub struct MockChannel {
    feeds: Mutex<HashMap<OwnerScope, mpsc::Sender<SyncResult<RawChangeEvent>>>>,
    opens: AtomicUsize,
    open_failures: Mutex<VecDeque<SyncError>>,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fail_next_open(&self, error: SyncError) {
        lock(&self.open_failures).push_back(error);
    }

    /// Deliver `event` on the scope's open channel. Returns false if no
    /// channel is open for the scope.
    pub async fn inject(&self, scope: OwnerScope, event: RawChangeEvent) -> bool {
        self.send(scope, Ok(event)).await
    }

    pub async fn inject_error(&self, scope: OwnerScope, error: SyncError) -> bool {
        self.send(scope, Err(error)).await
    }

    /// End the scope's event stream from the transport side.
    pub fn hang_up(&self, scope: OwnerScope) {
        lock(&self.feeds).remove(&scope);
    }

    /// True once the subscriber has closed the scope's channel.
    pub fn is_closed(&self, scope: OwnerScope) -> bool {
        lock(&self.feeds)
            .get(&scope)
            .map(|feed| feed.is_closed())
            .unwrap_or(true)
    }

    async fn send(&self, scope: OwnerScope, item: SyncResult<RawChangeEvent>) -> bool {
        let feed = lock(&self.feeds).get(&scope).cloned();
        match feed {
            Some(feed) => feed.send(item).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl RemoteChannel for MockChannel {
    async fn open_channel(&self, scope: OwnerScope) -> SyncResult<Subscription> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.open_failures).pop_front() {
            return Err(error);
        }
        let (tx, rx) = mpsc::channel(64);
        lock(&self.feeds).insert(scope, tx);
        Ok(Subscription::new(scope, rx, None))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for descriptors and rows.

    use proptest::prelude::*;
    use serde_json::{json, Value};
    use syncline_core::{OrderBy, QueryDescriptor, Scalar};

    pub fn arb_scalar() -> impl Strategy<Value = Scalar> {
        prop_oneof![
            Just(Scalar::Null),
            any::<bool>().prop_map(Scalar::Bool),
            (-1000i64..1000).prop_map(Scalar::Int),
            "[a-z]{1,8}".prop_map(Scalar::Text),
        ]
    }

    pub fn arb_field() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["status", "customer_id", "region", "priority"])
            .prop_map(str::to_string)
    }

    /// Filters as an ordered list; duplicates of a field keep the last operand.
    pub fn arb_filters() -> impl Strategy<Value = Vec<(String, Scalar)>> {
        prop::collection::vec((arb_field(), arb_scalar()), 0..5)
    }

    pub fn arb_order() -> impl Strategy<Value = Option<OrderBy>> {
        prop::option::of(
            (arb_field(), any::<bool>()).prop_map(|(column, ascending)| OrderBy { column, ascending }),
        )
    }

    pub fn arb_descriptor() -> impl Strategy<Value = QueryDescriptor> {
        (arb_filters(), arb_order(), prop::option::of(1usize..50)).prop_map(
            |(filters, order, limit)| {
                let mut descriptor = filters
                    .into_iter()
                    .fold(QueryDescriptor::new("orders"), |d, (field, value)| {
                        d.filter(field, value)
                    });
                descriptor.order = order;
                descriptor.limit = limit;
                descriptor
            },
        )
    }

    pub fn arb_order_row() -> impl Strategy<Value = Value> {
        (
            1i64..500,
            prop::sample::select(vec!["pending", "shipped", "cancelled"]),
            1i64..20,
        )
            .prop_map(|(id, status, customer_id)| {
                json!({"id": id, "status": status, "customer_id": customer_id})
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Fixed rows for the order and notification scenarios.

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::{json, Value};
    use syncline_core::OwnerScope;
    use uuid::Uuid;

    /// Owner scope used by notification fixtures.
    pub fn user_scope() -> OwnerScope {
        OwnerScope::new(Uuid::from_u128(0x5eed))
    }

    pub fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn order(id: i64, status: &str) -> Value {
        json!({
            "id": id,
            "customer_id": 7,
            "status": status,
            "total": 120.5,
        })
    }

    /// Orders 40..=44, all pending.
    pub fn pending_orders() -> Vec<Value> {
        (40..=44).map(|id| order(id, "pending")).collect()
    }

    pub fn notification(id: &str, read: bool, minutes_after_base: i64) -> Value {
        let created = base_time() + Duration::minutes(minutes_after_base);
        json!({
            "id": id,
            "user_id": user_scope().to_string(),
            "type": "order_status",
            "title": format!("Notification {id}"),
            "message": format!("Message for {id}"),
            "data": null,
            "read": read,
            "created_at": created.to_rfc3339(),
            "updated_at": created.to_rfc3339(),
        })
    }

    /// Five notifications n1..n5, newest first, two unread (n5 and n4).
    pub fn notifications() -> Vec<Value> {
        vec![
            notification("n5", false, 5),
            notification("n4", false, 4),
            notification("n3", true, 3),
            notification("n2", true, 2),
            notification("n1", true, 1),
        ]
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on error variants.

    use super::*;

    #[track_caller]
    pub fn assert_fetch_error<T: std::fmt::Debug>(result: &SyncResult<T>) {
        match result {
            Err(SyncError::Fetch(_)) => {}
            other => panic!("Expected Fetch error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_mutation_error<T: std::fmt::Debug>(result: &SyncResult<T>) {
        match result {
            Err(SyncError::Mutation(_)) => {}
            other => panic!("Expected Mutation error, got: {:?}", other),
        }
    }

    /// Transport-level failure as a remote query would report it.
    pub fn transport_failure() -> SyncError {
        FetchError::Transport {
            reason: "connection reset".into(),
        }
        .into()
    }

    /// Remote write rejection.
    pub fn write_rejected(resource: &str) -> SyncError {
        MutationError::Rejected {
            resource: resource.into(),
            status: 409,
            message: "conflict".into(),
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_remote_applies_updates() {
        let remote = MockRemote::with_rows("orders", fixtures::pending_orders());
        let rows = remote
            .write(WriteRequest::update(
                "orders",
                &EntityId::from(42_i64),
                json!({"status": "shipped"}),
            ))
            .await
            .expect("write");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], "shipped");
        assert_eq!(remote.write_calls(), 1);

        let shipped = remote
            .query(&QueryDescriptor::new("orders").filter("status", "shipped"))
            .await
            .expect("query");
        assert_eq!(shipped.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_table_untouched() {
        let remote = MockRemote::with_rows("orders", fixtures::pending_orders());
        remote.fail_next_write(assertions::write_rejected("orders"));
        let result = remote
            .write(WriteRequest::delete("orders", &EntityId::from(40_i64)))
            .await;
        assertions::assert_mutation_error(&result);
        assert_eq!(remote.rows("orders").len(), 5);
    }

    #[tokio::test]
    async fn test_gate_holds_query_until_released() {
        let remote = MockRemote::with_rows("orders", fixtures::pending_orders());
        let gate = Gate::new();
        remote.gate_next_query(gate.clone());

        let task = {
            let remote = remote.clone();
            tokio::spawn(async move { remote.query(&QueryDescriptor::new("orders")).await })
        };
        gate.entered().await;
        assert!(!task.is_finished());
        gate.release();
        let rows = task.await.expect("join").expect("query");
        assert_eq!(rows.len(), 5);
    }
}
