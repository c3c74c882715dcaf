//! In-memory stand-ins for the platform ports.
//!
//! Every fake counts its calls so tests can assert exactly how many
//! subscriptions were opened and how many recomputes reached the RPC layer.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eryxon_core::types::{EntityId, TenantId};
use eryxon_realtime::ports::{
    AggregationRpc, ChangeEventSource, RoutingQuery, SourceEvent, SourceSubscription,
    SubscribeRequest, SubscriptionHandle,
};
use eryxon_realtime::{
    ChangeKind, ChangeNotification, EntityType, LifecycleManager, QuietWindows, RealtimeConfig,
    RealtimeError,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const WINDOW: Duration = Duration::from_millis(200);

/// Configuration with one quiet window for every key kind.
pub fn test_config() -> RealtimeConfig {
    RealtimeConfig {
        windows: QuietWindows::uniform(WINDOW),
        close_timeout: Duration::from_secs(1),
        ..RealtimeConfig::default()
    }
}

/// Advance (paused) time far enough for pending fetches and timers to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(2)).await;
}

// ---------------------------------------------------------------------------
// FakeSource
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SourceState {
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    fail_next: AtomicBool,
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, mpsc::Sender<SourceEvent>>>,
    requests: Mutex<Vec<SubscribeRequest>>,
}

/// Change-event source whose events are pushed by the test.
#[derive(Default)]
pub struct FakeSource {
    state: Arc<SourceState>,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribes(&self) -> usize {
        self.state.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.state.unsubscribes.load(Ordering::SeqCst)
    }

    /// Subscriptions opened and not yet released.
    pub fn open(&self) -> usize {
        self.state.live.lock().unwrap().len()
    }

    pub fn fail_next_subscribe(&self) {
        self.state.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<SubscribeRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Deliver an event on every live subscription.
    pub fn push(&self, event: SourceEvent) {
        for tx in self.state.live.lock().unwrap().values() {
            let _ = tx.try_send(event.clone());
        }
    }

    pub fn push_change(&self, change: ChangeNotification) {
        self.push(SourceEvent::Change(change));
    }
}

struct FakeHandle {
    id: u64,
    state: Arc<SourceState>,
}

#[async_trait]
impl SubscriptionHandle for FakeHandle {
    async fn unsubscribe(self: Box<Self>) {
        self.state.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.state.live.lock().unwrap().remove(&self.id);
    }
}

#[async_trait]
impl ChangeEventSource for FakeSource {
    async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<SourceSubscription, RealtimeError> {
        if self.state.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RealtimeError::transport("realtime endpoint unreachable"));
        }

        self.state.subscribes.fetch_add(1, Ordering::SeqCst);
        self.state.requests.lock().unwrap().push(request);

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        self.state.live.lock().unwrap().insert(id, tx);

        Ok(SourceSubscription {
            events: rx,
            handle: Box::new(FakeHandle {
                id,
                state: Arc::clone(&self.state),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// FakeRpc
// ---------------------------------------------------------------------------

/// Aggregation RPCs answering with the call number as `current_wip`, so a
/// test can tell which call produced a cached value.
#[derive(Default)]
pub struct FakeRpc {
    calls: AtomicUsize,
    delays: Mutex<VecDeque<Duration>>,
    failing_cells: Mutex<HashSet<EntityId>>,
    down: AtomicBool,
}

impl FakeRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Delay the next calls, in call order.
    pub fn delay_next(&self, delays: impl IntoIterator<Item = Duration>) {
        self.delays.lock().unwrap().extend(delays);
    }

    pub fn fail_cell(&self, cell_id: EntityId) {
        self.failing_cells.lock().unwrap().insert(cell_id);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    async fn call(&self, cell_id: EntityId) -> Result<u64, RealtimeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.down.load(Ordering::SeqCst) {
            return Err(RealtimeError::transport("rpc unreachable"));
        }
        if self.failing_cells.lock().unwrap().contains(&cell_id) {
            return Err(RealtimeError::transport(format!("timeout computing {cell_id}")));
        }
        Ok(call as u64)
    }
}

#[async_trait]
impl AggregationRpc for FakeRpc {
    async fn compute_cell_metrics(
        &self,
        cell_id: EntityId,
        _tenant_id: TenantId,
    ) -> Result<Value, RealtimeError> {
        let call = self.call(cell_id).await?;
        Ok(json!({
            "cell_id": cell_id,
            "current_wip": call,
            "wip_limit": 10,
            "in_progress_operations": 1,
            "queued_operations": 0,
            "completed_today": 4,
            "availability": 0.9,
            "performance": 0.8,
            "quality": 1.0,
        }))
    }

    async fn compute_next_cell_capacity(
        &self,
        cell_id: EntityId,
        _tenant_id: TenantId,
    ) -> Result<Value, RealtimeError> {
        let call = self.call(cell_id).await?;
        Ok(json!({
            "cell_id": cell_id,
            "next_cell_id": Uuid::nil(),
            "next_cell_name": "Bending",
            "current_wip": call,
            "wip_limit": 5,
            "enforce_wip_limit": true,
            "has_capacity": call < 5,
        }))
    }
}

// ---------------------------------------------------------------------------
// FakeRoutingQuery
// ---------------------------------------------------------------------------

/// Query service serving fixed cell and operation rows.
#[derive(Default)]
pub struct FakeRoutingQuery {
    cells: Mutex<Vec<Value>>,
    operations: Mutex<Vec<Value>>,
    calls: AtomicUsize,
}

impl FakeRoutingQuery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_cells(&self, rows: Vec<Value>) {
        *self.cells.lock().unwrap() = rows;
    }

    pub fn set_operations(&self, rows: Vec<Value>) {
        *self.operations.lock().unwrap() = rows;
    }

    fn operations_where(&self, keep: impl Fn(&Value) -> bool) -> Value {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Value::Array(
            self.operations
                .lock()
                .unwrap()
                .iter()
                .filter(|row| keep(row))
                .cloned()
                .collect(),
        )
    }
}

fn id_at(row: &Value, pointer: &str) -> Option<EntityId> {
    row.pointer(pointer)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

#[async_trait]
impl RoutingQuery for FakeRoutingQuery {
    async fn cells(&self, _tenant_id: TenantId) -> Result<Value, RealtimeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Array(self.cells.lock().unwrap().clone()))
    }

    async fn part_operations(
        &self,
        _tenant_id: TenantId,
        part_id: EntityId,
    ) -> Result<Value, RealtimeError> {
        Ok(self.operations_where(|row| id_at(row, "/part_id") == Some(part_id)))
    }

    async fn job_operations(
        &self,
        _tenant_id: TenantId,
        job_id: EntityId,
    ) -> Result<Value, RealtimeError> {
        Ok(self.operations_where(|row| id_at(row, "/part/job_id") == Some(job_id)))
    }

    async fn jobs_operations(
        &self,
        _tenant_id: TenantId,
        job_ids: &BTreeSet<EntityId>,
    ) -> Result<Value, RealtimeError> {
        Ok(self.operations_where(|row| {
            id_at(row, "/part/job_id").is_some_and(|job| job_ids.contains(&job))
        }))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub struct Harness {
    pub source: Arc<FakeSource>,
    pub rpc: Arc<FakeRpc>,
    pub query: Arc<FakeRoutingQuery>,
    pub manager: LifecycleManager,
}

pub fn harness(config: RealtimeConfig) -> Harness {
    let source = FakeSource::new();
    let rpc = FakeRpc::new();
    let query = FakeRoutingQuery::new();
    let manager = LifecycleManager::new(
        Arc::clone(&source) as Arc<dyn ChangeEventSource>,
        Arc::clone(&rpc) as Arc<dyn AggregationRpc>,
        Arc::clone(&query) as Arc<dyn RoutingQuery>,
        config,
    );
    Harness {
        source,
        rpc,
        query,
        manager,
    }
}

pub fn cell_row(tenant: TenantId, id: EntityId, name: &str, sequence: i32) -> Value {
    json!({
        "id": id,
        "tenant_id": tenant,
        "name": name,
        "sequence": sequence,
        "active": true,
    })
}

pub fn operation_row(
    tenant: TenantId,
    part: EntityId,
    job: EntityId,
    cell: (EntityId, &str, i32),
    status: &str,
) -> Value {
    json!({
        "id": Uuid::new_v4(),
        "tenant_id": tenant,
        "cell_id": cell.0,
        "part_id": part,
        "sequence": cell.2,
        "status": status,
        "cell": {"name": cell.1, "sequence": cell.2},
        "part": {"job_id": job},
    })
}

/// An operation update that stays on `part`.
pub fn operation_change(part: EntityId) -> ChangeNotification {
    ChangeNotification::new(EntityType::Operation, ChangeKind::Update)
        .with_id(Uuid::new_v4())
        .with_field("part_id", part.to_string())
        .with_old_field("part_id", part.to_string())
}

/// An operation update moving it from one part to another.
pub fn operation_moved(from: EntityId, to: EntityId) -> ChangeNotification {
    ChangeNotification::new(EntityType::Operation, ChangeKind::Update)
        .with_id(Uuid::new_v4())
        .with_field("part_id", to.to_string())
        .with_old_field("part_id", from.to_string())
}
