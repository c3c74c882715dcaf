//! Interfaces to the external data platform.
//!
//! The layer never reaches for a global client: the change-event source and
//! the query/RPC service are injected as trait objects, so everything above
//! this module can run against fakes.

use std::collections::BTreeSet;

use async_trait::async_trait;
use eryxon_core::types::{EntityId, TenantId};
use tokio::sync::mpsc;

use crate::error::RealtimeError;
use crate::key::{ChangeNotification, EntityType};

/// Equality filter on a single column of a single table.
///
/// This is the only server-side filter shape the event source supports;
/// anything that needs a join is filtered client-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFilter {
    pub column: String,
    pub value: String,
}

impl ColumnFilter {
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Self {
            column: column.into(),
            value: value.to_string(),
        }
    }

    /// PostgREST-style filter expression, e.g. `tenant_id=eq.<uuid>`.
    pub fn expression(&self) -> String {
        format!("{}=eq.{}", self.column, self.value)
    }
}

/// Parameters of one `subscribe` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub tenant_id: TenantId,
    pub entity_types: Vec<EntityType>,
    /// Applied to every entity type. Always includes the tenant boundary.
    pub filter: ColumnFilter,
}

/// Items delivered on a subscription's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Change(ChangeNotification),
    /// The source's channel is unhealthy; live updates may be missed.
    ChannelError(String),
    /// The channel is healthy again after an earlier `ChannelError`.
    ChannelRecovered,
}

/// Releases the connection behind a subscription.
#[async_trait]
pub trait SubscriptionHandle: Send + Sync {
    async fn unsubscribe(self: Box<Self>);
}

/// A live subscription: a stream of events plus its release handle.
pub struct SourceSubscription {
    pub events: mpsc::Receiver<SourceEvent>,
    pub handle: Box<dyn SubscriptionHandle>,
}

/// The external change-event service.
#[async_trait]
pub trait ChangeEventSource: Send + Sync {
    async fn subscribe(&self, request: SubscribeRequest)
        -> Result<SourceSubscription, RealtimeError>;
}

/// Server-side aggregation RPCs. Results are raw JSON; the fetcher
/// validates them.
#[async_trait]
pub trait AggregationRpc: Send + Sync {
    async fn compute_cell_metrics(
        &self,
        cell_id: EntityId,
        tenant_id: TenantId,
    ) -> Result<serde_json::Value, RealtimeError>;

    async fn compute_next_cell_capacity(
        &self,
        cell_id: EntityId,
        tenant_id: TenantId,
    ) -> Result<serde_json::Value, RealtimeError>;
}

/// Read queries returning raw rows as JSON arrays.
#[async_trait]
pub trait RoutingQuery: Send + Sync {
    /// Cells of the tenant (the fetcher keeps the active ones).
    async fn cells(&self, tenant_id: TenantId) -> Result<serde_json::Value, RealtimeError>;

    /// Operation rows of one part, with `cell` embedded.
    async fn part_operations(
        &self,
        tenant_id: TenantId,
        part_id: EntityId,
    ) -> Result<serde_json::Value, RealtimeError>;

    /// Operation rows of one job, with `cell` and `part` embedded.
    async fn job_operations(
        &self,
        tenant_id: TenantId,
        job_id: EntityId,
    ) -> Result<serde_json::Value, RealtimeError>;

    /// Operation rows of several jobs, with `cell` and `part` embedded.
    async fn jobs_operations(
        &self,
        tenant_id: TenantId,
        job_ids: &BTreeSet<EntityId>,
    ) -> Result<serde_json::Value, RealtimeError>;
}
