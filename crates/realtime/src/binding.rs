//! Event source binding.
//!
//! Opens one subscription per live key, scoped to the key's tenant, and
//! forwards relevant change notifications to a [`BindingSink`].
//!
//! The event source can only filter on one column of one table, so every
//! key subscribes by tenant and drops irrelevant rows here, before they
//! reach the coalescer. [`BindingPlan::for_key`] is the single place that
//! policy is decided.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use eryxon_core::types::EntityId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::RealtimeError;
use crate::key::{ChangeKind, ChangeNotification, EntityType, SubscriptionKey};
use crate::ports::{
    ChangeEventSource, ColumnFilter, SourceEvent, SourceSubscription, SubscribeRequest,
    SubscriptionHandle,
};

/// Column every subscription is filtered on server-side.
const TENANT_COLUMN: &str = "tenant_id";

/// Client-side test deciding whether a notification concerns a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relevance {
    /// Every change of the entity type is relevant.
    Any,
    /// Relevant when `column` equals the id.
    ColumnIs { column: &'static str, id: EntityId },
    /// Relevant when `column` is one of the ids.
    ColumnIn {
        column: &'static str,
        ids: BTreeSet<EntityId>,
    },
}

impl Relevance {
    /// Rows that do not carry the column (e.g. a delete reporting only the
    /// primary key) are treated as relevant. An update is relevant when
    /// either its new or its previous value matches, so a row moving away
    /// from a key still reaches it.
    fn matches(&self, change: &ChangeNotification) -> bool {
        let column = match self {
            Self::Any => return true,
            Self::ColumnIs { column, .. } | Self::ColumnIn { column, .. } => *column,
        };
        let primary_key = || (column == "id").then_some(change.entity_id).flatten();

        let now = change.id_field(column).or_else(primary_key);
        if now.map_or(true, |v| self.accepts(v)) {
            return true;
        }
        change.change_kind == ChangeKind::Update
            && change
                .old_id_field(column)
                .or_else(primary_key)
                .map_or(true, |v| self.accepts(v))
    }

    fn accepts(&self, value: EntityId) -> bool {
        match self {
            Self::Any => true,
            Self::ColumnIs { id, .. } => value == *id,
            Self::ColumnIn { ids, .. } => ids.contains(&value),
        }
    }
}

/// Subscription request plus client-side relevance rules for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingPlan {
    pub request: SubscribeRequest,
    rules: Vec<(EntityType, Relevance)>,
}

impl BindingPlan {
    pub fn for_key(key: &SubscriptionKey) -> Self {
        use EntityType::{Cell, Operation, Part, TimeEntry};
        use Relevance::{Any, ColumnIn, ColumnIs};

        let rules = match key {
            SubscriptionKey::CellMetrics { cell_id, .. } => vec![
                (
                    Operation,
                    ColumnIs {
                        column: "cell_id",
                        id: *cell_id,
                    },
                ),
                // Time entries reference operations, not cells.
                (TimeEntry, Any),
                (
                    Cell,
                    ColumnIs {
                        column: "id",
                        id: *cell_id,
                    },
                ),
            ],
            // The next cell is only known server-side.
            SubscriptionKey::NextCellCapacity { .. } => vec![(Operation, Any), (Cell, Any)],
            SubscriptionKey::CellBoard { .. } => {
                vec![(Operation, Any), (TimeEntry, Any), (Cell, Any)]
            }
            SubscriptionKey::PartRouting { part_id, .. } => vec![
                (
                    Operation,
                    ColumnIs {
                        column: "part_id",
                        id: *part_id,
                    },
                ),
                (Cell, Any),
            ],
            // Operations carry no job column; the part rows do.
            SubscriptionKey::JobRouting { job_id, .. } => vec![
                (Operation, Any),
                (
                    Part,
                    ColumnIs {
                        column: "job_id",
                        id: *job_id,
                    },
                ),
                (Cell, Any),
            ],
            SubscriptionKey::JobsRouting { job_ids, .. } => vec![
                (Operation, Any),
                (
                    Part,
                    ColumnIn {
                        column: "job_id",
                        ids: job_ids.clone(),
                    },
                ),
                (Cell, Any),
            ],
        };

        let tenant_id = key.tenant_id();
        Self {
            request: SubscribeRequest {
                tenant_id,
                entity_types: rules.iter().map(|(entity, _)| *entity).collect(),
                filter: ColumnFilter::eq(TENANT_COLUMN, tenant_id),
            },
            rules,
        }
    }

    pub fn is_relevant(&self, change: &ChangeNotification) -> bool {
        self.rules
            .iter()
            .find(|(entity, _)| *entity == change.entity_type)
            .is_some_and(|(_, rule)| rule.matches(change))
    }
}

/// Receives the output of a binding's forwarder.
pub trait BindingSink: Send + Sync + 'static {
    fn on_change(&self, key: &SubscriptionKey);
    fn on_channel_error(&self, key: &SubscriptionKey, reason: String);
    fn on_channel_recovered(&self, key: &SubscriptionKey);
}

/// An open subscription for one key.
///
/// Every successful [`open`](Self::open) must be paired with one
/// [`close`](Self::close). Dropping an unclosed binding still releases the
/// subscription on the current runtime.
pub struct EventSourceBinding {
    key: SubscriptionKey,
    cancel: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
    handle: Option<Box<dyn SubscriptionHandle>>,
    close_timeout: Duration,
}

impl EventSourceBinding {
    pub async fn open(
        source: &dyn ChangeEventSource,
        key: SubscriptionKey,
        sink: Arc<dyn BindingSink>,
        close_timeout: Duration,
    ) -> Result<Self, RealtimeError> {
        let plan = BindingPlan::for_key(&key);
        let SourceSubscription { events, handle } = source.subscribe(plan.request.clone()).await?;

        tracing::debug!(
            key = %key,
            entity_types = ?plan.request.entity_types,
            filter = %plan.request.filter.expression(),
            "Event source binding opened",
        );

        let cancel = CancellationToken::new();
        let forwarder = tokio::spawn(forward(events, plan, key.clone(), sink, cancel.clone()));

        Ok(Self {
            key,
            cancel,
            forwarder: Some(forwarder),
            handle: Some(handle),
            close_timeout,
        })
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Stop forwarding and release the subscription.
    ///
    /// Once this returns the forwarder has exited, so the sink receives
    /// nothing more from this binding.
    pub async fn close(mut self) {
        self.cancel.cancel();

        if let Some(mut task) = self.forwarder.take() {
            if tokio::time::timeout(self.close_timeout, &mut task).await.is_err() {
                tracing::warn!(key = %self.key, "Forwarder did not exit in time, aborting");
                task.abort();
            }
        }

        if let Some(handle) = self.handle.take() {
            handle.unsubscribe().await;
        }

        tracing::debug!(key = %self.key, "Event source binding closed");
    }
}

impl Drop for EventSourceBinding {
    fn drop(&mut self) {
        self.cancel.cancel();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
        tracing::warn!(key = %self.key, "Event source binding dropped without close");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(handle.unsubscribe());
        }
    }
}

async fn forward(
    mut events: mpsc::Receiver<SourceEvent>,
    plan: BindingPlan,
    key: SubscriptionKey,
    sink: Arc<dyn BindingSink>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(SourceEvent::Change(change)) => {
                if plan.is_relevant(&change) {
                    tracing::trace!(key = %key, entity = ?change.entity_type, "Change notification");
                    sink.on_change(&key);
                } else {
                    tracing::trace!(key = %key, entity = ?change.entity_type, "Discarding irrelevant change");
                }
            }
            Some(SourceEvent::ChannelError(reason)) => {
                tracing::warn!(key = %key, reason = %reason, "Subscription channel unhealthy");
                sink.on_channel_error(&key, reason);
            }
            Some(SourceEvent::ChannelRecovered) => {
                tracing::info!(key = %key, "Subscription channel recovered");
                sink.on_channel_recovered(&key);
            }
            None => {
                if !cancel.is_cancelled() {
                    tracing::warn!(key = %key, "Event stream ended unexpectedly");
                    sink.on_channel_error(&key, "event stream ended".into());
                }
                break;
            }
        }
    }
}
