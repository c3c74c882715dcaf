//! Aggregation fetcher.
//!
//! Turns a subscription key into a [`Snapshot`] by calling the injected
//! RPC and query ports. Raw payloads are validated through the schemas in
//! `eryxon_core` here, so nothing untyped reaches a cache slot.

use std::collections::BTreeMap;
use std::sync::Arc;

use eryxon_core::cell::{parse_active_cells, Cell};
use eryxon_core::metrics::{CapacitySnapshot, CellMetricsSnapshot};
use eryxon_core::operation::parse_operation_rows;
use eryxon_core::routing::{route_jobs, route_rows};
use eryxon_core::types::TenantId;

use crate::config::FanoutPolicy;
use crate::error::{KeyFailure, RealtimeError};
use crate::key::SubscriptionKey;
use crate::ports::{AggregationRpc, RoutingQuery};
use crate::snapshot::{BoardCell, CellBoard, Snapshot};

/// Result of a fan-out that did not fail atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct FanoutReport {
    pub attempted: usize,
    pub snapshots: BTreeMap<SubscriptionKey, Snapshot>,
    /// Empty under [`FanoutPolicy::Atomic`].
    pub failures: Vec<KeyFailure>,
}

impl FanoutReport {
    /// The partial-failure error enumerating every failed key, if any.
    pub fn error(&self) -> Option<RealtimeError> {
        (!self.failures.is_empty()).then(|| RealtimeError::PartialFanout {
            attempted: self.attempted,
            failures: self.failures.clone(),
        })
    }
}

/// Fetches and normalizes snapshots for subscription keys.
pub struct AggregationFetcher {
    rpc: Arc<dyn AggregationRpc>,
    query: Arc<dyn RoutingQuery>,
    policy: FanoutPolicy,
    unknown_cell_label: String,
}

impl AggregationFetcher {
    pub fn new(
        rpc: Arc<dyn AggregationRpc>,
        query: Arc<dyn RoutingQuery>,
        policy: FanoutPolicy,
        unknown_cell_label: impl Into<String>,
    ) -> Self {
        Self {
            rpc,
            query,
            policy,
            unknown_cell_label: unknown_cell_label.into(),
        }
    }

    pub fn policy(&self) -> FanoutPolicy {
        self.policy
    }

    /// Compute the snapshot for one key.
    pub async fn fetch(&self, key: &SubscriptionKey) -> Result<Snapshot, RealtimeError> {
        match key {
            SubscriptionKey::CellMetrics { tenant_id, cell_id } => {
                let payload = self.rpc.compute_cell_metrics(*cell_id, *tenant_id).await?;
                let snapshot = CellMetricsSnapshot::from_payload(*cell_id, *tenant_id, payload)?;
                Ok(Snapshot::CellMetrics(snapshot))
            }
            SubscriptionKey::NextCellCapacity { tenant_id, cell_id } => {
                let payload = self
                    .rpc
                    .compute_next_cell_capacity(*cell_id, *tenant_id)
                    .await?;
                let snapshot = CapacitySnapshot::from_payload(*cell_id, *tenant_id, payload)?;
                Ok(Snapshot::Capacity(snapshot))
            }
            SubscriptionKey::CellBoard { tenant_id } => self.fetch_board(*tenant_id).await,
            SubscriptionKey::PartRouting { tenant_id, part_id } => {
                let payload = self.query.part_operations(*tenant_id, *part_id).await?;
                let rows = parse_operation_rows(*tenant_id, payload)?;
                Ok(Snapshot::Routing(route_rows(&rows, &self.unknown_cell_label)))
            }
            SubscriptionKey::JobRouting { tenant_id, job_id } => {
                let payload = self.query.job_operations(*tenant_id, *job_id).await?;
                let rows = parse_operation_rows(*tenant_id, payload)?;
                Ok(Snapshot::Routing(route_rows(&rows, &self.unknown_cell_label)))
            }
            SubscriptionKey::JobsRouting { tenant_id, job_ids } => {
                if job_ids.is_empty() {
                    return Ok(Snapshot::JobsRouting(BTreeMap::new()));
                }
                let payload = self.query.jobs_operations(*tenant_id, job_ids).await?;
                let rows = parse_operation_rows(*tenant_id, payload)?;
                Ok(Snapshot::JobsRouting(route_jobs(
                    &rows,
                    job_ids,
                    &self.unknown_cell_label,
                )))
            }
        }
    }

    /// Fetch many keys concurrently.
    ///
    /// Every sub-fetch is independent. Under [`FanoutPolicy::Atomic`] any
    /// failure fails the call with a [`RealtimeError::PartialFanout`] naming
    /// every failed key; under [`FanoutPolicy::Partial`] the report carries
    /// the successful snapshots and the enumerated failures.
    pub async fn fetch_all(
        &self,
        keys: Vec<SubscriptionKey>,
    ) -> Result<FanoutReport, RealtimeError> {
        let attempted = keys.len();
        let results = futures::future::join_all(keys.into_iter().map(|key| async move {
            let result = self.fetch(&key).await;
            (key, result)
        }))
        .await;

        let mut snapshots = BTreeMap::new();
        let mut failures = Vec::new();
        for (key, result) in results {
            match result {
                Ok(snapshot) => {
                    snapshots.insert(key, snapshot);
                }
                Err(e) => failures.push(KeyFailure {
                    key,
                    reason: e.to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            tracing::warn!(
                attempted,
                failed = failures.len(),
                policy = ?self.policy,
                "Fan-out sub-fetches failed",
            );
            if self.policy == FanoutPolicy::Atomic {
                return Err(RealtimeError::PartialFanout {
                    attempted,
                    failures,
                });
            }
        }

        Ok(FanoutReport {
            attempted,
            snapshots,
            failures,
        })
    }

    async fn fetch_board(&self, tenant_id: TenantId) -> Result<Snapshot, RealtimeError> {
        let payload = self.query.cells(tenant_id).await?;
        let cells = parse_active_cells(tenant_id, payload)?;

        let keys = cells
            .iter()
            .map(|cell| SubscriptionKey::CellMetrics {
                tenant_id,
                cell_id: cell.id,
            })
            .collect();
        let mut report = self.fetch_all(keys).await?;

        Ok(Snapshot::CellBoard(CellBoard {
            cells: cells
                .into_iter()
                .map(|cell| board_cell(cell, tenant_id, &mut report.snapshots))
                .collect(),
            failures: report.failures,
        }))
    }
}

fn board_cell(
    cell: Cell,
    tenant_id: TenantId,
    snapshots: &mut BTreeMap<SubscriptionKey, Snapshot>,
) -> BoardCell {
    let key = SubscriptionKey::CellMetrics {
        tenant_id,
        cell_id: cell.id,
    };
    let metrics = match snapshots.remove(&key) {
        Some(Snapshot::CellMetrics(metrics)) => Some(metrics),
        _ => None,
    };
    BoardCell {
        cell,
        metrics,
        carried_over: false,
    }
}
