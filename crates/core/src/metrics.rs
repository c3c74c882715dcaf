//! Cell metric and capacity snapshots.
//!
//! Both are ephemeral values derived from operation records by the
//! platform's aggregation RPCs. The RPCs answer with untyped JSON; this
//! module is the schema those payloads must satisfy before they are cached.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{EntityId, TenantId, Timestamp};

/// Throughput and OEE-style figures for one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellMetricsSnapshot {
    pub cell_id: EntityId,
    pub tenant_id: TenantId,
    /// Operations currently in progress or queued at the cell.
    pub current_wip: u32,
    pub wip_limit: Option<u32>,
    pub in_progress_operations: u32,
    pub queued_operations: u32,
    pub completed_today: u32,
    /// Fractions in `0.0..=1.0`.
    pub availability: Option<f64>,
    pub performance: Option<f64>,
    pub quality: Option<f64>,
    pub computed_at: Timestamp,
}

impl CellMetricsSnapshot {
    /// Overall equipment effectiveness, when all three factors are known.
    pub fn oee(&self) -> Option<f64> {
        Some(self.availability? * self.performance? * self.quality?)
    }

    /// WIP as a fraction of the limit. `None` when the cell is unlimited.
    pub fn utilization(&self) -> Option<f64> {
        match self.wip_limit {
            Some(0) | None => None,
            Some(limit) => Some(f64::from(self.current_wip) / f64::from(limit)),
        }
    }

    /// Validate and convert a `compute_cell_metrics` payload.
    pub fn from_payload(
        cell_id: EntityId,
        tenant_id: TenantId,
        payload: serde_json::Value,
    ) -> Result<Self, CoreError> {
        let raw: RawCellMetrics = serde_json::from_value(payload)
            .map_err(|e| CoreError::malformed("cell metrics", e.to_string()))?;

        check_id("cell metrics", cell_id, raw.cell_id)?;
        for (label, value) in [
            ("availability", raw.availability),
            ("performance", raw.performance),
            ("quality", raw.quality),
        ] {
            check_fraction(label, value)?;
        }

        Ok(Self {
            cell_id,
            tenant_id,
            current_wip: raw.current_wip,
            wip_limit: raw.wip_limit,
            in_progress_operations: raw.in_progress_operations,
            queued_operations: raw.queued_operations,
            completed_today: raw.completed_today,
            availability: raw.availability,
            performance: raw.performance,
            quality: raw.quality,
            computed_at: chrono::Utc::now(),
        })
    }
}

/// Whether the cell after `cell_id` in the routing can accept more work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub cell_id: EntityId,
    pub tenant_id: TenantId,
    /// `None` when `cell_id` is the last cell in sequence.
    pub next_cell_id: Option<EntityId>,
    pub next_cell_name: Option<String>,
    pub current_wip: u32,
    pub wip_limit: Option<u32>,
    pub enforce_wip_limit: bool,
    pub has_capacity: bool,
    pub computed_at: Timestamp,
}

impl CapacitySnapshot {
    /// Remaining WIP slots at the next cell, if it is limited.
    pub fn remaining_capacity(&self) -> Option<u32> {
        self.wip_limit
            .map(|limit| limit.saturating_sub(self.current_wip))
    }

    /// Validate and convert a `compute_next_cell_capacity` payload.
    pub fn from_payload(
        cell_id: EntityId,
        tenant_id: TenantId,
        payload: serde_json::Value,
    ) -> Result<Self, CoreError> {
        let raw: RawCapacity = serde_json::from_value(payload)
            .map_err(|e| CoreError::malformed("cell capacity", e.to_string()))?;

        check_id("cell capacity", cell_id, raw.cell_id)?;
        if raw.next_cell_id == Some(cell_id) {
            return Err(CoreError::Validation(format!(
                "cell {cell_id} reported itself as its next cell"
            )));
        }

        Ok(Self {
            cell_id,
            tenant_id,
            next_cell_id: raw.next_cell_id,
            next_cell_name: raw.next_cell_name,
            current_wip: raw.current_wip,
            wip_limit: raw.wip_limit,
            enforce_wip_limit: raw.enforce_wip_limit,
            has_capacity: raw.has_capacity,
            computed_at: chrono::Utc::now(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawCellMetrics {
    #[serde(default)]
    cell_id: Option<EntityId>,
    current_wip: u32,
    #[serde(default)]
    wip_limit: Option<u32>,
    #[serde(default)]
    in_progress_operations: u32,
    #[serde(default)]
    queued_operations: u32,
    #[serde(default)]
    completed_today: u32,
    #[serde(default)]
    availability: Option<f64>,
    #[serde(default)]
    performance: Option<f64>,
    #[serde(default)]
    quality: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawCapacity {
    #[serde(default)]
    cell_id: Option<EntityId>,
    #[serde(default)]
    next_cell_id: Option<EntityId>,
    #[serde(default)]
    next_cell_name: Option<String>,
    #[serde(default)]
    current_wip: u32,
    #[serde(default)]
    wip_limit: Option<u32>,
    #[serde(default)]
    enforce_wip_limit: bool,
    has_capacity: bool,
}

fn check_id(entity: &'static str, expected: EntityId, actual: Option<EntityId>) -> Result<(), CoreError> {
    match actual {
        Some(actual) if actual != expected => Err(CoreError::IdMismatch {
            entity,
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

fn check_fraction(label: &str, value: Option<f64>) -> Result<(), CoreError> {
    match value {
        Some(v) if !(0.0..=1.0).contains(&v) => Err(CoreError::Validation(format!(
            "{label} must be within 0..=1, got {v}"
        ))),
        _ => Ok(()),
    }
}
