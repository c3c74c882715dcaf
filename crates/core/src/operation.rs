//! Operation records and their lifecycle status.
//!
//! An operation is one unit of work on a part, assigned to a cell. The
//! routing query returns operation rows with the owning cell and part
//! embedded; [`OperationRef`] is the narrowed view the grouping engine needs.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{EntityId, TenantId};

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    NotStarted,
    InProgress,
    Completed,
    OnHold,
}

impl OperationStatus {
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Cell columns embedded in an operation row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedCell {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub sequence: Option<i32>,
}

/// Part columns embedded in an operation row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedPart {
    #[serde(default)]
    pub job_id: Option<EntityId>,
}

/// A raw operation row as returned by the routing query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRow {
    pub id: EntityId,
    pub tenant_id: TenantId,
    /// Operations without a cell cannot be routed.
    #[serde(default)]
    pub cell_id: Option<EntityId>,
    pub part_id: EntityId,
    #[serde(default)]
    pub sequence: i32,
    pub status: OperationStatus,
    /// Estimated duration in minutes.
    #[serde(default)]
    pub estimated_time: Option<f64>,
    /// Actual duration in minutes.
    #[serde(default)]
    pub actual_time: Option<f64>,
    #[serde(default)]
    pub cell: Option<EmbeddedCell>,
    #[serde(default)]
    pub part: Option<EmbeddedPart>,
}

impl OperationRow {
    /// Job owning this operation's part, if the row embeds it.
    pub fn job_id(&self) -> Option<EntityId> {
        self.part.as_ref().and_then(|p| p.job_id)
    }
}

/// The fields of an operation the routing engine groups on.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRef {
    pub cell_id: Option<EntityId>,
    pub cell_name: Option<String>,
    pub cell_color: Option<String>,
    pub cell_sequence: Option<i32>,
    pub status: OperationStatus,
}

impl From<&OperationRow> for OperationRef {
    fn from(row: &OperationRow) -> Self {
        let cell = row.cell.clone().unwrap_or_default();
        Self {
            cell_id: row.cell_id,
            cell_name: cell.name,
            cell_color: cell.color,
            cell_sequence: cell.sequence,
            status: row.status,
        }
    }
}

/// Parse a JSON array of operation rows, rejecting rows outside `tenant_id`.
pub fn parse_operation_rows(
    tenant_id: TenantId,
    payload: serde_json::Value,
) -> Result<Vec<OperationRow>, CoreError> {
    let rows: Vec<OperationRow> = serde_json::from_value(payload)
        .map_err(|e| CoreError::malformed("operation", e.to_string()))?;

    if let Some(foreign) = rows.iter().find(|r| r.tenant_id != tenant_id) {
        return Err(CoreError::malformed(
            "operation",
            format!("row {} belongs to tenant {}", foreign.id, foreign.tenant_id),
        ));
    }

    for row in &rows {
        for (label, value) in [("estimated_time", row.estimated_time), ("actual_time", row.actual_time)] {
            if value.is_some_and(|v| !v.is_finite() || v < 0.0) {
                return Err(CoreError::malformed(
                    "operation",
                    format!("row {} has invalid {label}", row.id),
                ));
            }
        }
    }

    Ok(rows)
}
