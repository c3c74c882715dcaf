//! Manufacturing cells (work centres).
//!
//! Cells are owned elsewhere; this layer only reads them to know which
//! entities a tenant-wide view has to fan out over.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{EntityId, TenantId};

/// A manufacturing cell as returned by the platform's `cells` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: EntityId,
    pub tenant_id: TenantId,
    pub name: String,
    /// Display sequence; defines the stable left-to-right ordering of cells.
    pub sequence: i32,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub color: Option<String>,
}

fn default_active() -> bool {
    true
}

/// Parse a JSON array of cell rows, keeping only active cells of `tenant_id`.
///
/// The result is ordered by sequence, then id, so fan-out over the returned
/// cells is deterministic.
pub fn parse_active_cells(
    tenant_id: TenantId,
    payload: serde_json::Value,
) -> Result<Vec<Cell>, CoreError> {
    let cells: Vec<Cell> =
        serde_json::from_value(payload).map_err(|e| CoreError::malformed("cell", e.to_string()))?;

    let mut active: Vec<Cell> = cells
        .into_iter()
        .filter(|c| c.active && c.tenant_id == tenant_id)
        .collect();
    active.sort_by(|a, b| a.sequence.cmp(&b.sequence).then(a.id.cmp(&b.id)));
    Ok(active)
}
