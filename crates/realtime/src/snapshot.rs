//! Computed values held in cache slots.

use std::collections::BTreeMap;

use eryxon_core::cell::Cell;
use eryxon_core::metrics::{CapacitySnapshot, CellMetricsSnapshot};
use eryxon_core::routing::RoutingEntry;
use eryxon_core::types::EntityId;
use serde::Serialize;

use crate::error::{KeyFailure, RealtimeError};

/// The value produced by one recompute of a subscription key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Snapshot {
    CellMetrics(CellMetricsSnapshot),
    Capacity(CapacitySnapshot),
    CellBoard(CellBoard),
    Routing(Vec<RoutingEntry>),
    JobsRouting(BTreeMap<EntityId, Vec<RoutingEntry>>),
}

impl Snapshot {
    /// The partial-failure error carried by a board snapshot, if any.
    pub fn fanout_error(&self) -> Option<RealtimeError> {
        match self {
            Self::CellBoard(board) if !board.failures.is_empty() => {
                Some(RealtimeError::PartialFanout {
                    attempted: board.cells.len(),
                    failures: board.failures.clone(),
                })
            }
            _ => None,
        }
    }

    pub fn as_board(&self) -> Option<&CellBoard> {
        match self {
            Self::CellBoard(board) => Some(board),
            _ => None,
        }
    }

    pub fn as_routing(&self) -> Option<&[RoutingEntry]> {
        match self {
            Self::Routing(entries) => Some(entries),
            _ => None,
        }
    }
}

/// Metrics of every active cell of a tenant, in cell sequence order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellBoard {
    pub cells: Vec<BoardCell>,
    /// Cells whose sub-fetch failed in the recompute that built this board.
    pub failures: Vec<KeyFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardCell {
    pub cell: Cell,
    /// `None` when the sub-fetch failed and no earlier value exists.
    pub metrics: Option<CellMetricsSnapshot>,
    /// The metrics are from an earlier recompute because this one failed.
    pub carried_over: bool,
}

impl CellBoard {
    /// Fill cells that failed in this recompute with the metrics the
    /// previous board held for them.
    pub fn carry_over_from(&mut self, previous: &CellBoard) {
        for entry in self.cells.iter_mut().filter(|c| c.metrics.is_none()) {
            let earlier = previous
                .cells
                .iter()
                .find(|p| p.cell.id == entry.cell.id)
                .and_then(|p| p.metrics.clone());
            if let Some(metrics) = earlier {
                entry.metrics = Some(metrics);
                entry.carried_over = true;
            }
        }
    }

    pub fn metrics_for(&self, cell_id: EntityId) -> Option<&CellMetricsSnapshot> {
        self.cells
            .iter()
            .find(|c| c.cell.id == cell_id)
            .and_then(|c| c.metrics.as_ref())
    }
}
