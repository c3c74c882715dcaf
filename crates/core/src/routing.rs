//! Routing/grouping engine.
//!
//! Pure logic: turns a flat sequence of operations into the ordered list of
//! cells they pass through, with per-cell operation and completion counts.
//! The same engine serves the routing of one part, one job and a fixed set
//! of jobs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::operation::{OperationRef, OperationRow};
use crate::types::EntityId;

/// One cell on a routing, with the operations grouped into it.
///
/// `completed_operations <= operation_count` always holds, and an entry only
/// exists for a cell with at least one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub cell_id: EntityId,
    pub cell_name: String,
    pub cell_color: Option<String>,
    pub cell_sequence: Option<i32>,
    pub operation_count: u32,
    pub completed_operations: u32,
}

impl RoutingEntry {
    /// Whether every operation grouped into this cell is completed.
    pub fn is_complete(&self) -> bool {
        self.completed_operations == self.operation_count
    }
}

/// Accumulator for a single cell while grouping.
struct CellTally {
    name: Option<String>,
    color: Option<String>,
    sequence: Option<i32>,
    operation_count: u32,
    completed_operations: u32,
}

/// Group operations by cell and return entries ordered by cell sequence.
///
/// Operations without a cell id are skipped. A cell whose name is absent is
/// labelled with `unknown_label`; display localisation belongs to the caller.
/// Ordering is ascending by sequence (cells without a sequence last), ties
/// broken by cell id. Rows of one cell that disagree on its columns (a cell
/// renamed mid-fetch) resolve to the smallest value of each, so the output
/// does not depend on input order.
pub fn group_by_cell<'a, I>(operations: I, unknown_label: &str) -> Vec<RoutingEntry>
where
    I: IntoIterator<Item = &'a OperationRef>,
{
    let mut tallies: HashMap<EntityId, CellTally> = HashMap::new();

    for op in operations {
        let Some(cell_id) = op.cell_id else {
            continue;
        };

        let tally = tallies.entry(cell_id).or_insert_with(|| CellTally {
            name: None,
            color: None,
            sequence: None,
            operation_count: 0,
            completed_operations: 0,
        });

        keep_smallest(&mut tally.name, &op.cell_name);
        keep_smallest(&mut tally.color, &op.cell_color);
        keep_smallest(&mut tally.sequence, &op.cell_sequence);

        tally.operation_count += 1;
        if op.status.is_completed() {
            tally.completed_operations += 1;
        }
    }

    let mut entries: Vec<RoutingEntry> = tallies
        .into_iter()
        .map(|(cell_id, tally)| RoutingEntry {
            cell_id,
            cell_name: tally.name.unwrap_or_else(|| unknown_label.to_string()),
            cell_color: tally.color,
            cell_sequence: tally.sequence,
            operation_count: tally.operation_count,
            completed_operations: tally.completed_operations,
        })
        .collect();

    entries.sort_by(|a, b| {
        sequence_order(a.cell_sequence)
            .cmp(&sequence_order(b.cell_sequence))
            .then(a.cell_id.cmp(&b.cell_id))
    });
    entries
}

/// Take `candidate` when the slot is empty or holds a larger value.
fn keep_smallest<T: Ord + Clone>(slot: &mut Option<T>, candidate: &Option<T>) {
    if let Some(value) = candidate {
        if slot.as_ref().map_or(true, |current| value < current) {
            *slot = Some(value.clone());
        }
    }
}

/// Sort key placing cells without a sequence after every sequenced cell.
fn sequence_order(sequence: Option<i32>) -> (bool, i32) {
    match sequence {
        Some(s) => (false, s),
        None => (true, 0),
    }
}

/// Group raw operation rows of a single part or job.
pub fn route_rows(rows: &[OperationRow], unknown_label: &str) -> Vec<RoutingEntry> {
    let refs: Vec<OperationRef> = rows.iter().map(OperationRef::from).collect();
    group_by_cell(&refs, unknown_label)
}

/// Group operation rows of several jobs, one routing per job.
///
/// Every job in `job_ids` is present in the result, with an empty routing if
/// it has no operations. Rows belonging to other jobs, or not carrying a job
/// id, are ignored.
pub fn route_jobs(
    rows: &[OperationRow],
    job_ids: &BTreeSet<EntityId>,
    unknown_label: &str,
) -> BTreeMap<EntityId, Vec<RoutingEntry>> {
    let mut per_job: BTreeMap<EntityId, Vec<OperationRef>> =
        job_ids.iter().map(|id| (*id, Vec::new())).collect();

    for row in rows {
        if let Some(ops) = row.job_id().and_then(|job| per_job.get_mut(&job)) {
            ops.push(OperationRef::from(row));
        }
    }

    per_job
        .into_iter()
        .map(|(job, ops)| (job, group_by_cell(&ops, unknown_label)))
        .collect()
}
