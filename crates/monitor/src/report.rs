//! One-line summaries of cached snapshots for the log.

use eryxon_realtime::snapshot::Snapshot;
use eryxon_realtime::CacheEntry;

pub fn summarize(snapshot: &Snapshot) -> String {
    match snapshot {
        Snapshot::CellMetrics(m) => match m.wip_limit {
            Some(limit) => format!("wip {}/{limit}, {} done today", m.current_wip, m.completed_today),
            None => format!("wip {}, {} done today", m.current_wip, m.completed_today),
        },
        Snapshot::Capacity(c) => {
            let next = c.next_cell_name.as_deref().unwrap_or("last cell");
            let verdict = if c.has_capacity { "has capacity" } else { "full" };
            format!("next: {next} ({verdict})")
        }
        Snapshot::CellBoard(board) => {
            let wip: u32 = board
                .cells
                .iter()
                .filter_map(|c| c.metrics.as_ref())
                .map(|m| m.current_wip)
                .sum();
            format!(
                "{} cells, total wip {wip}, {} failed",
                board.cells.len(),
                board.failures.len()
            )
        }
        Snapshot::Routing(entries) => routing_line(entries),
        Snapshot::JobsRouting(jobs) => {
            let operations: u32 = jobs.values().flatten().map(|e| e.operation_count).sum();
            format!("{} jobs, {operations} operations", jobs.len())
        }
    }
}

fn routing_line(entries: &[eryxon_core::routing::RoutingEntry]) -> String {
    if entries.is_empty() {
        return "no operations".into();
    }
    entries
        .iter()
        .map(|e| format!("{} {}/{}", e.cell_name, e.completed_operations, e.operation_count))
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Log the current state of a slot after it changed.
pub fn log_entry(key: &impl std::fmt::Display, entry: &CacheEntry) {
    let summary = entry.value.as_ref().map(summarize);
    match (&entry.error, &entry.channel_error) {
        (_, Some(channel)) => tracing::warn!(
            key = %key,
            generation = entry.generation,
            channel_error = %channel,
            summary = summary.as_deref().unwrap_or("-"),
            "Snapshot may be stale",
        ),
        (Some(error), None) => tracing::warn!(
            key = %key,
            generation = entry.generation,
            error = %error,
            summary = summary.as_deref().unwrap_or("-"),
            "Snapshot has errors",
        ),
        (None, None) => tracing::info!(
            key = %key,
            generation = entry.generation,
            loading = entry.is_loading,
            summary = summary.as_deref().unwrap_or("-"),
            "Snapshot",
        ),
    }
}
