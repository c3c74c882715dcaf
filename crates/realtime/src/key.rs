//! Subscription keys and change notifications.
//!
//! A [`SubscriptionKey`] names what a consumer is watching. Each live key
//! owns exactly one event source binding, one debounce timer and one cache
//! slot, shared by every consumer of that key.

use std::collections::BTreeSet;
use std::fmt;

use eryxon_core::types::{EntityId, TenantId};
use serde::{Deserialize, Serialize};

/// What a consumer is watching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubscriptionKey {
    /// Throughput figures of a single cell.
    CellMetrics { tenant_id: TenantId, cell_id: EntityId },
    /// Capacity of the cell following `cell_id`.
    NextCellCapacity { tenant_id: TenantId, cell_id: EntityId },
    /// Metrics of every active cell of the tenant (fan-out).
    CellBoard { tenant_id: TenantId },
    /// Routing of one part.
    PartRouting { tenant_id: TenantId, part_id: EntityId },
    /// Routing of one job.
    JobRouting { tenant_id: TenantId, job_id: EntityId },
    /// Routing of a fixed set of jobs, one routing per job.
    JobsRouting {
        tenant_id: TenantId,
        job_ids: BTreeSet<EntityId>,
    },
}

/// Coarse classification of keys, used to pick a debounce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    CellMetrics,
    Capacity,
    CellBoard,
    Routing,
}

impl SubscriptionKey {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            Self::CellMetrics { tenant_id, .. }
            | Self::NextCellCapacity { tenant_id, .. }
            | Self::CellBoard { tenant_id }
            | Self::PartRouting { tenant_id, .. }
            | Self::JobRouting { tenant_id, .. }
            | Self::JobsRouting { tenant_id, .. } => *tenant_id,
        }
    }

    pub fn kind(&self) -> KeyKind {
        match self {
            Self::CellMetrics { .. } => KeyKind::CellMetrics,
            Self::NextCellCapacity { .. } => KeyKind::Capacity,
            Self::CellBoard { .. } => KeyKind::CellBoard,
            Self::PartRouting { .. } | Self::JobRouting { .. } | Self::JobsRouting { .. } => {
                KeyKind::Routing
            }
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CellMetrics { tenant_id, cell_id } => {
                write!(f, "cell_metrics:{tenant_id}/{cell_id}")
            }
            Self::NextCellCapacity { tenant_id, cell_id } => {
                write!(f, "next_cell_capacity:{tenant_id}/{cell_id}")
            }
            Self::CellBoard { tenant_id } => write!(f, "cell_board:{tenant_id}"),
            Self::PartRouting { tenant_id, part_id } => {
                write!(f, "part_routing:{tenant_id}/{part_id}")
            }
            Self::JobRouting { tenant_id, job_id } => {
                write!(f, "job_routing:{tenant_id}/{job_id}")
            }
            Self::JobsRouting { tenant_id, job_ids } => {
                write!(f, "jobs_routing:{tenant_id}/[{} jobs]", job_ids.len())
            }
        }
    }
}

/// Platform tables whose changes this layer listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Cell,
    Operation,
    Part,
    Job,
    TimeEntry,
}

impl EntityType {
    /// Backing table name on the platform.
    pub fn table(self) -> &'static str {
        match self {
            Self::Cell => "cells",
            Self::Operation => "operations",
            Self::Part => "parts",
            Self::Job => "jobs",
            Self::TimeEntry => "time_entries",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        match table {
            "cells" => Some(Self::Cell),
            "operations" => Some(Self::Operation),
            "parts" => Some(Self::Part),
            "jobs" => Some(Self::Job),
            "time_entries" => Some(Self::TimeEntry),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single row-level change reported by the event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub entity_type: EntityType,
    pub entity_id: Option<EntityId>,
    pub change_kind: ChangeKind,
    /// Row columns as reported: the new row for inserts and updates, the
    /// old row (often only its primary key) for deletes.
    #[serde(default)]
    pub record: serde_json::Map<String, serde_json::Value>,
    /// Previous column values of an update, as far as the source reports
    /// them. Often only the primary key.
    #[serde(default)]
    pub old_record: serde_json::Map<String, serde_json::Value>,
}

impl ChangeNotification {
    pub fn new(entity_type: EntityType, change_kind: ChangeKind) -> Self {
        Self {
            entity_type,
            entity_id: None,
            change_kind,
            record: serde_json::Map::new(),
            old_record: serde_json::Map::new(),
        }
    }

    pub fn with_id(mut self, id: EntityId) -> Self {
        self.entity_id = Some(id);
        self
    }

    /// Set a column on the carried record.
    pub fn with_field(mut self, column: &str, value: impl Into<serde_json::Value>) -> Self {
        self.record.insert(column.to_string(), value.into());
        self
    }

    /// Set a column on the previous values of an update.
    pub fn with_old_field(mut self, column: &str, value: impl Into<serde_json::Value>) -> Self {
        self.old_record.insert(column.to_string(), value.into());
        self
    }

    /// Read a UUID column from the carried record.
    ///
    /// Returns `None` when the column is absent, null or not a UUID.
    pub fn id_field(&self, column: &str) -> Option<EntityId> {
        uuid_column(&self.record, column)
    }

    /// Read a UUID column from the previous values of an update.
    pub fn old_id_field(&self, column: &str) -> Option<EntityId> {
        uuid_column(&self.old_record, column)
    }
}

fn uuid_column(
    record: &serde_json::Map<String, serde_json::Value>,
    column: &str,
) -> Option<EntityId> {
    record
        .get(column)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn keys_of_one_kind_share_a_window_class() {
        let tenant = Uuid::new_v4();
        let part = SubscriptionKey::PartRouting {
            tenant_id: tenant,
            part_id: Uuid::new_v4(),
        };
        let jobs = SubscriptionKey::JobsRouting {
            tenant_id: tenant,
            job_ids: BTreeSet::new(),
        };
        assert_eq!(part.kind(), KeyKind::Routing);
        assert_eq!(jobs.kind(), KeyKind::Routing);
        assert_eq!(jobs.tenant_id(), tenant);
    }

    #[test]
    fn job_sets_compare_by_content() {
        let tenant = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let first = SubscriptionKey::JobsRouting {
            tenant_id: tenant,
            job_ids: [a, b].into_iter().collect(),
        };
        let second = SubscriptionKey::JobsRouting {
            tenant_id: tenant,
            job_ids: [b, a].into_iter().collect(),
        };
        assert_eq!(first, second);
    }

    #[test]
    fn table_names_round_trip() {
        for entity in [
            EntityType::Cell,
            EntityType::Operation,
            EntityType::Part,
            EntityType::Job,
            EntityType::TimeEntry,
        ] {
            assert_eq!(EntityType::from_table(entity.table()), Some(entity));
        }
        assert_eq!(EntityType::from_table("users"), None);
    }

    #[test]
    fn id_field_ignores_non_uuid_values() {
        let part = Uuid::new_v4();
        let change = ChangeNotification::new(EntityType::Operation, ChangeKind::Update)
            .with_field("part_id", part.to_string())
            .with_field("sequence", 3);
        assert_eq!(change.id_field("part_id"), Some(part));
        assert_eq!(change.id_field("sequence"), None);
        assert_eq!(change.id_field("cell_id"), None);
    }
}
