//! Which keys the monitor watches.

use std::collections::BTreeSet;

use eryxon_core::types::{EntityId, TenantId};
use eryxon_realtime::SubscriptionKey;

/// Keys selected through the environment.
///
/// | Env Var            | Default  |
/// |--------------------|----------|
/// | `TENANT_ID`        | required |
/// | `WATCH_CELL_IDS`   | empty    |
/// | `WATCH_PART_ID`    | unset    |
/// | `WATCH_JOB_IDS`    | empty    |
///
/// The tenant's cell board is always watched. Each listed cell adds its
/// metrics and next-cell capacity; a part adds its routing; the job list
/// adds one multi-job routing key.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargets {
    pub tenant_id: TenantId,
    pub cell_ids: Vec<EntityId>,
    pub part_id: Option<EntityId>,
    pub job_ids: BTreeSet<EntityId>,
}

impl WatchTargets {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let tenant_id = lookup("TENANT_ID")
            .ok_or_else(|| anyhow::anyhow!("TENANT_ID must be set"))?
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("TENANT_ID is not a UUID: {e}"))?;

        let part_id = match lookup("WATCH_PART_ID").filter(|v| !v.trim().is_empty()) {
            Some(raw) => Some(parse_id("WATCH_PART_ID", &raw)?),
            None => None,
        };

        Ok(Self {
            tenant_id,
            cell_ids: parse_list(&lookup, "WATCH_CELL_IDS")?,
            part_id,
            job_ids: parse_list(&lookup, "WATCH_JOB_IDS")?.into_iter().collect(),
        })
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        let tenant_id = self.tenant_id;
        let mut keys = vec![SubscriptionKey::CellBoard { tenant_id }];
        for &cell_id in &self.cell_ids {
            keys.push(SubscriptionKey::CellMetrics { tenant_id, cell_id });
            keys.push(SubscriptionKey::NextCellCapacity { tenant_id, cell_id });
        }
        if let Some(part_id) = self.part_id {
            keys.push(SubscriptionKey::PartRouting { tenant_id, part_id });
        }
        match self.job_ids.len() {
            0 => {}
            1 => keys.extend(self.job_ids.iter().map(|&job_id| SubscriptionKey::JobRouting {
                tenant_id,
                job_id,
            })),
            _ => keys.push(SubscriptionKey::JobsRouting {
                tenant_id,
                job_ids: self.job_ids.clone(),
            }),
        }
        keys
    }
}

fn parse_id(name: &str, raw: &str) -> anyhow::Result<EntityId> {
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{name} contains an invalid UUID '{raw}': {e}"))
}

/// Comma-separated UUIDs. Blank entries are skipped.
fn parse_list(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> anyhow::Result<Vec<EntityId>> {
    let Some(raw) = lookup(name) else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_id(name, s))
        .collect()
}
