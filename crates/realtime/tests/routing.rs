//! Routing keys end to end: rows from the query service, grouped per cell.

mod common;

use assert_matches::assert_matches;
use common::{harness, operation_moved, operation_row, settle, test_config};
use eryxon_realtime::ports::SourceEvent;
use eryxon_realtime::{
    ChangeKind, ChangeNotification, EntityType, SlotState, Snapshot, SubscriptionKey,
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Test: part routing groups operations per cell in sequence order
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn part_routing_groups_by_cell() {
    let h = harness(test_config());
    let tenant = Uuid::new_v4();
    let (part, job) = (Uuid::new_v4(), Uuid::new_v4());
    let (laser, bend) = (Uuid::new_v4(), Uuid::new_v4());

    h.query.set_operations(vec![
        operation_row(tenant, part, job, (bend, "Bending", 2), "not_started"),
        operation_row(tenant, part, job, (laser, "Laser", 1), "completed"),
        operation_row(tenant, part, job, (laser, "Laser", 1), "in_progress"),
        operation_row(tenant, Uuid::new_v4(), job, (laser, "Laser", 1), "completed"),
    ]);

    let key = SubscriptionKey::PartRouting {
        tenant_id: tenant,
        part_id: part,
    };
    let handle = h.manager.start_interest(key).await.unwrap();
    settle().await;

    let entry = handle.read();
    assert_eq!(entry.state, SlotState::Ready);
    let routing = entry.value.as_ref().and_then(Snapshot::as_routing).unwrap();
    assert_eq!(routing.len(), 2);
    assert_eq!(routing[0].cell_id, laser);
    assert_eq!(routing[0].operation_count, 2);
    assert_eq!(routing[0].completed_operations, 1);
    assert_eq!(routing[1].cell_name, "Bending");
    assert!(!routing[1].is_complete());

    handle.stop().await;
}

// ---------------------------------------------------------------------------
// Test: a part row moving to a watched job triggers a recompute
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn job_routing_follows_part_changes() {
    let h = harness(test_config());
    let tenant = Uuid::new_v4();
    let job = Uuid::new_v4();
    let key = SubscriptionKey::JobRouting {
        tenant_id: tenant,
        job_id: job,
    };

    let handle = h.manager.start_interest(key).await.unwrap();
    settle().await;
    assert_eq!(h.query.calls(), 1);
    assert_matches!(handle.read().value, Some(Snapshot::Routing(entries)) if entries.is_empty());

    let unrelated = Uuid::new_v4();
    let other_job = ChangeNotification::new(EntityType::Part, ChangeKind::Update)
        .with_field("job_id", unrelated.to_string())
        .with_old_field("job_id", unrelated.to_string());
    h.source.push(SourceEvent::Change(other_job));
    settle().await;
    assert_eq!(h.query.calls(), 1);

    let part = Uuid::new_v4();
    h.query.set_operations(vec![operation_row(
        tenant,
        part,
        job,
        (Uuid::new_v4(), "Welding", 3),
        "in_progress",
    )]);
    let moved = ChangeNotification::new(EntityType::Part, ChangeKind::Update)
        .with_id(part)
        .with_field("job_id", job.to_string());
    h.source.push(SourceEvent::Change(moved));
    settle().await;

    assert_eq!(h.query.calls(), 2);
    let entry = handle.read();
    let routing = entry.value.as_ref().and_then(Snapshot::as_routing).unwrap();
    assert_eq!(routing.len(), 1);
    assert_eq!(routing[0].cell_name, "Welding");

    handle.stop().await;
}

// ---------------------------------------------------------------------------
// Test: an operation moved to another part recomputes the part it left
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn operation_moved_away_recomputes_old_part() {
    let h = harness(test_config());
    let tenant = Uuid::new_v4();
    let (part, other_part, job) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let cell = (Uuid::new_v4(), "Laser", 1);

    h.query
        .set_operations(vec![operation_row(tenant, part, job, cell, "in_progress")]);
    let key = SubscriptionKey::PartRouting {
        tenant_id: tenant,
        part_id: part,
    };
    let handle = h.manager.start_interest(key).await.unwrap();
    settle().await;
    let before = handle.read();
    let routing = before.value.as_ref().and_then(Snapshot::as_routing);
    assert_eq!(routing.map(|entries| entries.len()), Some(1));

    h.query
        .set_operations(vec![operation_row(tenant, other_part, job, cell, "in_progress")]);
    h.source.push_change(operation_moved(part, other_part));
    settle().await;

    assert_eq!(h.query.calls(), 2);
    assert_matches!(handle.read().value, Some(Snapshot::Routing(entries)) if entries.is_empty());

    handle.stop().await;
}

// ---------------------------------------------------------------------------
// Test: a jobs key yields one routing per requested job
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn jobs_routing_keeps_every_requested_job() {
    let h = harness(test_config());
    let tenant = Uuid::new_v4();
    let (busy, idle) = (Uuid::new_v4(), Uuid::new_v4());
    let cell = (Uuid::new_v4(), "Laser", 1);

    h.query.set_operations(vec![
        operation_row(tenant, Uuid::new_v4(), busy, cell, "completed"),
        operation_row(tenant, Uuid::new_v4(), busy, cell, "completed"),
    ]);

    let key = SubscriptionKey::JobsRouting {
        tenant_id: tenant,
        job_ids: [busy, idle].into_iter().collect(),
    };
    let handle = h.manager.start_interest(key).await.unwrap();
    settle().await;

    let entry = handle.read();
    let Some(Snapshot::JobsRouting(jobs)) = &entry.value else {
        panic!("expected a jobs routing, got {:?}", entry.value);
    };
    assert_eq!(jobs.len(), 2);
    assert!(jobs[&idle].is_empty());
    assert_eq!(jobs[&busy].len(), 1);
    assert!(jobs[&busy][0].is_complete());

    handle.stop().await;
}

// ---------------------------------------------------------------------------
// Test: rows of another tenant are rejected as a transport error
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn foreign_tenant_rows_are_rejected() {
    let h = harness(test_config());
    let tenant = Uuid::new_v4();
    let part = Uuid::new_v4();

    h.query.set_operations(vec![operation_row(
        Uuid::new_v4(),
        part,
        Uuid::new_v4(),
        (Uuid::new_v4(), "Laser", 1),
        "completed",
    )]);

    let key = SubscriptionKey::PartRouting {
        tenant_id: tenant,
        part_id: part,
    };
    let handle = h.manager.start_interest(key).await.unwrap();
    settle().await;

    let entry = handle.read();
    assert_eq!(entry.state, SlotState::Failed);
    assert_matches!(
        entry.error,
        Some(eryxon_realtime::RealtimeError::Transport(msg)) if msg.contains("rejected payload")
    );

    handle.stop().await;
}
