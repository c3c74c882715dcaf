//! Interest lifecycle tests.
//!
//! Every test runs on a paused clock against the in-memory fakes, checking
//! that bindings open and close in pairs, that consumers of one key share
//! its resources, and that nothing is recomputed after the last consumer
//! leaves.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::{harness, operation_change, settle, test_config, WINDOW};
use eryxon_realtime::ports::SourceEvent;
use eryxon_realtime::{RealtimeError, RealtimeEventKind, SlotState, Snapshot, SubscriptionKey};
use uuid::Uuid;

fn metrics_key() -> SubscriptionKey {
    SubscriptionKey::CellMetrics {
        tenant_id: Uuid::new_v4(),
        cell_id: Uuid::new_v4(),
    }
}

fn wip(snapshot: Option<&Snapshot>) -> Option<u32> {
    match snapshot {
        Some(Snapshot::CellMetrics(metrics)) => Some(metrics.current_wip),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Test: start_interest opens one binding and recomputes immediately
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn start_interest_recomputes_immediately() {
    let h = harness(test_config());
    let key = metrics_key();

    let handle = h.manager.start_interest(key.clone()).await.unwrap();
    assert_eq!(h.source.subscribes(), 1);
    assert_eq!(handle.read().state, SlotState::Loading);

    settle().await;
    let entry = handle.read();
    assert_eq!(entry.state, SlotState::Ready);
    assert_eq!(wip(entry.value.as_ref()), Some(1));
    assert_eq!(h.rpc.calls(), 1);

    handle.stop().await;
}

// ---------------------------------------------------------------------------
// Test: the subscription is scoped to the key's tenant
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn subscription_is_filtered_by_tenant() {
    let h = harness(test_config());
    let key = metrics_key();

    let handle = h.manager.start_interest(key.clone()).await.unwrap();

    let requests = h.source.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].tenant_id, key.tenant_id());
    assert_eq!(
        requests[0].filter.expression(),
        format!("tenant_id=eq.{}", key.tenant_id())
    );

    handle.stop().await;
}

// ---------------------------------------------------------------------------
// Test: consumers of one key share one binding, timer and slot
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn consumers_of_one_key_share_resources() {
    let h = harness(test_config());
    let key = metrics_key();

    let first = h.manager.start_interest(key.clone()).await.unwrap();
    let second = h.manager.start_interest(key.clone()).await.unwrap();
    settle().await;

    assert_eq!(h.source.subscribes(), 1);
    assert_eq!(h.manager.consumer_count(&key).await, 2);
    assert_eq!(h.rpc.calls(), 1);
    assert_eq!(first.read(), second.read());

    first.stop().await;
    assert_eq!(h.source.unsubscribes(), 0);
    assert_eq!(second.read().state, SlotState::Ready);

    second.stop().await;
    assert_eq!(h.source.unsubscribes(), 1);
    assert_eq!(h.source.open(), 0);
    assert_eq!(h.manager.read(&key).state, SlotState::Empty);
    assert!(h.manager.active_keys().await.is_empty());
}

// ---------------------------------------------------------------------------
// Test: stopping with an armed timer never recomputes afterwards
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stop_cancels_armed_timer() {
    let h = harness(test_config());
    let key = metrics_key();

    let handle = h.manager.start_interest(key.clone()).await.unwrap();
    settle().await;
    assert_eq!(h.rpc.calls(), 1);

    h.source.push_change(operation_change(Uuid::new_v4()));
    tokio::time::sleep(WINDOW / 4).await;

    handle.stop().await;
    settle().await;

    assert_eq!(h.rpc.calls(), 1);
    assert_eq!(h.manager.read(&key).state, SlotState::Empty);
    assert_eq!(h.source.subscribes(), h.source.unsubscribes());
}

// ---------------------------------------------------------------------------
// Test: a burst of changes yields one recompute per quiet period
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn change_burst_is_coalesced() {
    let h = harness(test_config());
    let key = SubscriptionKey::CellBoard {
        tenant_id: Uuid::new_v4(),
    };
    let mut events = h.manager.subscribe_events();

    let handle = h.manager.start_interest(key.clone()).await.unwrap();
    settle().await;
    let initial = h.query.calls();
    assert_eq!(initial, 1);

    for _ in 0..30 {
        h.source.push_change(operation_change(Uuid::new_v4()));
        tokio::time::sleep(WINDOW / 4).await;
    }
    assert_eq!(h.query.calls(), initial);

    settle().await;
    assert_eq!(h.query.calls(), initial + 1);

    let mut updates = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event.kind, RealtimeEventKind::SnapshotUpdated { .. }) {
            updates += 1;
        }
    }
    assert_eq!(updates, 2);

    handle.stop().await;
}

// ---------------------------------------------------------------------------
// Test: irrelevant changes do not arm the timer
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn irrelevant_changes_are_ignored() {
    let h = harness(test_config());
    let part = Uuid::new_v4();
    let key = SubscriptionKey::PartRouting {
        tenant_id: Uuid::new_v4(),
        part_id: part,
    };

    let handle = h.manager.start_interest(key.clone()).await.unwrap();
    settle().await;
    assert_eq!(h.query.calls(), 1);

    h.source.push_change(operation_change(Uuid::new_v4()));
    settle().await;
    assert_eq!(h.query.calls(), 1);

    h.source.push_change(operation_change(part));
    settle().await;
    assert_eq!(h.query.calls(), 2);

    handle.stop().await;
}

// ---------------------------------------------------------------------------
// Test: failure to subscribe leaves nothing behind
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn failed_subscribe_is_a_transport_error() {
    let h = harness(test_config());
    let key = metrics_key();
    h.source.fail_next_subscribe();

    let result = h.manager.start_interest(key.clone()).await;
    assert_matches!(result, Err(RealtimeError::Transport(_)));
    assert_eq!(h.source.open(), 0);
    assert_eq!(h.manager.read(&key).state, SlotState::Empty);
    assert_eq!(h.manager.consumer_count(&key).await, 0);

    // A later attempt starts cleanly.
    let handle = h.manager.start_interest(key.clone()).await.unwrap();
    assert_eq!(h.source.subscribes(), 1);
    handle.stop().await;
    assert_eq!(h.source.unsubscribes(), 1);
}

// ---------------------------------------------------------------------------
// Test: recompute failures keep the last value and are not retried
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn recompute_failure_keeps_previous_value() {
    let h = harness(test_config());
    let key = metrics_key();

    let handle = h.manager.start_interest(key.clone()).await.unwrap();
    settle().await;

    h.rpc.set_down(true);
    handle.refetch().await.unwrap();
    settle().await;

    let entry = handle.read();
    assert_eq!(entry.state, SlotState::Failed);
    assert_eq!(wip(entry.value.as_ref()), Some(1));
    assert_matches!(entry.error, Some(RealtimeError::Transport(_)));

    // Nothing loops on the failure by itself.
    settle().await;
    assert_eq!(h.rpc.calls(), 2);

    h.rpc.set_down(false);
    handle.refetch().await.unwrap();
    settle().await;
    let entry = handle.read();
    assert_eq!(entry.state, SlotState::Ready);
    assert_eq!(entry.error, None);
    assert_eq!(wip(entry.value.as_ref()), Some(3));

    handle.stop().await;
}

// ---------------------------------------------------------------------------
// Test: channel errors degrade the slot; recovery clears it and recomputes
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn channel_error_and_recovery() {
    let h = harness(test_config());
    let key = metrics_key();

    let handle = h.manager.start_interest(key.clone()).await.unwrap();
    settle().await;

    h.source.push(SourceEvent::ChannelError("socket closed".into()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    let entry = handle.read();
    assert_eq!(entry.channel_error.as_deref(), Some("socket closed"));
    assert_eq!(entry.state, SlotState::Ready);

    h.source.push(SourceEvent::ChannelRecovered);
    settle().await;
    let entry = handle.read();
    assert!(!entry.is_degraded());
    assert_eq!(h.rpc.calls(), 2);

    handle.stop().await;
    assert_eq!(h.source.subscribes(), h.source.unsubscribes());
}

// ---------------------------------------------------------------------------
// Test: dropping a handle releases the key in the background
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn dropped_handle_is_released() {
    let h = harness(test_config());
    let key = metrics_key();

    let handle = h.manager.start_interest(key.clone()).await.unwrap();
    drop(handle);
    settle().await;

    assert_eq!(h.source.unsubscribes(), 1);
    assert_eq!(h.manager.consumer_count(&key).await, 0);
}

// ---------------------------------------------------------------------------
// Test: refetch on an unwatched key is rejected
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn refetch_requires_interest() {
    let h = harness(test_config());
    let key = metrics_key();

    assert_matches!(
        h.manager.refetch(&key).await,
        Err(RealtimeError::NotWatched(k)) if k == key
    );
}

// ---------------------------------------------------------------------------
// Test: changed() follows the slot until it is discarded
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn changed_reports_updates() {
    let h = harness(test_config());
    let key = SubscriptionKey::NextCellCapacity {
        tenant_id: Uuid::new_v4(),
        cell_id: Uuid::new_v4(),
    };

    let mut handle = h.manager.start_interest(key.clone()).await.unwrap();
    let entry = loop {
        let entry = handle.changed().await.unwrap();
        if entry.state == SlotState::Ready {
            break entry;
        }
    };
    assert_matches!(entry.value, Some(Snapshot::Capacity(capacity)) if capacity.has_capacity);

    h.manager.shutdown().await;
    assert_matches!(handle.changed().await, Err(RealtimeError::NotWatched(_)));
    assert_eq!(h.source.open(), 0);

    // Stopping after shutdown is a no-op.
    handle.stop().await;
    assert_eq!(h.source.unsubscribes(), 1);
}

// ---------------------------------------------------------------------------
// Test: a handle outliving shutdown cannot release a later interest
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn handle_from_before_shutdown_leaves_new_interest_alone() {
    let h = harness(test_config());
    let key = metrics_key();

    let old = h.manager.start_interest(key.clone()).await.unwrap();
    h.manager.shutdown().await;

    let fresh = h.manager.start_interest(key.clone()).await.unwrap();
    settle().await;
    assert_eq!(h.manager.consumer_count(&key).await, 1);
    assert_eq!(fresh.read().state, SlotState::Ready);

    old.stop().await;
    assert_eq!(h.manager.consumer_count(&key).await, 1);
    assert_eq!(h.source.open(), 1);
    assert_eq!(h.manager.read(&key).state, SlotState::Ready);

    fresh.stop().await;
    assert_eq!(h.manager.consumer_count(&key).await, 0);
    assert_eq!(h.source.open(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_handle_from_before_shutdown_is_ignored() {
    let h = harness(test_config());
    let key = metrics_key();

    let old = h.manager.start_interest(key.clone()).await.unwrap();
    h.manager.shutdown().await;
    let fresh = h.manager.start_interest(key.clone()).await.unwrap();

    drop(old);
    settle().await;
    assert_eq!(h.manager.consumer_count(&key).await, 1);
    assert_eq!(h.source.open(), 1);
    assert_eq!(fresh.read().state, SlotState::Ready);

    fresh.stop().await;
    assert_eq!(h.source.open(), 0);
}
