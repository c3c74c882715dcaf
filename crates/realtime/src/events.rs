//! Layer event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`RealtimeEventBus`] reports what the layer does with each key:
//! interests starting and stopping, snapshots landing, recomputes failing
//! and subscription channels degrading. Consumers that only care about one
//! key should watch its cache slot instead.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::key::SubscriptionKey;

// ---------------------------------------------------------------------------
// RealtimeEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RealtimeEventKind {
    /// First consumer registered interest in the key.
    InterestStarted,
    /// Last consumer released the key; its resources are gone.
    InterestStopped,
    /// A recompute result was written to the slot.
    SnapshotUpdated { generation: u64 },
    /// A recompute failed; the slot keeps its previous value.
    RecomputeFailed { generation: u64, error: String },
    /// The key's subscription channel reported itself unhealthy.
    ChannelDegraded { reason: String },
    /// The key's subscription channel is healthy again.
    ChannelRecovered,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeEvent {
    pub key: SubscriptionKey,
    #[serde(flatten)]
    pub kind: RealtimeEventKind,
    pub timestamp: DateTime<Utc>,
}

impl RealtimeEvent {
    pub fn new(key: SubscriptionKey, kind: RealtimeEventKind) -> Self {
        Self {
            key,
            kind,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// RealtimeEventBus
// ---------------------------------------------------------------------------

/// Fan-out bus for [`RealtimeEvent`]s.
///
/// When the buffer is full the oldest events are dropped and slow receivers
/// observe `RecvError::Lagged`.
pub struct RealtimeEventBus {
    sender: broadcast::Sender<RealtimeEvent>,
}

impl RealtimeEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped when there are none.
    pub fn publish(&self, key: &SubscriptionKey, kind: RealtimeEventKind) {
        let _ = self.sender.send(RealtimeEvent::new(key.clone(), kind));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.sender.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
