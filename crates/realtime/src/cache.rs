//! Snapshot cache.
//!
//! One slot per live subscription key holding the last-known snapshot, a
//! loading flag and the last error. The cache is the only mutator of slot
//! state. Concurrent recomputes for one key are ordered by generation: a
//! result is applied only if its generation is the latest one dispatched
//! for that slot.
//!
//! Generations come from one counter shared by every slot, so a slot that
//! is destroyed and recreated can never accept a result dispatched for its
//! previous incarnation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use eryxon_core::types::Timestamp;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::RealtimeError;
use crate::key::SubscriptionKey;
use crate::snapshot::Snapshot;

/// Lifecycle of one slot.
///
/// `Empty -> Loading -> Ready | Failed`, and `Ready | Failed -> Loading` on
/// every later recompute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    #[default]
    Empty,
    Loading,
    Ready,
    Failed,
}

/// What a consumer reads for a key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheEntry {
    /// Last successfully computed snapshot. Survives later failures.
    pub value: Option<Snapshot>,
    pub is_loading: bool,
    /// Error of the last recompute, or the partial-failure report of a
    /// board that was otherwise applied.
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<RealtimeError>,
    /// Set while the key's subscription channel is degraded.
    pub channel_error: Option<String>,
    pub state: SlotState,
    /// Generation of the applied result. `0` before the first one.
    pub generation: u64,
    pub updated_at: Option<Timestamp>,
}

impl CacheEntry {
    /// Whether live updates may currently be missed for this key.
    pub fn is_degraded(&self) -> bool {
        self.channel_error.is_some()
    }
}

/// Result of offering a recompute result to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// A newer generation was dispatched; the result was dropped.
    Stale,
    /// The slot no longer exists.
    SlotGone,
}

struct Slot {
    /// Latest generation dispatched for this slot.
    dispatched: u64,
    tx: watch::Sender<CacheEntry>,
}

impl Slot {
    fn new(generation: u64) -> Self {
        let (tx, _) = watch::channel(CacheEntry::default());
        Self {
            dispatched: generation,
            tx,
        }
    }
}

pub struct SnapshotCache {
    slots: Mutex<HashMap<SubscriptionKey, Slot>>,
    generations: AtomicU64,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty slot. Returns `false` if one already exists.
    pub fn create(&self, key: &SubscriptionKey) -> bool {
        let mut slots = self.slots();
        if slots.contains_key(key) {
            return false;
        }
        let generation = self.next_generation();
        slots.insert(key.clone(), Slot::new(generation));
        true
    }

    /// Discard a slot. Results still in flight for it become
    /// [`ApplyOutcome::SlotGone`].
    pub fn destroy(&self, key: &SubscriptionKey) -> bool {
        self.slots().remove(key).is_some()
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.slots().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Current state of a key. A key without a slot reads as `Empty`.
    pub fn read(&self, key: &SubscriptionKey) -> CacheEntry {
        self.slots()
            .get(key)
            .map(|slot| slot.tx.borrow().clone())
            .unwrap_or_default()
    }

    /// Receiver notified on every change to the key's entry.
    pub fn watch(&self, key: &SubscriptionKey) -> Option<watch::Receiver<CacheEntry>> {
        self.slots().get(key).map(|slot| slot.tx.subscribe())
    }

    /// Dispatch a recompute: bind a new generation and enter `Loading`.
    ///
    /// The previous value and error stay readable while loading. Returns
    /// `None` when the key has no slot.
    pub fn begin(&self, key: &SubscriptionKey) -> Option<u64> {
        let mut slots = self.slots();
        let slot = slots.get_mut(key)?;

        let generation = self.next_generation();
        slot.dispatched = generation;
        slot.tx.send_modify(|entry| {
            entry.is_loading = true;
            entry.state = SlotState::Loading;
        });
        Some(generation)
    }

    /// Offer the result of the recompute dispatched as `generation`.
    pub fn apply(
        &self,
        key: &SubscriptionKey,
        generation: u64,
        result: Result<Snapshot, RealtimeError>,
    ) -> ApplyOutcome {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(key) else {
            tracing::debug!(key = %key, generation, "Discarding result for destroyed slot");
            return ApplyOutcome::SlotGone;
        };

        if generation != slot.dispatched {
            tracing::debug!(
                key = %key,
                generation,
                latest = slot.dispatched,
                "Discarding stale result",
            );
            return ApplyOutcome::Stale;
        }

        slot.tx.send_modify(|entry| settle(entry, generation, result));
        ApplyOutcome::Applied
    }

    /// Write a result directly, as a recompute that completed immediately.
    pub fn write(
        &self,
        key: &SubscriptionKey,
        result: Result<Snapshot, RealtimeError>,
    ) -> ApplyOutcome {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(key) else {
            return ApplyOutcome::SlotGone;
        };

        let generation = self.next_generation();
        slot.dispatched = generation;
        slot.tx.send_modify(|entry| settle(entry, generation, result));
        ApplyOutcome::Applied
    }

    /// Reset a slot to `Empty` and drop every result in flight for it.
    pub fn invalidate(&self, key: &SubscriptionKey) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(key) else {
            return false;
        };

        slot.dispatched = self.next_generation();
        slot.tx.send_modify(|entry| {
            let channel_error = entry.channel_error.take();
            *entry = CacheEntry {
                channel_error,
                ..CacheEntry::default()
            };
        });
        true
    }

    /// Flag the key's subscription channel as degraded.
    pub fn mark_channel_error(&self, key: &SubscriptionKey, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.slots()
            .get(key)
            .map(|slot| slot.tx.send_modify(|entry| entry.channel_error = Some(reason)))
            .is_some()
    }

    /// Clear the degraded flag. Returns whether it was set.
    pub fn clear_channel_error(&self, key: &SubscriptionKey) -> bool {
        self.slots()
            .get(key)
            .is_some_and(|slot| slot.tx.send_if_modified(|entry| entry.channel_error.take().is_some()))
    }
}

fn settle(entry: &mut CacheEntry, generation: u64, result: Result<Snapshot, RealtimeError>) {
    match result {
        Ok(mut snapshot) => {
            if let (Snapshot::CellBoard(board), Some(Snapshot::CellBoard(previous))) =
                (&mut snapshot, &entry.value)
            {
                board.carry_over_from(previous);
            }
            entry.error = snapshot.fanout_error();
            entry.value = Some(snapshot);
            entry.state = SlotState::Ready;
        }
        Err(e) => {
            entry.error = Some(e);
            entry.state = SlotState::Failed;
        }
    }
    entry.is_loading = false;
    entry.generation = generation;
    entry.updated_at = Some(chrono::Utc::now());
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<RealtimeError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}
