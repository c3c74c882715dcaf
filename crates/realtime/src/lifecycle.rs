//! Interest lifecycle.
//!
//! [`LifecycleManager`] owns every live key. The first consumer of a key
//! creates its cache slot, opens its event source binding and dispatches
//! the first recompute; later consumers share all three. When the last
//! consumer stops, the key's debounce timer is cancelled, its binding is
//! closed and its slot is discarded, in that order.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, watch, Mutex};

use crate::binding::{BindingSink, EventSourceBinding};
use crate::cache::{ApplyOutcome, CacheEntry, SnapshotCache};
use crate::coalescer::DebounceCoalescer;
use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::events::{RealtimeEvent, RealtimeEventBus, RealtimeEventKind};
use crate::fetcher::AggregationFetcher;
use crate::key::SubscriptionKey;
use crate::ports::{AggregationRpc, ChangeEventSource, RoutingQuery};
use crate::snapshot::Snapshot;

struct Interest {
    /// Distinguishes this interest from earlier ones on the same key.
    epoch: u64,
    consumers: usize,
    binding: EventSourceBinding,
}

struct Inner {
    source: Arc<dyn ChangeEventSource>,
    fetcher: AggregationFetcher,
    cache: SnapshotCache,
    coalescer: DebounceCoalescer<SubscriptionKey>,
    config: RealtimeConfig,
    interests: Mutex<HashMap<SubscriptionKey, Interest>>,
    epochs: AtomicU64,
    events: RealtimeEventBus,
}

/// Entry point of the realtime aggregation layer.
///
/// Cheap to clone; clones share the same keys.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    pub fn new(
        source: Arc<dyn ChangeEventSource>,
        rpc: Arc<dyn AggregationRpc>,
        query: Arc<dyn RoutingQuery>,
        config: RealtimeConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let on_fire = weak.clone();
            Inner {
                source,
                fetcher: AggregationFetcher::new(
                    rpc,
                    query,
                    config.fanout_policy,
                    config.unknown_cell_label.clone(),
                ),
                cache: SnapshotCache::new(),
                coalescer: DebounceCoalescer::new(move |key: SubscriptionKey| {
                    if let Some(inner) = on_fire.upgrade() {
                        tracing::debug!(key = %key, "Quiet window elapsed, recomputing");
                        inner.dispatch(key);
                    }
                }),
                events: RealtimeEventBus::new(config.event_capacity),
                interests: Mutex::new(HashMap::new()),
                epochs: AtomicU64::new(0),
                config,
            }
        });
        Self { inner }
    }

    /// Register interest in `key`.
    ///
    /// The first consumer of a key opens its binding and dispatches an
    /// immediate recompute, so the returned handle already reads `Loading`.
    /// Fails with [`RealtimeError::Transport`] when the event source cannot
    /// be subscribed; nothing is left behind in that case.
    pub async fn start_interest(
        &self,
        key: SubscriptionKey,
    ) -> Result<InterestHandle, RealtimeError> {
        let inner = &self.inner;
        let mut interests = inner.interests.lock().await;

        if let Some(interest) = interests.get_mut(&key) {
            interest.consumers += 1;
            tracing::debug!(key = %key, consumers = interest.consumers, "Joined existing interest");
            return self.handle_for(key, interest.epoch);
        }

        inner.cache.create(&key);
        let sink: Arc<dyn BindingSink> = Arc::new(Relay {
            inner: Arc::downgrade(inner),
        });
        let binding = match EventSourceBinding::open(
            inner.source.as_ref(),
            key.clone(),
            sink,
            inner.config.close_timeout,
        )
        .await
        {
            Ok(binding) => binding,
            Err(e) => {
                inner.cache.destroy(&key);
                tracing::warn!(key = %key, error = %e, "Failed to open event source binding");
                return Err(e);
            }
        };

        let epoch = inner.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        interests.insert(
            key.clone(),
            Interest {
                epoch,
                consumers: 1,
                binding,
            },
        );
        drop(interests);

        tracing::info!(key = %key, "Interest started");
        inner.events.publish(&key, RealtimeEventKind::InterestStarted);
        inner.dispatch(key.clone());
        self.handle_for(key, epoch)
    }

    fn handle_for(
        &self,
        key: SubscriptionKey,
        epoch: u64,
    ) -> Result<InterestHandle, RealtimeError> {
        let rx = self
            .inner
            .cache
            .watch(&key)
            .ok_or_else(|| RealtimeError::NotWatched(key.clone()))?;
        Ok(InterestHandle {
            key,
            epoch,
            inner: Arc::clone(&self.inner),
            rx,
            released: false,
        })
    }

    /// Recompute `key` now, dropping any armed debounce timer.
    pub async fn refetch(&self, key: &SubscriptionKey) -> Result<(), RealtimeError> {
        self.inner.refetch(key).await
    }

    /// Current state of `key`. Unwatched keys read as `Empty`.
    pub fn read(&self, key: &SubscriptionKey) -> CacheEntry {
        self.inner.cache.read(key)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.inner.events.subscribe()
    }

    pub async fn active_keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self.inner.interests.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of consumers sharing `key`. `0` when it is not watched.
    pub async fn consumer_count(&self, key: &SubscriptionKey) -> usize {
        self.inner
            .interests
            .lock()
            .await
            .get(key)
            .map_or(0, |interest| interest.consumers)
    }

    /// Release every key regardless of outstanding handles.
    ///
    /// Handles stopped afterwards are no-ops.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let mut interests = inner.interests.lock().await;
        inner.coalescer.cancel_all();

        for (key, interest) in interests.drain() {
            interest.binding.close().await;
            inner.coalescer.cancel(&key);
            inner.cache.destroy(&key);
            inner.events.publish(&key, RealtimeEventKind::InterestStopped);
        }
        tracing::info!("Realtime layer shut down");
    }
}

impl Inner {
    /// Bind a new generation and fetch in the background.
    fn dispatch(self: &Arc<Self>, key: SubscriptionKey) {
        let Some(generation) = self.cache.begin(&key) else {
            tracing::debug!(key = %key, "Recompute skipped, key no longer watched");
            return;
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = inner.fetcher.fetch(&key).await;
            inner.complete(&key, generation, result);
        });
    }

    fn complete(
        &self,
        key: &SubscriptionKey,
        generation: u64,
        result: Result<Snapshot, RealtimeError>,
    ) {
        let failure = result.as_ref().err().map(ToString::to_string);
        if self.cache.apply(key, generation, result) != ApplyOutcome::Applied {
            return;
        }

        match failure {
            None => {
                tracing::debug!(key = %key, generation, "Snapshot updated");
                self.events
                    .publish(key, RealtimeEventKind::SnapshotUpdated { generation });
            }
            Some(error) => {
                tracing::warn!(key = %key, generation, error = %error, "Recompute failed");
                self.events
                    .publish(key, RealtimeEventKind::RecomputeFailed { generation, error });
            }
        }
    }

    async fn refetch(self: &Arc<Self>, key: &SubscriptionKey) -> Result<(), RealtimeError> {
        if !self.interests.lock().await.contains_key(key) {
            return Err(RealtimeError::NotWatched(key.clone()));
        }
        self.coalescer.cancel(key);
        tracing::debug!(key = %key, "Explicit refetch");
        self.dispatch(key.clone());
        Ok(())
    }

    /// Drop one consumer of the interest started as `epoch`. Handles of an
    /// interest that already ended are ignored.
    async fn release(&self, key: &SubscriptionKey, epoch: u64) {
        let mut interests = self.interests.lock().await;
        let Some(interest) = interests.get_mut(key) else {
            return;
        };
        if interest.epoch != epoch {
            tracing::debug!(key = %key, epoch, "Ignoring handle of an ended interest");
            return;
        }

        interest.consumers = interest.consumers.saturating_sub(1);
        if interest.consumers > 0 {
            tracing::debug!(key = %key, consumers = interest.consumers, "Consumer left interest");
            return;
        }
        let Some(interest) = interests.remove(key) else {
            return;
        };

        self.coalescer.cancel(key);
        interest.binding.close().await;
        // The forwarder may have re-armed the timer while closing.
        self.coalescer.cancel(key);
        self.cache.destroy(key);

        tracing::info!(key = %key, "Interest stopped");
        self.events.publish(key, RealtimeEventKind::InterestStopped);
    }
}

/// Routes binding output into the coalescer and the cache.
struct Relay {
    inner: Weak<Inner>,
}

impl BindingSink for Relay {
    fn on_change(&self, key: &SubscriptionKey) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .coalescer
                .notify(key.clone(), inner.config.windows.for_key(key));
        }
    }

    fn on_channel_error(&self, key: &SubscriptionKey, reason: String) {
        if let Some(inner) = self.inner.upgrade() {
            inner.cache.mark_channel_error(key, reason.clone());
            inner
                .events
                .publish(key, RealtimeEventKind::ChannelDegraded { reason });
        }
    }

    fn on_channel_recovered(&self, key: &SubscriptionKey) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.cache.clear_channel_error(key) {
            inner.events.publish(key, RealtimeEventKind::ChannelRecovered);
        }
        // Changes may have been missed while degraded.
        inner.coalescer.cancel(key);
        inner.dispatch(key.clone());
    }
}

/// One consumer's share of a key.
///
/// Call [`stop`](Self::stop) when done. A handle dropped without stopping
/// is released in the background.
pub struct InterestHandle {
    key: SubscriptionKey,
    epoch: u64,
    inner: Arc<Inner>,
    rx: watch::Receiver<CacheEntry>,
    released: bool,
}

impl InterestHandle {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Pull the key's current state.
    pub fn read(&self) -> CacheEntry {
        self.rx.borrow().clone()
    }

    /// Wait for the next change to the key's state and return it.
    ///
    /// Fails with [`RealtimeError::NotWatched`] once the key's slot is gone.
    pub async fn changed(&mut self) -> Result<CacheEntry, RealtimeError> {
        self.rx
            .changed()
            .await
            .map_err(|_| RealtimeError::NotWatched(self.key.clone()))?;
        Ok(self.rx.borrow_and_update().clone())
    }

    pub async fn refetch(&self) -> Result<(), RealtimeError> {
        self.inner.refetch(&self.key).await
    }

    pub async fn stop(mut self) {
        self.released = true;
        self.inner.release(&self.key, self.epoch).await;
    }
}

impl fmt::Debug for InterestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterestHandle")
            .field("key", &self.key)
            .field("epoch", &self.epoch)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for InterestHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %self.key, "Interest handle dropped outside a runtime");
            return;
        };
        let inner = Arc::clone(&self.inner);
        let key = self.key.clone();
        let epoch = self.epoch;
        runtime.spawn(async move { inner.release(&key, epoch).await });
    }
}
