//! Realtime aggregation layer.
//!
//! Keeps live per-key snapshots (cell metrics, next-cell capacity, cell
//! boards and part/job routing) in step with the platform's stream of
//! row-level change notifications. Each live key owns one event source
//! binding, one debounce timer and one cache slot, shared by all of its
//! consumers through [`LifecycleManager`].
//!
//! The platform itself is reached only through the traits in [`ports`].

pub mod binding;
pub mod cache;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod key;
pub mod lifecycle;
pub mod ports;
pub mod snapshot;

pub use cache::{CacheEntry, SlotState};
pub use config::{FanoutPolicy, QuietWindows, RealtimeConfig};
pub use error::{KeyFailure, RealtimeError};
pub use events::{RealtimeEvent, RealtimeEventKind};
pub use key::{ChangeKind, ChangeNotification, EntityType, SubscriptionKey};
pub use lifecycle::{InterestHandle, LifecycleManager};
pub use snapshot::Snapshot;
