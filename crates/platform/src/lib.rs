//! Adapters binding the realtime layer to the hosted data platform.
//!
//! - [`source::RealtimeSource`] implements `ChangeEventSource` over the
//!   platform's realtime WebSocket channels.
//! - [`api::PlatformApi`] implements `AggregationRpc` and `RoutingQuery`
//!   over its REST endpoints.

pub mod api;
pub mod client;
pub mod config;
pub mod messages;
pub mod reconnect;
pub mod source;

pub use api::{PlatformApi, PlatformApiError};
pub use config::{PlatformConfig, PlatformConfigError};
pub use source::RealtimeSource;
