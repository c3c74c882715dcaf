//! Eryxon domain types and pure aggregation logic.
//!
//! Nothing in this crate performs I/O. Payloads fetched by the realtime
//! layer are validated and converted here before they reach a cache slot.

pub mod cell;
pub mod error;
pub mod metrics;
pub mod operation;
pub mod routing;
pub mod types;

pub use error::CoreError;
