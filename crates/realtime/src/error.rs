use eryxon_core::CoreError;
use serde::Serialize;

use crate::key::SubscriptionKey;

/// One failed sub-fetch of a fan-out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyFailure {
    pub key: SubscriptionKey,
    pub reason: String,
}

/// Errors surfaced by the realtime aggregation layer.
///
/// Cloneable so that it can be held inside cached consumer state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RealtimeError {
    /// The event source or an RPC was unreachable, or answered with a
    /// payload that failed schema validation.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Some sub-fetches of a collection fetch failed.
    #[error("{}", describe_fanout(.attempted, .failures))]
    PartialFanout {
        attempted: usize,
        failures: Vec<KeyFailure>,
    },

    /// The event source reported its own channel as unhealthy.
    #[error("Subscription channel error: {0}")]
    SubscriptionChannel(String),

    /// The key has no live interest.
    #[error("No active interest for {0}")]
    NotWatched(SubscriptionKey),
}

impl RealtimeError {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport(reason.into())
    }

    /// Keys that failed, for a fan-out error. Empty for other variants.
    pub fn failed_keys(&self) -> Vec<&SubscriptionKey> {
        match self {
            Self::PartialFanout { failures, .. } => failures.iter().map(|f| &f.key).collect(),
            _ => Vec::new(),
        }
    }
}

impl From<CoreError> for RealtimeError {
    fn from(err: CoreError) -> Self {
        Self::Transport(format!("rejected payload: {err}"))
    }
}

fn describe_fanout(attempted: &usize, failures: &[KeyFailure]) -> String {
    let detail: Vec<String> = failures
        .iter()
        .map(|f| format!("{} ({})", f.key, f.reason))
        .collect();
    format!(
        "{} of {} sub-fetches failed: {}",
        failures.len(),
        attempted,
        detail.join("; ")
    )
}
