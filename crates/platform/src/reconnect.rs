//! Exponential-backoff rejoin for realtime channels.
//!
//! When a channel's socket drops, [`reconnect_loop`] keeps reopening and
//! rejoining it with growing delays until it succeeds or the subscription
//! is cancelled.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{RealtimeClient, RealtimeConnection};
use crate::messages::ChannelSpec;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Next backoff delay, clamped to `max_delay`.
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    current.mul_f64(config.multiplier).min(config.max_delay)
}

/// Reopen `spec`'s channel with exponential backoff.
///
/// Waits `initial_delay` before the first attempt. Returns `None` if
/// `cancel` fires first.
pub async fn reconnect_loop(
    client: &RealtimeClient,
    spec: &ChannelSpec,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<RealtimeConnection> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
        tracing::info!(
            topic = %spec.topic,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Rejoining realtime channel",
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(topic = %spec.topic, "Rejoin cancelled");
                return None;
            }
            result = client.open_channel(spec) => {
                match result {
                    Ok(conn) => {
                        tracing::info!(topic = %spec.topic, attempt, "Realtime channel rejoined");
                        return Some(conn);
                    }
                    Err(e) => {
                        tracing::warn!(topic = %spec.topic, attempt, error = %e, "Rejoin attempt failed");
                    }
                }
            }
        }

        delay = next_delay(delay, config);
    }
}
