use std::str::FromStr;
use std::time::Duration;

use crate::key::{KeyKind, SubscriptionKey};

/// Debounce quiet windows, per key kind.
#[derive(Debug, Clone, PartialEq)]
pub struct QuietWindows {
    pub cell_metrics: Duration,
    pub capacity: Duration,
    pub cell_board: Duration,
    pub routing: Duration,
}

impl Default for QuietWindows {
    fn default() -> Self {
        Self {
            cell_metrics: Duration::from_millis(200),
            capacity: Duration::from_millis(300),
            cell_board: Duration::from_millis(300),
            routing: Duration::from_millis(150),
        }
    }
}

impl QuietWindows {
    /// All kinds share the same window.
    pub fn uniform(window: Duration) -> Self {
        Self {
            cell_metrics: window,
            capacity: window,
            cell_board: window,
            routing: window,
        }
    }

    pub fn for_key(&self, key: &SubscriptionKey) -> Duration {
        match key.kind() {
            KeyKind::CellMetrics => self.cell_metrics,
            KeyKind::Capacity => self.capacity,
            KeyKind::CellBoard => self.cell_board,
            KeyKind::Routing => self.routing,
        }
    }
}

/// How a collection fetch reports sub-fetch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutPolicy {
    /// Successful sub-fetches are kept; failures are enumerated alongside.
    Partial,
    /// Any failure fails the whole fetch, enumerating every failed key.
    Atomic,
}

impl FromStr for FanoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "partial" => Ok(Self::Partial),
            "atomic" => Ok(Self::Atomic),
            other => Err(format!("unknown fan-out policy '{other}'")),
        }
    }
}

/// Tuning for the realtime aggregation layer.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub windows: QuietWindows,
    pub fanout_policy: FanoutPolicy,
    /// Placeholder passed to the routing engine for cells without a name.
    pub unknown_cell_label: String,
    /// Capacity of the layer event broadcast channel.
    pub event_capacity: usize,
    /// Upper bound on waiting for a binding's forwarder to exit on close.
    pub close_timeout: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            windows: QuietWindows::default(),
            fanout_policy: FanoutPolicy::Partial,
            unknown_cell_label: "unknown".into(),
            event_capacity: 256,
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl RealtimeConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                             | Default   |
    /// |-------------------------------------|-----------|
    /// | `REALTIME_CELL_METRICS_DEBOUNCE_MS` | `200`     |
    /// | `REALTIME_CAPACITY_DEBOUNCE_MS`     | `300`     |
    /// | `REALTIME_CELL_BOARD_DEBOUNCE_MS`   | `300`     |
    /// | `REALTIME_ROUTING_DEBOUNCE_MS`      | `150`     |
    /// | `REALTIME_FANOUT_POLICY`            | `partial` |
    /// | `REALTIME_UNKNOWN_CELL_LABEL`       | `unknown` |
    /// | `REALTIME_EVENT_CAPACITY`           | `256`     |
    /// | `REALTIME_CLOSE_TIMEOUT_SECS`       | `5`       |
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// Unparseable values are logged and replaced by their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |name: &str, default: Duration| {
            parse_or(&lookup, name, default.as_millis() as u64).map_or(default, Duration::from_millis)
        };

        let windows = QuietWindows {
            cell_metrics: millis("REALTIME_CELL_METRICS_DEBOUNCE_MS", defaults.windows.cell_metrics),
            capacity: millis("REALTIME_CAPACITY_DEBOUNCE_MS", defaults.windows.capacity),
            cell_board: millis("REALTIME_CELL_BOARD_DEBOUNCE_MS", defaults.windows.cell_board),
            routing: millis("REALTIME_ROUTING_DEBOUNCE_MS", defaults.windows.routing),
        };

        let fanout_policy = parse_or(&lookup, "REALTIME_FANOUT_POLICY", defaults.fanout_policy)
            .unwrap_or(defaults.fanout_policy);

        let unknown_cell_label = lookup("REALTIME_UNKNOWN_CELL_LABEL")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.unknown_cell_label);

        let event_capacity = parse_or(&lookup, "REALTIME_EVENT_CAPACITY", defaults.event_capacity)
            .filter(|c| *c > 0)
            .unwrap_or(defaults.event_capacity);

        let close_timeout = parse_or(
            &lookup,
            "REALTIME_CLOSE_TIMEOUT_SECS",
            defaults.close_timeout.as_secs(),
        )
        .map_or(defaults.close_timeout, Duration::from_secs);

        Self {
            windows,
            fanout_policy,
            unknown_cell_label,
            event_capacity,
            close_timeout,
        }
    }
}

/// Parse `name` if set. Returns `Some(default)` when unset, `None` when the
/// value does not parse (after logging it).
fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Option<T> {
    match lookup(name) {
        None => Some(default),
        Some(raw) => match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "Ignoring unparseable configuration value");
                None
            }
        },
    }
}
