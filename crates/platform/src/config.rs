use std::time::Duration;

/// Connection settings for the hosted data platform.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Project base URL, e.g. `https://abc.example.co`. No trailing slash.
    pub url: String,
    /// Anonymous/service key sent as `apikey` on every request.
    pub api_key: String,
    /// User JWT. Falls back to the API key when unset.
    pub access_token: Option<String>,
    pub request_timeout: Duration,
    /// Interval between realtime heartbeats. A heartbeat left unanswered
    /// for a full interval marks the channel as lost.
    pub heartbeat_interval: Duration,
    pub cell_metrics_rpc: String,
    pub capacity_rpc: String,
}

impl PlatformConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                          | Default                      |
    /// |----------------------------------|------------------------------|
    /// | `PLATFORM_URL`                   | required                     |
    /// | `PLATFORM_API_KEY`               | required                     |
    /// | `PLATFORM_ACCESS_TOKEN`          | unset                        |
    /// | `PLATFORM_REQUEST_TIMEOUT_SECS`  | `10`                         |
    /// | `PLATFORM_HEARTBEAT_SECS`        | `30`                         |
    /// | `PLATFORM_CELL_METRICS_RPC`      | `compute_cell_metrics`       |
    /// | `PLATFORM_CAPACITY_RPC`          | `compute_next_cell_capacity` |
    pub fn from_env() -> Result<Self, PlatformConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, PlatformConfigError> {
        let required = |name: &'static str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(PlatformConfigError::Missing(name))
        };
        let secs = |name: &'static str, default: u64| match lookup(name) {
            None => Ok(Duration::from_secs(default)),
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .ok_or(PlatformConfigError::Invalid { name, value: raw }),
        };

        let url = required("PLATFORM_URL")?.trim_end_matches('/').to_string();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(PlatformConfigError::Invalid {
                name: "PLATFORM_URL",
                value: url,
            });
        }

        Ok(Self {
            url,
            api_key: required("PLATFORM_API_KEY")?,
            access_token: lookup("PLATFORM_ACCESS_TOKEN").filter(|v| !v.trim().is_empty()),
            request_timeout: secs("PLATFORM_REQUEST_TIMEOUT_SECS", 10)?,
            heartbeat_interval: secs("PLATFORM_HEARTBEAT_SECS", 30)?,
            cell_metrics_rpc: lookup("PLATFORM_CELL_METRICS_RPC")
                .unwrap_or_else(|| "compute_cell_metrics".into()),
            capacity_rpc: lookup("PLATFORM_CAPACITY_RPC")
                .unwrap_or_else(|| "compute_next_cell_capacity".into()),
        })
    }

    /// Token for `Authorization: Bearer` and the realtime join.
    pub fn bearer_token(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }

    /// REST endpoint under `/rest/v1`.
    pub fn rest_url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.url, path.trim_start_matches('/'))
    }

    /// Realtime WebSocket endpoint, with the scheme switched to ws/wss.
    pub fn websocket_url(&self) -> String {
        let base = match self.url.strip_prefix("https://") {
            Some(host) => format!("wss://{host}"),
            None => format!("ws://{}", self.url.trim_start_matches("http://")),
        };
        format!(
            "{base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.api_key
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}
