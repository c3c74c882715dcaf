//! `eryxon-monitor` -- live view of a tenant's shop floor in the log.
//!
//! Watches the tenant's cell board plus any cells, part and jobs named in
//! the environment, and logs each recompute as it lands.
//!
//! # Environment variables
//!
//! | Variable          | Required | Default | Description                        |
//! |-------------------|----------|---------|------------------------------------|
//! | `PLATFORM_URL`    | yes      | --      | Base URL of the data platform      |
//! | `PLATFORM_API_KEY`| yes      | --      | API key for REST and realtime      |
//! | `TENANT_ID`       | yes      | --      | Tenant to watch                    |
//! | `WATCH_CELL_IDS`  | no       | --      | Comma-separated cell ids           |
//! | `WATCH_PART_ID`   | no       | --      | Part whose routing is watched      |
//! | `WATCH_JOB_IDS`   | no       | --      | Comma-separated job ids            |
//! | `LOG_FORMAT`      | no       | `text`  | `json` for structured output       |
//!
//! Debounce and fan-out tuning is read by `RealtimeConfig::from_env`.

use std::sync::Arc;

use anyhow::Context;
use eryxon_monitor::report;
use eryxon_monitor::targets::WatchTargets;
use eryxon_platform::{PlatformApi, PlatformConfig, RealtimeSource};
use eryxon_realtime::{LifecycleManager, RealtimeConfig, RealtimeEventKind};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // --- Configuration ---
    let platform = PlatformConfig::from_env().context("Invalid platform configuration")?;
    let realtime = RealtimeConfig::from_env();
    let targets = WatchTargets::from_env()?;
    tracing::info!(
        url = %platform.url,
        tenant_id = %targets.tenant_id,
        fanout = ?realtime.fanout_policy,
        "Starting eryxon-monitor",
    );

    // --- Platform adapters ---
    let source = Arc::new(RealtimeSource::new(&platform));
    let api = Arc::new(PlatformApi::new(platform).context("Failed to build HTTP client")?);
    let manager = LifecycleManager::new(source.clone(), api.clone(), api, realtime);

    // --- Event log ---
    let mut events = manager.subscribe_events();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match &event.kind {
                    RealtimeEventKind::RecomputeFailed { .. }
                    | RealtimeEventKind::ChannelDegraded { .. } => {
                        tracing::warn!(key = %event.key, kind = ?event.kind, "Realtime event");
                    }
                    _ => tracing::debug!(key = %event.key, kind = ?event.kind, "Realtime event"),
                },
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event log lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // --- Interests ---
    let mut watchers = Vec::new();
    for key in targets.keys() {
        let mut handle = match manager.start_interest(key.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Failed to watch key");
                continue;
            }
        };
        watchers.push(tokio::spawn(async move {
            while let Ok(entry) = handle.changed().await {
                report::log_entry(handle.key(), &entry);
            }
            handle.stop().await;
        }));
    }
    if watchers.is_empty() {
        anyhow::bail!("No key could be watched");
    }
    tracing::info!(keys = watchers.len(), "Watching");

    // --- Shutdown ---
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutting down");

    manager.shutdown().await;
    for watcher in watchers {
        let _ = watcher.await;
    }
    source.shutdown();
    event_log.abort();
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "eryxon_monitor=info,eryxon_realtime=info,eryxon_platform=info".into()
    });
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
