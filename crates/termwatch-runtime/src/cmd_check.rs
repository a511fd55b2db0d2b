//! `termwatch check` - preview one watcher against its sessions (JSON).

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use termwatch_tmux::TmuxCommandRunner;

use crate::bus::BroadcastBus;
use crate::directory::WatcherStore;
use crate::engine::{CheckOutcome, WatchEngine};
use crate::registry::JsonRegistry;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckReport<'a> {
    watcher_id: &'a str,
    enabled: bool,
    sessions: Vec<CheckOutcome>,
}

pub async fn cmd_check(
    registry: Arc<JsonRegistry>,
    runner: Arc<dyn TmuxCommandRunner>,
    watcher_id: &str,
) -> anyhow::Result<()> {
    let json = check_json(registry, runner, watcher_id).await?;
    println!("{json}");
    Ok(())
}

async fn check_json(
    registry: Arc<JsonRegistry>,
    runner: Arc<dyn TmuxCommandRunner>,
    watcher_id: &str,
) -> anyhow::Result<String> {
    let watcher = registry
        .get_watcher(watcher_id)?
        .ok_or_else(|| anyhow::anyhow!("watcher not found: {watcher_id}"))?;

    // Preview never publishes; the bus only satisfies the engine.
    let engine = WatchEngine::new(
        runner,
        registry.clone(),
        registry,
        Arc::new(BroadcastBus::default()),
    );
    let sessions = engine.preview(&watcher, Utc::now()).await?;

    let report = CheckReport {
        watcher_id: &watcher.id,
        enabled: watcher.enabled,
        sessions,
    };
    Ok(serde_json::to_string_pretty(&report)?)
}
