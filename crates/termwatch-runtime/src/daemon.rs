//! `termwatch daemon`: seed the scheduler from the registry and run until
//! a shutdown signal. SIGHUP reloads the registry and restarts watchers.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use termwatch_tmux::{TmuxExecutor, TmuxSocket};

use crate::bus::StdoutBus;
use crate::directory::WatcherStore;
use crate::engine::WatchEngine;
use crate::registry::JsonRegistry;
use crate::scheduler::Scheduler;

/// Run the daemon: start every enabled watcher, wait for shutdown signal.
pub async fn run_daemon(
    registry: Arc<JsonRegistry>,
    registry_path: &Path,
    tmux_socket: Option<String>,
) -> anyhow::Result<()> {
    let executor = Arc::new(build_executor(tmux_socket));
    let engine = Arc::new(WatchEngine::new(
        executor,
        registry.clone(),
        registry.clone(),
        Arc::new(StdoutBus),
    ));
    let scheduler = Scheduler::new(engine, registry.clone());

    let started = scheduler.seed().await?;
    tracing::info!(
        "termwatch daemon running ({started} watchers from {})",
        registry_path.display()
    );

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("failed to register SIGTERM handler: {e}"))?;
        let mut sighup = signal(SignalKind::hangup())
            .map_err(|e| anyhow::anyhow!("failed to register SIGHUP handler: {e}"))?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received ctrl-c, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    tracing::info!("received SIGHUP, reloading registry");
                    reload_and_restart(&registry, &scheduler).await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("received ctrl-c, shutting down");
    }

    scheduler.shutdown().await;
    tracing::info!("daemon stopped");
    Ok(())
}

/// Re-read the registry, then restart every watcher that is running or
/// enabled. Restart drops ones that were disabled or deleted.
///
/// A registry that fails to load leaves the current watchers untouched.
pub async fn reload_and_restart(registry: &JsonRegistry, scheduler: &Scheduler) -> usize {
    if let Err(e) = registry.reload() {
        tracing::warn!("registry reload failed, keeping current watchers: {e}");
        return scheduler.running_ids().await.len();
    }

    let mut ids: BTreeSet<String> = scheduler.running_ids().await.into_iter().collect();
    match registry.list_enabled_watchers() {
        Ok(enabled) => ids.extend(enabled.into_iter().map(|w| w.id)),
        Err(e) => tracing::warn!("failed to list enabled watchers: {e}"),
    }

    let mut running = 0;
    for id in &ids {
        let was_running = scheduler.is_running(id).await;
        match (was_running, scheduler.restart(id).await) {
            (_, true) => running += 1,
            (true, false) => tracing::info!("watcher {id} dropped after reload"),
            (false, false) => {}
        }
    }
    tracing::info!("registry reloaded, {running} watchers running");
    running
}

pub fn build_executor(tmux_socket: Option<String>) -> TmuxExecutor {
    let socket = select_socket(tmux_socket, std::env::var("TERMWATCH_TMUX_SOCKET_NAME").ok());
    TmuxExecutor::default().with_socket(socket)
}

// Socket targeting: --tmux-socket / TERMWATCH_TMUX_SOCKET_PATH > TERMWATCH_TMUX_SOCKET_NAME
fn select_socket(path: Option<String>, name: Option<String>) -> TmuxSocket {
    match (path, name) {
        (Some(path), _) if !path.is_empty() => TmuxSocket::Path(path),
        (_, Some(name)) if !name.is_empty() => TmuxSocket::Name(name),
        _ => TmuxSocket::Default,
    }
}
