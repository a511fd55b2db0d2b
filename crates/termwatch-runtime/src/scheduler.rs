//! Poll scheduler: one independent timer per running watcher.
//!
//! Each tick spawns its poll cycle as a separate task, so the timer stays
//! wall-clock periodic. A per-watcher busy flag makes cycles single-flight:
//! a tick that lands while the previous cycle is still running is skipped,
//! not queued.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval_at};

use termwatch_core::Watcher;

use crate::directory::WatcherStore;
use crate::engine::{CycleReport, WatchEngine};

/// Configured intervals below this are clamped.
pub const MIN_POLL_INTERVAL_MS: u64 = 100;

/// Outcome of one attempt to run a poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The previous cycle for this watcher had not finished.
    Skipped,
    Completed(CycleReport),
    /// The cycle failed before checking sessions (logged).
    Failed,
}

/// Single-flight marker held for the duration of a cycle.
pub struct CycleGuard {
    busy: Arc<AtomicBool>,
}

impl CycleGuard {
    fn acquire(busy: &Arc<AtomicBool>) -> Option<Self> {
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                busy: Arc::clone(busy),
            })
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Each start gets a fresh busy flag, so a cycle left over from before a
/// stop never blocks the new run. Such a straggler may overlap the new run's
/// first cycle on the same session keys; its writes land in the new run's
/// state like any other observation.
struct RunningWatcher {
    watcher: Arc<Watcher>,
    busy: Arc<AtomicBool>,
    timer: JoinHandle<()>,
}

pub struct Scheduler {
    engine: Arc<WatchEngine>,
    store: Arc<dyn WatcherStore>,
    running: Mutex<HashMap<String, RunningWatcher>>,
}

impl Scheduler {
    pub fn new(engine: Arc<WatchEngine>, store: Arc<dyn WatcherStore>) -> Self {
        Self {
            engine,
            store,
            running: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn engine(&self) -> &Arc<WatchEngine> {
        &self.engine
    }

    /// Start polling `watcher`. An existing timer for the same id is fully
    /// stopped first.
    ///
    /// Replacement happens under one hold of the running map, so overlapping
    /// starts for one id always leave exactly one reachable timer.
    pub async fn start(&self, watcher: Watcher) {
        let id = watcher.id.clone();
        let mut running = self.running.lock().await;
        self.stop_entry(&mut running, &id);

        let period_ms = if watcher.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            tracing::warn!(
                "watcher {id}: pollIntervalMs {} below minimum, using {MIN_POLL_INTERVAL_MS}",
                watcher.poll_interval_ms
            );
            MIN_POLL_INTERVAL_MS
        } else {
            watcher.poll_interval_ms
        };

        let watcher = Arc::new(watcher);
        let busy = Arc::new(AtomicBool::new(false));
        let timer = tokio::spawn(run_timer(
            Arc::clone(&self.engine),
            Arc::clone(&watcher),
            Arc::clone(&busy),
            Duration::from_millis(period_ms),
        ));

        tracing::info!("watcher {id} started (every {period_ms}ms)");
        let replaced = running.insert(
            id,
            RunningWatcher {
                watcher,
                busy,
                timer,
            },
        );
        if let Some(old) = replaced {
            old.timer.abort();
        }
    }

    /// Cancel the timer and drop every runtime state entry for `watcher_id`.
    ///
    /// A cycle already in flight finishes on its own. Returns whether a timer
    /// was running.
    pub async fn stop(&self, watcher_id: &str) -> bool {
        let mut running = self.running.lock().await;
        self.stop_entry(&mut running, watcher_id)
    }

    fn stop_entry(&self, running: &mut HashMap<String, RunningWatcher>, watcher_id: &str) -> bool {
        let removed = running.remove(watcher_id);
        let purged = self.engine.purge_watcher(watcher_id);
        match removed {
            Some(entry) => {
                entry.timer.abort();
                tracing::info!("watcher {watcher_id} stopped ({purged} state entries purged)");
                true
            }
            None => false,
        }
    }

    /// Stop, re-read the watcher from the store, and start it again only if
    /// it still exists and is enabled. Returns whether it is running after.
    pub async fn restart(&self, watcher_id: &str) -> bool {
        self.stop(watcher_id).await;
        match self.store.get_watcher(watcher_id) {
            Ok(Some(watcher)) if watcher.enabled => {
                self.start(watcher).await;
                true
            }
            Ok(Some(_)) => {
                tracing::info!("watcher {watcher_id} is disabled, not restarting");
                false
            }
            Ok(None) => {
                tracing::info!("watcher {watcher_id} no longer exists, not restarting");
                false
            }
            Err(e) => {
                tracing::warn!("failed to load watcher {watcher_id} for restart: {e}");
                false
            }
        }
    }

    /// Start every enabled watcher in the store. Returns how many started.
    pub async fn seed(&self) -> anyhow::Result<usize> {
        let watchers = self.store.list_enabled_watchers()?;
        let count = watchers.len();
        for watcher in watchers {
            self.start(watcher).await;
        }
        Ok(count)
    }

    pub async fn is_running(&self, watcher_id: &str) -> bool {
        self.running.lock().await.contains_key(watcher_id)
    }

    pub async fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run one guarded cycle for a running watcher right now.
    ///
    /// `None` if the watcher is not running.
    #[cfg(test)]
    pub async fn poll_now(&self, watcher_id: &str) -> Option<CycleOutcome> {
        let (watcher, busy) = {
            let running = self.running.lock().await;
            let entry = running.get(watcher_id)?;
            (Arc::clone(&entry.watcher), Arc::clone(&entry.busy))
        };
        Some(run_guarded(&self.engine, &watcher, &busy).await)
    }

    /// Cancel every timer and clear all runtime state and the viewport cache.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, RunningWatcher)> =
            self.running.lock().await.drain().collect();
        for (_, entry) in &drained {
            entry.timer.abort();
        }
        self.engine.reset();
        tracing::info!("scheduler stopped ({} watchers)", drained.len());
    }

    #[cfg(test)]
    async fn hold_cycle(&self, watcher_id: &str) -> Option<CycleGuard> {
        let running = self.running.lock().await;
        CycleGuard::acquire(&running.get(watcher_id)?.busy)
    }
}

async fn run_timer(
    engine: Arc<WatchEngine>,
    watcher: Arc<Watcher>,
    busy: Arc<AtomicBool>,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let engine = Arc::clone(&engine);
        let watcher = Arc::clone(&watcher);
        let busy = Arc::clone(&busy);
        tokio::spawn(async move {
            if let CycleOutcome::Completed(report) = run_guarded(&engine, &watcher, &busy).await {
                tracing::debug!("watcher {} cycle: {report:?}", watcher.id);
            }
        });
    }
}

async fn run_guarded(
    engine: &Arc<WatchEngine>,
    watcher: &Arc<Watcher>,
    busy: &Arc<AtomicBool>,
) -> CycleOutcome {
    let Some(_guard) = CycleGuard::acquire(busy) else {
        tracing::debug!("watcher {}: previous cycle still running, tick skipped", watcher.id);
        return CycleOutcome::Skipped;
    };
    match engine.run_cycle(watcher, Utc::now()).await {
        Ok(report) => CycleOutcome::Completed(report),
        Err(e) => {
            tracing::warn!("watcher {} poll cycle failed: {e}", watcher.id);
            CycleOutcome::Failed
        }
    }
}
