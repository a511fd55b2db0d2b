//! Short-TTL cache of captured terminal text, shared by every watcher.
//!
//! Keyed by `(session target, lines)`. Stale entries are evicted lazily on
//! read; there is no background sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};

use termwatch_tmux::{TmuxCommandRunner, capture_pane};

/// Entries younger than this are reused.
pub const VIEWPORT_TTL_MS: i64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ViewportKey {
    target: String,
    lines: u32,
}

#[derive(Debug, Clone)]
struct CachedViewport {
    text: String,
    captured_at: DateTime<Utc>,
}

pub struct ViewportCache {
    runner: Arc<dyn TmuxCommandRunner>,
    ttl: TimeDelta,
    entries: Mutex<HashMap<ViewportKey, CachedViewport>>,
    // One lock per key with a capture in progress.
    inflight: Mutex<HashMap<ViewportKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ViewportCache {
    pub fn new(runner: Arc<dyn TmuxCommandRunner>) -> Self {
        Self {
            runner,
            ttl: TimeDelta::milliseconds(VIEWPORT_TTL_MS),
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Fresh cached text, if any. A stale entry is evicted.
    pub fn get(&self, target: &str, lines: u32, now: DateTime<Utc>) -> Option<String> {
        let key = ViewportKey {
            target: target.to_string(),
            lines,
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&key) {
            Some(entry) if now.signed_duration_since(entry.captured_at) < self.ttl => {
                Some(entry.text.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    fn put(&self, target: &str, lines: u32, text: String, now: DateTime<Utc>) {
        let key = ViewportKey {
            target: target.to_string(),
            lines,
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key,
            CachedViewport {
                text,
                captured_at: now,
            },
        );
    }

    /// Capture from the terminal backend and cache the result.
    ///
    /// Returns an empty string on failure; nothing is cached then.
    pub async fn capture(&self, target: &str, lines: u32, now: DateTime<Utc>) -> String {
        let runner = Arc::clone(&self.runner);
        let owned_target = target.to_string();
        let result = tokio::task::spawn_blocking(move || {
            capture_pane(&*runner, &owned_target, lines, true)
        })
        .await;
        match result {
            Ok(Ok(text)) => {
                self.put(target, lines, text.clone(), now);
                text
            }
            Ok(Err(e)) => {
                tracing::warn!("capture failed for {target}: {e}");
                String::new()
            }
            Err(e) => {
                tracing::warn!("capture task failed for {target}: {e}");
                String::new()
            }
        }
    }

    /// Cached text when fresh, otherwise a new capture.
    ///
    /// Concurrent misses on one key share a single capture: the first caller
    /// captures while the rest wait on the key's lock, then read the cache.
    pub async fn viewport(&self, target: &str, lines: u32, now: DateTime<Utc>) -> String {
        if let Some(text) = self.get(target, lines, now) {
            tracing::debug!("viewport cache hit for {target} ({lines} lines)");
            return text;
        }

        let key = ViewportKey {
            target: target.to_string(),
            lines,
        };
        let slot = Arc::clone(
            self.inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key.clone())
                .or_default(),
        );
        let _capturing = slot.lock().await;

        if let Some(text) = self.get(target, lines, now) {
            tracing::debug!("viewport shared with concurrent capture for {target}");
            return text;
        }
        let text = self.capture(target, lines, now).await;

        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if inflight.get(&key).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
            inflight.remove(&key);
        }
        text
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
