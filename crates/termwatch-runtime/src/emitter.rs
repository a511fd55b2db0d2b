//! Event trigger emitter: builds the outward event and publishes it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use termwatch_core::{ContentHash, Session, Watcher};

use crate::bus::EventBus;
use crate::directory::AgentDirectory;

/// Topic every watcher fire is published under.
pub const TRIGGER_TOPIC: &str = "watcher.triggered";

/// Maximum characters of trailing viewport carried in an event.
pub const SNIPPET_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    /// The watcher's configured `eventName`; distinguishes watchers sharing the topic.
    pub event_name: String,
    pub watcher_id: String,
    pub watcher_name: String,
    pub project_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub snippet: String,
    pub viewport_hash: ContentHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub trigger_count: u64,
    pub triggered_at: DateTime<Utc>,
}

/// Last `max` characters of `text`, on a char boundary.
pub fn tail_chars(text: &str, max: usize) -> &str {
    if max == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

pub struct TriggerEmitter {
    agents: Arc<dyn AgentDirectory>,
    bus: Arc<dyn EventBus>,
}

impl TriggerEmitter {
    pub fn new(agents: Arc<dyn AgentDirectory>, bus: Arc<dyn EventBus>) -> Self {
        Self { agents, bus }
    }

    pub fn build(
        &self,
        watcher: &Watcher,
        session: &Session,
        viewport: &str,
        hash: ContentHash,
        trigger_count: u64,
        now: DateTime<Utc>,
    ) -> TriggerEvent {
        let agent_name = session.agent_id.as_deref().and_then(|id| {
            match self.agents.get_agent(id) {
                Ok(agent) => agent.map(|a| a.name),
                Err(e) => {
                    tracing::debug!("agent lookup failed for {id}: {e}");
                    None
                }
            }
        });
        TriggerEvent {
            event_name: watcher.event_name.clone(),
            watcher_id: watcher.id.clone(),
            watcher_name: watcher.name.clone(),
            project_id: session.project_id.clone(),
            session_id: session.id.clone(),
            agent_id: session.agent_id.clone(),
            agent_name,
            snippet: tail_chars(viewport, SNIPPET_MAX_CHARS).to_string(),
            viewport_hash: hash,
            pattern: watcher.condition.pattern().map(String::from),
            trigger_count,
            triggered_at: now,
        }
    }

    /// Publish `event`. Returns whether the bus accepted it; a failure means
    /// the event is lost.
    pub fn publish(&self, event: &TriggerEvent) -> bool {
        let payload = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("failed to encode trigger event for {}: {e}", event.watcher_id);
                return false;
            }
        };
        match self.bus.publish(TRIGGER_TOPIC, payload) {
            Ok(()) => {
                tracing::info!(
                    "watcher {} fired on session {} (event={}, count={})",
                    event.watcher_id,
                    event.session_id,
                    event.event_name,
                    event.trigger_count
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    "publish failed for watcher {} session {}: {e}",
                    event.watcher_id,
                    event.session_id
                );
                false
            }
        }
    }
}
