use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use crate::condition::TriggerCondition;

/// Default timer period when a stored watcher omits `pollIntervalMs`.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Default capture depth when a stored watcher omits `viewportLines`.
pub const DEFAULT_VIEWPORT_LINES: u32 = 50;

// ─── Scope ────────────────────────────────────────────────────────

/// Wire form of a watcher's targeting rule.
///
/// Unknown strings are kept as `Unrecognized` instead of failing
/// deserialization, so one badly configured watcher cannot poison a whole
/// registry load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ScopeKind {
    All,
    Agent,
    Profile,
    Provider,
    Unrecognized(String),
}

impl ScopeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::All => "all",
            Self::Agent => "agent",
            Self::Profile => "profile",
            Self::Provider => "provider",
            Self::Unrecognized(s) => s,
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeKind {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "all" => Self::All,
            "agent" => Self::Agent,
            "profile" => Self::Profile,
            "provider" => Self::Provider,
            other => Self::Unrecognized(other.to_string()),
        })
    }
}

impl From<String> for ScopeKind {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }
}

impl From<ScopeKind> for String {
    fn from(kind: ScopeKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Resolved targeting rule: scope kind paired with its filter id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherScope {
    /// Every active session in the watcher's project.
    All,
    /// Sessions run by this agent id.
    Agent(String),
    /// Sessions run by agents under this profile id.
    Profile(String),
    /// Sessions run by agents whose effective provider is this id.
    Provider(String),
    /// Misconfigured scope. Resolves to no sessions.
    Invalid(String),
}

// ─── Cooldown ─────────────────────────────────────────────────────

/// Re-fire suppression policy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownMode {
    /// Fixed window of `cooldownMs` after each fire.
    #[default]
    Time,
    /// Edge-triggered: re-arms only after the condition goes false.
    UntilClear,
}

// ─── Watcher ──────────────────────────────────────────────────────

/// A configured rule that polls a scoped set of sessions.
///
/// Immutable input to a poll cycle. Changes go through stop, update, start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Watcher {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub scope: ScopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_filter_id: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_viewport_lines")]
    pub viewport_lines: u32,
    /// 0 disables the idle gate.
    #[serde(default)]
    pub idle_after_seconds: u64,
    pub condition: TriggerCondition,
    #[serde(default)]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub cooldown_mode: CooldownMode,
    pub event_name: String,
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_viewport_lines() -> u32 {
    DEFAULT_VIEWPORT_LINES
}

impl Watcher {
    /// Pair the scope kind with its filter id.
    ///
    /// A non-`all` scope without a (non-blank) filter id is `Invalid`.
    pub fn target(&self) -> WatcherScope {
        let filter = self
            .scope_filter_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);
        match (&self.scope, filter) {
            (ScopeKind::All, _) => WatcherScope::All,
            (ScopeKind::Agent, Some(id)) => WatcherScope::Agent(id),
            (ScopeKind::Profile, Some(id)) => WatcherScope::Profile(id),
            (ScopeKind::Provider, Some(id)) => WatcherScope::Provider(id),
            (ScopeKind::Unrecognized(raw), _) => {
                WatcherScope::Invalid(format!("unrecognized scope {raw:?}"))
            }
            (kind, None) => WatcherScope::Invalid(format!("scope {kind} requires scopeFilterId")),
        }
    }
}

// ─── Session ──────────────────────────────────────────────────────

/// Session activity as reported by the session directory.
///
/// Only `idle` is meaningful here; every other value counts as busy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActivityState {
    Idle,
    Active(String),
}

impl ActivityState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl Default for ActivityState {
    fn default() -> Self {
        Self::Active("unknown".to_string())
    }
}

impl From<String> for ActivityState {
    fn from(s: String) -> Self {
        if s == "idle" { Self::Idle } else { Self::Active(s) }
    }
}

impl From<ActivityState> for String {
    fn from(state: ActivityState) -> Self {
        match state {
            ActivityState::Idle => "idle".to_string(),
            ActivityState::Active(s) => s,
        }
    }
}

/// Read-only snapshot of a running agent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmux_session_id: Option<String>,
    #[serde(default)]
    pub activity_state: ActivityState,
    /// ISO-8601 timestamp, kept raw so an unparsable value can be observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<String>,
}

impl Session {
    /// Terminal target for capture; also the viewport cache's session key.
    pub fn terminal_target(&self) -> Option<&str> {
        [self.tmux_session_id.as_deref(), Some(self.id.as_str())]
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
    }
}

// ─── Agents & Providers ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    /// Active provider-configuration binding, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub id: String,
    pub profile_id: String,
    pub provider_id: String,
}

// ─── Tests ────────────────────────────────────────────────────────
