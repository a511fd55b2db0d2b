//! Watch engine: the per-session check and the poll cycle.
//!
//! Flow per session: idle gate → viewport (cached or captured) → condition
//! match → eligibility state machine → emit on fire. Sessions in one cycle
//! run as independent tasks so a slow or failing session never holds up
//! the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;

use termwatch_core::{
    CompiledCondition, ContentHash, CooldownPolicy, EligibilityStore, IdleBlock, IdleGate,
    Session, TriggerKey, Watcher, idle_gate,
};
use termwatch_tmux::TmuxCommandRunner;

use crate::bus::EventBus;
use crate::directory::{AgentDirectory, SessionDirectory};
use crate::emitter::TriggerEmitter;
use crate::scope::resolve_sessions;
use crate::viewport_cache::ViewportCache;

/// Whether a check may touch runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Poll cycle: writes eligibility state and publishes on fire.
    Live,
    /// "Test this watcher now": same gate and matching, no writes, no publish.
    Preview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    IdleGate,
    NoTerminal,
    EmptyCapture,
}

/// Result of checking one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutcome {
    pub session_id: String,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<bool>,
    /// In preview mode: whether it would have fired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport_hash: Option<ContentHash>,
}

impl CheckOutcome {
    fn skipped(session_id: &str, reason: SkipReason) -> Self {
        Self {
            session_id: session_id.to_string(),
            skipped: true,
            skip_reason: Some(reason),
            matched: None,
            triggered: None,
            viewport_hash: None,
        }
    }
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub sessions: usize,
    pub skipped: usize,
    pub matched: usize,
    pub fired: usize,
    pub errors: usize,
}

pub struct WatchEngine {
    sessions: Arc<dyn SessionDirectory>,
    agents: Arc<dyn AgentDirectory>,
    viewports: ViewportCache,
    emitter: TriggerEmitter,
    triggers: Mutex<EligibilityStore>,
    // Compiled condition per watcher id, rebuilt when the condition changes.
    conditions: Mutex<HashMap<String, Arc<CompiledCondition>>>,
}

impl WatchEngine {
    pub fn new(
        runner: Arc<dyn TmuxCommandRunner>,
        sessions: Arc<dyn SessionDirectory>,
        agents: Arc<dyn AgentDirectory>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            sessions,
            viewports: ViewportCache::new(runner),
            emitter: TriggerEmitter::new(Arc::clone(&agents), bus),
            agents,
            triggers: Mutex::new(EligibilityStore::new()),
            conditions: Mutex::new(HashMap::new()),
        }
    }

    fn triggers(&self) -> std::sync::MutexGuard<'_, EligibilityStore> {
        self.triggers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn conditions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<CompiledCondition>>> {
        self.conditions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The watcher's compiled condition, compiling it on first use or after
    /// the condition was edited.
    fn condition_for(&self, watcher: &Watcher) -> Arc<CompiledCondition> {
        let mut conditions = self.conditions();
        if let Some(compiled) = conditions.get(&watcher.id)
            && compiled.source() == &watcher.condition
        {
            return Arc::clone(compiled);
        }
        let compiled = Arc::new(CompiledCondition::compile(&watcher.condition));
        conditions.insert(watcher.id.clone(), Arc::clone(&compiled));
        compiled
    }

    /// Check one session against `watcher`.
    pub async fn check_session(
        &self,
        watcher: &Watcher,
        session: &Session,
        mode: CheckMode,
        now: DateTime<Utc>,
    ) -> CheckOutcome {
        let key = TriggerKey::new(&watcher.id, &session.id);
        let policy = CooldownPolicy::from_watcher(watcher);

        let gate = idle_gate(session, watcher.idle_after_seconds, now);
        if let IdleGate::Blocked(block) = gate {
            log_idle_block(watcher, session, block);
            // Counts as "condition false" so until_clear sees the right prior state.
            if mode == CheckMode::Live {
                self.triggers().evaluate(&key, false, policy, None, now);
            }
            return CheckOutcome {
                matched: Some(false),
                triggered: Some(false),
                ..CheckOutcome::skipped(&session.id, SkipReason::IdleGate)
            };
        }

        let Some(target) = session.terminal_target() else {
            tracing::debug!("session {} has no terminal target", session.id);
            return CheckOutcome::skipped(&session.id, SkipReason::NoTerminal);
        };

        let text = self
            .viewports
            .viewport(target, watcher.viewport_lines, now)
            .await;
        if text.is_empty() {
            return CheckOutcome::skipped(&session.id, SkipReason::EmptyCapture);
        }

        let matched = self.condition_for(watcher).is_match(&text);
        let hash = ContentHash::of(&text);

        let triggered = match mode {
            CheckMode::Preview => self
                .triggers()
                .peek(&key, matched, policy, Some(hash), now)
                .fires(),
            CheckMode::Live => {
                let eval = self
                    .triggers()
                    .evaluate(&key, matched, policy, Some(hash), now);
                if eval.decision.fires() {
                    let event = self.emitter.build(
                        watcher,
                        session,
                        &text,
                        hash,
                        eval.trigger_count,
                        now,
                    );
                    self.emitter.publish(&event);
                } else if matched {
                    tracing::debug!(
                        "watcher {} matched session {} but suppressed: {:?}",
                        watcher.id,
                        session.id,
                        eval.decision
                    );
                }
                eval.decision.fires()
            }
        };

        CheckOutcome {
            session_id: session.id.clone(),
            skipped: false,
            skip_reason: None,
            matched: Some(matched),
            triggered: Some(triggered),
            viewport_hash: Some(hash),
        }
    }

    /// One poll cycle: resolve scope, then check every session concurrently.
    pub async fn run_cycle(
        self: &Arc<Self>,
        watcher: &Arc<Watcher>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CycleReport> {
        let sessions = resolve_sessions(watcher, &*self.sessions, &*self.agents)?;
        let mut report = CycleReport {
            sessions: sessions.len(),
            ..CycleReport::default()
        };

        let mut tasks = JoinSet::new();
        for session in sessions {
            let engine = Arc::clone(self);
            let watcher = Arc::clone(watcher);
            tasks.spawn(async move {
                engine
                    .check_session(&watcher, &session, CheckMode::Live, now)
                    .await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    if outcome.skipped {
                        report.skipped += 1;
                    }
                    if outcome.matched == Some(true) {
                        report.matched += 1;
                    }
                    if outcome.triggered == Some(true) {
                        report.fired += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("session check for watcher {} failed: {e}", watcher.id);
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Non-mutating check of every session the watcher currently targets.
    pub async fn preview(
        &self,
        watcher: &Watcher,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<CheckOutcome>> {
        let sessions = resolve_sessions(watcher, &*self.sessions, &*self.agents)?;
        let mut outcomes = Vec::with_capacity(sessions.len());
        for session in &sessions {
            outcomes.push(
                self.check_session(watcher, session, CheckMode::Preview, now)
                    .await,
            );
        }
        Ok(outcomes)
    }

    /// Drop every runtime state entry owned by `watcher_id`.
    pub fn purge_watcher(&self, watcher_id: &str) -> usize {
        self.conditions().remove(watcher_id);
        self.triggers().purge_watcher(watcher_id)
    }

    #[cfg(test)]
    pub fn state_count(&self, watcher_id: &str) -> usize {
        self.triggers().count_for(watcher_id)
    }

    #[cfg(test)]
    pub fn trigger_state(&self, watcher_id: &str, session_id: &str) -> Option<termwatch_core::TriggerState> {
        self.triggers()
            .get(&TriggerKey::new(watcher_id, session_id))
            .cloned()
    }

    #[cfg(test)]
    pub fn compiled_condition(&self, watcher_id: &str) -> Option<Arc<CompiledCondition>> {
        self.conditions().get(watcher_id).cloned()
    }

    /// Clear all runtime state and the viewport cache.
    pub fn reset(&self) {
        self.triggers().clear();
        self.conditions().clear();
        self.viewports.clear();
    }
}

fn log_idle_block(watcher: &Watcher, session: &Session, block: IdleBlock) {
    match block {
        IdleBlock::UnparsableTimestamp => tracing::debug!(
            "watcher {}: session {} has unparsable lastActivityAt {:?}",
            watcher.id,
            session.id,
            session.last_activity_at
        ),
        other => tracing::debug!(
            "watcher {}: session {} held by idle gate ({other:?})",
            watcher.id,
            session.id
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    use crate::bus::{BroadcastBus, BusMessage};
    use crate::emitter::TRIGGER_TOPIC;
    use crate::registry::{JsonRegistry, RegistryData};
    use crate::testing::{FakeTmuxBackend, session, watcher};
    use termwatch_core::{ActivityState, CooldownMode, TriggerCondition};
    use tokio::sync::broadcast;

    struct Harness {
        backend: Arc<FakeTmuxBackend>,
        engine: Arc<WatchEngine>,
        events: broadcast::Receiver<BusMessage>,
    }

    fn harness(backend: FakeTmuxBackend, sessions: Vec<Session>) -> Harness {
        let backend = Arc::new(backend);
        let registry = Arc::new(JsonRegistry::new(RegistryData {
            sessions,
            ..RegistryData::default()
        }));
        let bus = Arc::new(BroadcastBus::new(64));
        let events = bus.subscribe();
        let engine = Arc::new(WatchEngine::new(
            backend.clone(),
            registry.clone(),
            registry,
            bus,
        ));
        Harness {
            backend,
            engine,
            events,
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .expect("valid")
            .with_timezone(&Utc)
    }

    fn secs(n: i64) -> TimeDelta {
        TimeDelta::seconds(n)
    }

    fn drain(rx: &mut broadcast::Receiver<BusMessage>) -> Vec<BusMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn error_scenario_fires_twice_with_time_cooldown() {
        let mut h = harness(FakeTmuxBackend::new(), vec![session("s1", None)]);
        let mut w = watcher("w1", "ERROR");
        w.cooldown_mode = CooldownMode::Time;
        w.cooldown_ms = 5_000;
        let w = Arc::new(w);

        let script = [
            ("ok", t0(), false),
            ("ERROR seen", t0() + secs(3), true),
            ("ERROR seen", t0() + secs(5), false),
            ("ERROR seen", t0() + secs(11), true),
        ];
        for (i, (text, at, expect_fire)) in script.into_iter().enumerate() {
            h.backend.set_capture("tw-s1", text);
            let report = h.engine.run_cycle(&w, at).await.expect("cycle");
            assert_eq!(report.fired, usize::from(expect_fire), "cycle {}", i + 1);
        }

        let events = drain(&mut h.events);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|m| m.topic == TRIGGER_TOPIC));
        assert_eq!(events[1].payload["triggerCount"], 2);
        assert_eq!(
            h.engine.trigger_state("w1", "s1").map(|s| s.trigger_count),
            Some(2)
        );
    }

    #[tokio::test]
    async fn zero_cooldown_dedups_until_content_changes() {
        let h = harness(FakeTmuxBackend::new(), vec![session("s1", None)]);
        let w = Arc::new(watcher("w1", "ERROR"));

        h.backend.set_capture("tw-s1", "ERROR a");
        assert_eq!(h.engine.run_cycle(&w, t0()).await.expect("cycle").fired, 1);
        assert_eq!(
            h.engine
                .run_cycle(&w, t0() + secs(3))
                .await
                .expect("cycle")
                .fired,
            0
        );
        h.backend.set_capture("tw-s1", "ERROR b");
        assert_eq!(
            h.engine
                .run_cycle(&w, t0() + secs(6))
                .await
                .expect("cycle")
                .fired,
            1
        );
    }

    #[tokio::test]
    async fn until_clear_cycle_sequence() {
        let h = harness(FakeTmuxBackend::new(), vec![session("s1", None)]);
        let mut w = watcher("w1", "WAITING");
        w.cooldown_mode = CooldownMode::UntilClear;
        let w = Arc::new(w);

        let script = [
            ("working", false),
            ("WAITING for input", true),
            ("WAITING for input", false),
            ("still WAITING", false),
            ("working again", false),
            ("WAITING again", true),
        ];
        for (i, (text, expect_fire)) in script.into_iter().enumerate() {
            h.backend.set_capture("tw-s1", text);
            let at = t0() + secs(3 * i as i64);
            let report = h.engine.run_cycle(&w, at).await.expect("cycle");
            assert_eq!(report.fired, usize::from(expect_fire), "cycle {}", i + 1);
        }
    }

    #[tokio::test]
    async fn busy_session_never_fires_or_captures() {
        let mut busy = session("s1", None);
        busy.activity_state = ActivityState::Active("working".into());
        busy.last_activity_at = Some("2026-03-01T00:00:00Z".into());
        let h = harness(
            FakeTmuxBackend::new().with_capture("tw-s1", "ERROR everywhere"),
            vec![busy.clone()],
        );
        let mut w = watcher("w1", "ERROR");
        w.idle_after_seconds = 10;

        let outcome = h
            .engine
            .check_session(&w, &busy, CheckMode::Live, t0())
            .await;
        assert!(outcome.skipped);
        assert_eq!(outcome.skip_reason, Some(SkipReason::IdleGate));
        assert_eq!(outcome.triggered, Some(false));
        assert_eq!(h.backend.capture_calls(), 0);
        assert_eq!(
            h.engine
                .trigger_state("w1", "s1")
                .and_then(|s| s.last_condition_state),
            Some(false)
        );
    }

    #[tokio::test]
    async fn idle_gate_failure_clears_until_clear_gate() {
        let mut s = session("s1", None);
        s.last_activity_at = Some("2026-03-01T11:00:00Z".into());
        let h = harness(
            FakeTmuxBackend::new().with_capture("tw-s1", "WAITING"),
            vec![s.clone()],
        );
        let mut w = watcher("w1", "WAITING");
        w.cooldown_mode = CooldownMode::UntilClear;
        w.idle_after_seconds = 60;

        let first = h.engine.check_session(&w, &s, CheckMode::Live, t0()).await;
        assert_eq!(first.triggered, Some(true));

        s.activity_state = ActivityState::Active("working".into());
        let gated = h
            .engine
            .check_session(&w, &s, CheckMode::Live, t0() + secs(3))
            .await;
        assert_eq!(gated.skip_reason, Some(SkipReason::IdleGate));

        s.activity_state = ActivityState::Idle;
        let again = h
            .engine
            .check_session(&w, &s, CheckMode::Live, t0() + secs(6))
            .await;
        assert_eq!(again.triggered, Some(true));
    }

    #[tokio::test]
    async fn capture_failure_skips_without_state() {
        let s = session("s1", None);
        let h = harness(
            FakeTmuxBackend::new().with_capture_error("tw-s1"),
            vec![s.clone()],
        );
        let w = watcher("w1", "ERROR");

        let outcome = h.engine.check_session(&w, &s, CheckMode::Live, t0()).await;
        assert_eq!(outcome.skip_reason, Some(SkipReason::EmptyCapture));
        assert!(outcome.matched.is_none());
        assert_eq!(h.engine.state_count("w1"), 0);
    }

    #[tokio::test]
    async fn one_failing_session_does_not_stop_others() {
        let mut h = harness(
            FakeTmuxBackend::new()
                .with_capture_error("tw-s1")
                .with_capture("tw-s2", "ERROR here"),
            vec![session("s1", None), session("s2", None)],
        );
        let w = Arc::new(watcher("w1", "ERROR"));
        let report = h.engine.run_cycle(&w, t0()).await.expect("cycle");
        assert_eq!(report.sessions, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.fired, 1);
        assert_eq!(drain(&mut h.events).len(), 1);
    }

    #[tokio::test]
    async fn two_watchers_share_one_capture() {
        let h = harness(
            FakeTmuxBackend::new().with_capture("tw-s1", "ERROR and WARN"),
            vec![session("s1", None)],
        );
        let a = Arc::new(watcher("wa", "ERROR"));
        let b = Arc::new(watcher("wb", "WARN"));

        h.engine.run_cycle(&a, t0()).await.expect("cycle");
        h.engine
            .run_cycle(&b, t0() + TimeDelta::milliseconds(1_500))
            .await
            .expect("cycle");
        assert_eq!(h.backend.capture_calls(), 1);
    }

    #[tokio::test]
    async fn preview_never_writes_or_publishes() {
        let mut h = harness(
            FakeTmuxBackend::new().with_capture("tw-s1", "ERROR"),
            vec![session("s1", None)],
        );
        let w = watcher("w1", "ERROR");

        let outcomes = h.engine.preview(&w, t0()).await.expect("preview");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].matched, Some(true));
        assert_eq!(outcomes[0].triggered, Some(true));
        assert!(outcomes[0].viewport_hash.is_some());
        assert_eq!(h.engine.state_count("w1"), 0);
        assert!(drain(&mut h.events).is_empty());

        let again = h.engine.preview(&w, t0()).await.expect("preview");
        assert_eq!(again[0].triggered, Some(true), "preview left no dedup state");
    }

    #[tokio::test]
    async fn preview_reports_live_suppression() {
        let h = harness(
            FakeTmuxBackend::new().with_capture("tw-s1", "ERROR"),
            vec![session("s1", None)],
        );
        let w = Arc::new(watcher("w1", "ERROR"));
        h.engine.run_cycle(&w, t0()).await.expect("cycle");

        let outcomes = h.engine.preview(&w, t0() + secs(1)).await.expect("preview");
        assert_eq!(outcomes[0].matched, Some(true));
        assert_eq!(outcomes[0].triggered, Some(false));
        assert_eq!(
            h.engine.trigger_state("w1", "s1").map(|s| s.trigger_count),
            Some(1)
        );
    }

    #[tokio::test]
    async fn regex_condition_and_scope_wiring() {
        let h = harness(
            FakeTmuxBackend::new()
                .with_capture("tw-s1", "thread 'main' PANICKED")
                .with_capture("tw-s2", "thread 'main' PANICKED"),
            vec![session("s1", Some("a1")), session("s2", Some("a2"))],
        );
        let mut w = watcher("w1", "unused");
        w.condition = TriggerCondition::Regex {
            pattern: "panicked".into(),
            flags: Some("i".into()),
        };
        w.scope = termwatch_core::ScopeKind::Agent;
        w.scope_filter_id = Some("a2".into());

        let report = h.engine.run_cycle(&Arc::new(w), t0()).await.expect("cycle");
        assert_eq!(report.sessions, 1);
        assert_eq!(report.fired, 1);
        assert!(h.engine.trigger_state("w1", "s1").is_none());
    }

    #[tokio::test]
    async fn purge_and_reset() {
        let h = harness(
            FakeTmuxBackend::new()
                .with_capture("tw-s1", "ERROR")
                .with_capture("tw-s2", "ERROR"),
            vec![session("s1", None), session("s2", None)],
        );
        let w = Arc::new(watcher("w1", "ERROR"));
        h.engine.run_cycle(&w, t0()).await.expect("cycle");
        assert_eq!(h.engine.state_count("w1"), 2);
        assert_eq!(h.engine.purge_watcher("w1"), 2);
        assert_eq!(h.engine.purge_watcher("w1"), 0);

        h.engine.run_cycle(&w, t0()).await.expect("cycle");
        h.engine.reset();
        assert_eq!(h.engine.state_count("w1"), 0);
        assert!(h.engine.compiled_condition("w1").is_none());
    }

    #[tokio::test]
    async fn condition_compiled_once_across_cycles() {
        let h = harness(
            FakeTmuxBackend::new()
                .with_capture("tw-s1", "exit 1")
                .with_capture("tw-s2", "exit 2"),
            vec![session("s1", None), session("s2", None)],
        );
        let mut w = watcher("w1", "unused");
        w.condition = TriggerCondition::Regex {
            pattern: r"exit \d".into(),
            flags: None,
        };
        let w = Arc::new(w);

        h.engine.run_cycle(&w, t0()).await.expect("cycle");
        let first = h.engine.compiled_condition("w1").expect("compiled");
        let report = h.engine.run_cycle(&w, t0() + secs(5)).await.expect("cycle");
        assert_eq!(report.matched, 2);
        let second = h.engine.compiled_condition("w1").expect("compiled");
        assert!(Arc::ptr_eq(&first, &second));

        let mut edited = (*w).clone();
        edited.condition = TriggerCondition::Contains {
            pattern: "exit 2".into(),
        };
        let report = h
            .engine
            .run_cycle(&Arc::new(edited), t0() + secs(10))
            .await
            .expect("cycle");
        assert_eq!(report.matched, 1);
        let third = h.engine.compiled_condition("w1").expect("compiled");
        assert!(!Arc::ptr_eq(&second, &third));

        h.engine.purge_watcher("w1");
        assert!(h.engine.compiled_condition("w1").is_none());
    }
}
