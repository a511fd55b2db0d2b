//! Trigger eligibility state machine.
//!
//! Per `(watcher, session)` runtime state deciding whether a matched
//! condition actually fires. The state is implicit in the stored fields:
//!
//! | matched | mode          | prior state                              | decision          |
//! |---------|---------------|------------------------------------------|-------------------|
//! | false   | `until_clear` | any                                      | clear gate        |
//! | false   | `time`        | any                                      | none              |
//! | true    | `time`        | `now < cooldown_until`                   | cooling down      |
//! | true    | `time`        | `cooldown_ms == 0`, hash == last hash    | unchanged content |
//! | true    | `time`        | otherwise                                | fire              |
//! | true    | `until_clear` | last condition state was true            | already open      |
//! | true    | `until_clear` | gate still set                           | awaiting clear    |
//! | true    | `until_clear` | otherwise                                | fire              |
//!
//! Pure, testable state machine with no IO or async dependencies.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};

use crate::hash::ContentHash;
use crate::types::{CooldownMode, Watcher};

// ─── Keys & Policy ────────────────────────────────────────────────

/// Identifies one runtime state entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerKey {
    pub watcher_id: String,
    pub session_id: String,
}

impl TriggerKey {
    pub fn new(watcher_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            watcher_id: watcher_id.into(),
            session_id: session_id.into(),
        }
    }
}

/// Cooldown settings copied off a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub mode: CooldownMode,
    pub cooldown_ms: u64,
}

impl CooldownPolicy {
    pub fn from_watcher(watcher: &Watcher) -> Self {
        Self {
            mode: watcher.cooldown_mode,
            cooldown_ms: watcher.cooldown_ms,
        }
    }
}

// ─── State ────────────────────────────────────────────────────────

/// Re-fire gate set by the last fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cooldown {
    /// `time` mode: suppressed while `now < until`.
    Until(DateTime<Utc>),
    /// `until_clear` mode: suppressed until the condition is observed false.
    UntilClear,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerState {
    pub cooldown: Option<Cooldown>,
    /// `None` until the first evaluation.
    pub last_condition_state: Option<bool>,
    pub last_triggered_hash: Option<ContentHash>,
    /// Monotonic while the watcher runs.
    pub trigger_count: u64,
}

/// Why a matched condition did not fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    CoolingDown,
    UnchangedContent,
    AlreadyOpen,
    AwaitingClear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Condition did not match.
    NotMatched,
    Suppressed(SuppressReason),
    Fire,
}

impl Decision {
    pub fn fires(self) -> bool {
        matches!(self, Self::Fire)
    }
}

/// Result of applying one observation to a [`TriggerState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    /// An `until_clear` gate was cleared by this observation.
    pub cleared: bool,
    /// `trigger_count` after this observation.
    pub trigger_count: u64,
}

fn cooldown_end(now: DateTime<Utc>, cooldown_ms: u64) -> DateTime<Utc> {
    let delta = i64::try_from(cooldown_ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .unwrap_or(TimeDelta::MAX);
    now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl TriggerState {
    /// Decide against the current (previous) state without writing.
    ///
    /// `hash` is the viewport fingerprint, `None` when nothing was captured.
    pub fn decide(
        &self,
        matched: bool,
        policy: CooldownPolicy,
        hash: Option<ContentHash>,
        now: DateTime<Utc>,
    ) -> Decision {
        if !matched {
            return Decision::NotMatched;
        }
        match policy.mode {
            CooldownMode::Time => {
                if let Some(Cooldown::Until(until)) = self.cooldown
                    && now < until
                {
                    return Decision::Suppressed(SuppressReason::CoolingDown);
                }
                if policy.cooldown_ms == 0
                    && hash.is_some()
                    && hash == self.last_triggered_hash
                {
                    return Decision::Suppressed(SuppressReason::UnchangedContent);
                }
                Decision::Fire
            }
            CooldownMode::UntilClear => {
                if self.last_condition_state == Some(true) {
                    Decision::Suppressed(SuppressReason::AlreadyOpen)
                } else if self.cooldown.is_some() {
                    Decision::Suppressed(SuppressReason::AwaitingClear)
                } else {
                    Decision::Fire
                }
            }
        }
    }

    /// Apply one observation: decide on the previous state, then record
    /// `matched` as the new last condition state and update the gate.
    pub fn apply(
        &mut self,
        matched: bool,
        policy: CooldownPolicy,
        hash: Option<ContentHash>,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let decision = self.decide(matched, policy, hash, now);
        self.last_condition_state = Some(matched);

        let mut cleared = false;
        if !matched && policy.mode == CooldownMode::UntilClear && self.cooldown.is_some() {
            self.cooldown = None;
            cleared = true;
        }

        if decision.fires() {
            self.cooldown = Some(match policy.mode {
                CooldownMode::Time => Cooldown::Until(cooldown_end(now, policy.cooldown_ms)),
                CooldownMode::UntilClear => Cooldown::UntilClear,
            });
            if hash.is_some() {
                self.last_triggered_hash = hash;
            }
            self.trigger_count = self.trigger_count.saturating_add(1);
        }

        Evaluation {
            decision,
            cleared,
            trigger_count: self.trigger_count,
        }
    }
}

// ─── Store ────────────────────────────────────────────────────────

/// Owned map of every runtime trigger state.
///
/// Entries are created lazily on first evaluation and removed per watcher
/// with [`EligibilityStore::purge_watcher`].
#[derive(Debug, Default)]
pub struct EligibilityStore {
    states: HashMap<TriggerKey, TriggerState>,
}

impl EligibilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(
        &mut self,
        key: &TriggerKey,
        matched: bool,
        policy: CooldownPolicy,
        hash: Option<ContentHash>,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let state = self.states.entry(key.clone()).or_default();
        let eval = state.apply(matched, policy, hash, now);
        if eval.cleared {
            tracing::info!(
                "trigger gate cleared for watcher {} session {}",
                key.watcher_id,
                key.session_id
            );
        }
        eval
    }

    /// Read-only decision for previews. Never creates an entry.
    pub fn peek(
        &self,
        key: &TriggerKey,
        matched: bool,
        policy: CooldownPolicy,
        hash: Option<ContentHash>,
        now: DateTime<Utc>,
    ) -> Decision {
        match self.states.get(key) {
            Some(state) => state.decide(matched, policy, hash, now),
            None => TriggerState::default().decide(matched, policy, hash, now),
        }
    }

    pub fn get(&self, key: &TriggerKey) -> Option<&TriggerState> {
        self.states.get(key)
    }

    /// Remove every entry owned by `watcher_id`. Returns the count removed.
    pub fn purge_watcher(&mut self, watcher_id: &str) -> usize {
        let before = self.states.len();
        self.states.retain(|k, _| k.watcher_id != watcher_id);
        before - self.states.len()
    }

    /// Number of entries owned by `watcher_id`.
    pub fn count_for(&self, watcher_id: &str) -> usize {
        self.states
            .keys()
            .filter(|k| k.watcher_id == watcher_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .expect("valid")
            .with_timezone(&Utc)
    }

    fn ms(n: i64) -> TimeDelta {
        TimeDelta::milliseconds(n)
    }

    fn time(cooldown_ms: u64) -> CooldownPolicy {
        CooldownPolicy {
            mode: CooldownMode::Time,
            cooldown_ms,
        }
    }

    fn until_clear() -> CooldownPolicy {
        CooldownPolicy {
            mode: CooldownMode::UntilClear,
            cooldown_ms: 0,
        }
    }

    fn h(s: &str) -> Option<ContentHash> {
        Some(ContentHash::of(s))
    }

    #[test]
    fn time_mode_suppresses_within_window() {
        let mut st = TriggerState::default();
        let p = time(5_000);
        assert_eq!(st.apply(true, p, h("a"), t0()).decision, Decision::Fire);
        assert_eq!(
            st.apply(true, p, h("b"), t0() + ms(4_999)).decision,
            Decision::Suppressed(SuppressReason::CoolingDown)
        );
        assert_eq!(st.apply(true, p, h("b"), t0() + ms(5_000)).decision, Decision::Fire);
        assert_eq!(st.trigger_count, 2);
    }

    #[test]
    fn time_mode_positive_cooldown_refires_unchanged_content() {
        let mut st = TriggerState::default();
        let p = time(1_000);
        assert!(st.apply(true, p, h("same"), t0()).decision.fires());
        assert!(st.apply(true, p, h("same"), t0() + ms(1_500)).decision.fires());
    }

    #[test]
    fn zero_cooldown_dedups_identical_content() {
        let mut st = TriggerState::default();
        let p = time(0);
        assert!(st.apply(true, p, h("ERROR x"), t0()).decision.fires());
        assert_eq!(
            st.apply(true, p, h("ERROR x"), t0() + ms(10)).decision,
            Decision::Suppressed(SuppressReason::UnchangedContent)
        );
        assert!(st.apply(true, p, h("ERROR y"), t0() + ms(20)).decision.fires());
        assert_eq!(st.trigger_count, 2);
    }

    #[test]
    fn time_mode_false_only_records_state() {
        let mut st = TriggerState::default();
        let p = time(5_000);
        st.apply(true, p, h("a"), t0());
        let cooldown = st.cooldown;
        let eval = st.apply(false, p, h("b"), t0() + ms(1));
        assert_eq!(eval.decision, Decision::NotMatched);
        assert!(!eval.cleared);
        assert_eq!(st.cooldown, cooldown);
        assert_eq!(st.last_condition_state, Some(false));
    }

    #[test]
    fn until_clear_edge_triggered() {
        let mut st = TriggerState::default();
        let p = until_clear();
        assert_eq!(st.apply(false, p, h("x"), t0()).decision, Decision::NotMatched);
        assert!(st.apply(true, p, h("y"), t0() + ms(1)).decision.fires());
        assert_eq!(
            st.apply(true, p, h("z"), t0() + ms(2)).decision,
            Decision::Suppressed(SuppressReason::AlreadyOpen)
        );
        assert_eq!(
            st.apply(true, p, h("z"), t0() + ms(3)).decision,
            Decision::Suppressed(SuppressReason::AlreadyOpen)
        );
        let eval = st.apply(false, p, h("w"), t0() + ms(4));
        assert!(eval.cleared);
        assert_eq!(st.cooldown, None);
        assert!(st.apply(true, p, h("y"), t0() + ms(5)).decision.fires());
        assert_eq!(st.trigger_count, 2);
    }

    #[test]
    fn until_clear_first_observation_true_fires() {
        let mut st = TriggerState::default();
        assert!(st.apply(true, until_clear(), h("y"), t0()).decision.fires());
        assert_eq!(st.cooldown, Some(Cooldown::UntilClear));
    }

    #[test]
    fn until_clear_gate_without_open_state_awaits_clear() {
        let mut st = TriggerState {
            cooldown: Some(Cooldown::UntilClear),
            last_condition_state: None,
            ..TriggerState::default()
        };
        assert_eq!(
            st.apply(true, until_clear(), h("y"), t0()).decision,
            Decision::Suppressed(SuppressReason::AwaitingClear)
        );
    }

    #[test]
    fn decide_reads_previous_state_before_write() {
        let mut st = TriggerState::default();
        let eval = st.apply(true, until_clear(), None, t0());
        assert!(eval.decision.fires());
        assert_eq!(st.last_condition_state, Some(true));
    }

    #[test]
    fn fire_records_hash_and_count() {
        let mut st = TriggerState::default();
        let eval = st.apply(true, time(0), h("abc"), t0());
        assert_eq!(eval.trigger_count, 1);
        assert_eq!(st.last_triggered_hash, h("abc"));
        assert_eq!(st.cooldown, Some(Cooldown::Until(t0())));
    }

    #[test]
    fn huge_cooldown_saturates() {
        let mut st = TriggerState::default();
        st.apply(true, time(u64::MAX), h("a"), t0());
        assert_eq!(
            st.decide(true, time(u64::MAX), h("b"), t0() + ms(1_000_000)),
            Decision::Suppressed(SuppressReason::CoolingDown)
        );
    }

    #[test]
    fn store_creates_lazily_and_purges_per_watcher() {
        let mut store = EligibilityStore::new();
        let a1 = TriggerKey::new("w1", "s1");
        let a2 = TriggerKey::new("w1", "s2");
        let b1 = TriggerKey::new("w10", "s1");
        assert!(store.is_empty());

        store.evaluate(&a1, true, time(0), h("x"), t0());
        store.evaluate(&a2, false, time(0), h("x"), t0());
        store.evaluate(&b1, true, time(0), h("x"), t0());
        assert_eq!(store.len(), 3);
        assert_eq!(store.count_for("w1"), 2);

        assert_eq!(store.purge_watcher("w1"), 2);
        assert_eq!(store.count_for("w1"), 0);
        assert!(store.get(&b1).is_some(), "prefix-sharing watcher untouched");
        assert_eq!(store.purge_watcher("w1"), 0);
    }

    #[test]
    fn peek_never_writes() {
        let store = EligibilityStore::new();
        let key = TriggerKey::new("w1", "s1");
        assert!(store.peek(&key, true, time(0), h("x"), t0()).fires());
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn peek_reflects_existing_state() {
        let mut store = EligibilityStore::new();
        let key = TriggerKey::new("w1", "s1");
        store.evaluate(&key, true, time(0), h("x"), t0());
        assert_eq!(
            store.peek(&key, true, time(0), h("x"), t0() + ms(1)),
            Decision::Suppressed(SuppressReason::UnchangedContent)
        );
        assert_eq!(store.get(&key).map(|s| s.trigger_count), Some(1));
    }
}
