//! Idle gate: optional precondition applied before a session is captured.

use chrono::{DateTime, TimeDelta, Utc};

use crate::types::Session;

/// Why a session failed the idle gate this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleBlock {
    /// `activityState` is anything but `idle`.
    Busy,
    MissingTimestamp,
    UnparsableTimestamp,
    /// Idle, but not for `idleAfterSeconds` yet.
    TooRecent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleGate {
    /// `idleAfterSeconds == 0`.
    Disabled,
    Passed,
    Blocked(IdleBlock),
}

impl IdleGate {
    pub fn allows_capture(self) -> bool {
        !matches!(self, Self::Blocked(_))
    }
}

/// Evaluate the idle gate for `session` at `now`.
pub fn idle_gate(session: &Session, idle_after_seconds: u64, now: DateTime<Utc>) -> IdleGate {
    if idle_after_seconds == 0 {
        return IdleGate::Disabled;
    }
    if !session.activity_state.is_idle() {
        return IdleGate::Blocked(IdleBlock::Busy);
    }
    let Some(raw) = session.last_activity_at.as_deref() else {
        return IdleGate::Blocked(IdleBlock::MissingTimestamp);
    };
    let Ok(last) = DateTime::parse_from_rfc3339(raw.trim()) else {
        return IdleGate::Blocked(IdleBlock::UnparsableTimestamp);
    };
    let required = i64::try_from(idle_after_seconds)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX);
    if now.signed_duration_since(last.with_timezone(&Utc)) >= required {
        IdleGate::Passed
    } else {
        IdleGate::Blocked(IdleBlock::TooRecent)
    }
}
