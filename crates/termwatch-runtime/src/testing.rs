//! Shared fakes for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use termwatch_core::{
    ActivityState, CooldownMode, ScopeKind, Session, TriggerCondition, Watcher,
};
use termwatch_tmux::{TmuxCommandRunner, TmuxError};

/// Blocks captures until released, so a cycle can be held open.
#[derive(Default)]
pub struct CaptureGate {
    released: Mutex<bool>,
    cv: Condvar,
    entered: AtomicUsize,
}

impl CaptureGate {
    fn wait(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut released = self.released.lock().expect("gate lock");
        while !*released {
            released = self.cv.wait(released).expect("gate wait");
        }
    }

    pub fn release(&self) {
        *self.released.lock().expect("gate lock") = true;
        self.cv.notify_all();
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

/// Fake tmux backend answering `capture-pane` from a per-target table.
#[derive(Default)]
pub struct FakeTmuxBackend {
    captures: Mutex<HashMap<String, String>>,
    capture_errors: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    gate: Option<Arc<CaptureGate>>,
}

impl FakeTmuxBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capture(self, target: &str, text: &str) -> Self {
        self.set_capture(target, text);
        self
    }

    pub fn with_capture_error(self, target: &str) -> Self {
        self.capture_errors
            .lock()
            .expect("lock")
            .insert(target.to_string());
        self
    }

    pub fn with_gate(mut self, gate: Arc<CaptureGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn set_capture(&self, target: &str, text: &str) {
        self.captures
            .lock()
            .expect("lock")
            .insert(target.to_string(), text.to_string());
    }

    pub fn capture_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TmuxCommandRunner for FakeTmuxBackend {
    fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
        if args.first() != Some(&"capture-pane") {
            return Err(TmuxError::CommandFailed(format!(
                "unexpected command: {args:?}"
            )));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        let target = args
            .iter()
            .zip(args.iter().skip(1))
            .find(|(a, _)| **a == "-t")
            .map(|(_, b)| *b)
            .unwrap_or("");
        if self.capture_errors.lock().expect("lock").contains(target) {
            return Err(TmuxError::CommandFailed(format!(
                "can't find session: {target}"
            )));
        }
        Ok(self
            .captures
            .lock()
            .expect("lock")
            .get(target)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn watcher(id: &str, pattern: &str) -> Watcher {
    Watcher {
        id: id.into(),
        project_id: "p1".into(),
        name: format!("{id} watcher"),
        enabled: true,
        scope: ScopeKind::All,
        scope_filter_id: None,
        poll_interval_ms: 60_000,
        viewport_lines: 40,
        idle_after_seconds: 0,
        condition: TriggerCondition::Contains {
            pattern: pattern.into(),
        },
        cooldown_ms: 0,
        cooldown_mode: CooldownMode::Time,
        event_name: format!("{id}.fired"),
    }
}

/// Idle session whose terminal target is `tw-{id}`.
pub fn session(id: &str, agent: Option<&str>) -> Session {
    Session {
        id: id.into(),
        project_id: "p1".into(),
        agent_id: agent.map(String::from),
        tmux_session_id: Some(format!("tw-{id}")),
        activity_state: ActivityState::Idle,
        last_activity_at: None,
    }
}
