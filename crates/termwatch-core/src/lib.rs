//! termwatch-core: watcher domain types and the pure decision logic.
//! Condition matching, content hashing, the idle gate and the trigger
//! eligibility state machine. No IO, no async; every time value is passed in.

pub mod condition;
pub mod eligibility;
pub mod hash;
pub mod idle;
pub mod types;

pub use condition::{CompiledCondition, ConditionError, TriggerCondition, match_condition};
pub use eligibility::{
    Cooldown, CooldownPolicy, Decision, EligibilityStore, Evaluation, SuppressReason, TriggerKey,
    TriggerState,
};
pub use hash::ContentHash;
pub use idle::{IdleBlock, IdleGate, idle_gate};
pub use types::{
    ActivityState, Agent, CooldownMode, ProviderConfig, ScopeKind, Session, Watcher, WatcherScope,
};
