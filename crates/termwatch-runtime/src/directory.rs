//! Collaborator contracts consumed by the watch engine.
//!
//! Everything here is read-only from the engine's point of view. Lookups are
//! synchronous; implementations are expected to answer from memory or a
//! local store.

use thiserror::Error;

use termwatch_core::{Agent, ProviderConfig, Session, Watcher};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Owner of watcher configuration.
pub trait WatcherStore: Send + Sync {
    fn get_watcher(&self, id: &str) -> Result<Option<Watcher>, DirectoryError>;
    /// Used once at process start to seed the scheduler.
    fn list_enabled_watchers(&self) -> Result<Vec<Watcher>, DirectoryError>;
}

pub trait SessionDirectory: Send + Sync {
    fn list_active_sessions(&self, project_id: &str) -> Result<Vec<Session>, DirectoryError>;
}

/// Agents, profiles and provider configurations.
pub trait AgentDirectory: Send + Sync {
    fn list_agents(&self, project_id: &str) -> Result<Vec<Agent>, DirectoryError>;
    fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, DirectoryError>;
    fn get_provider_config(&self, config_id: &str)
    -> Result<Option<ProviderConfig>, DirectoryError>;
    fn list_provider_configs_by_profile(
        &self,
        profile_id: &str,
    ) -> Result<Vec<ProviderConfig>, DirectoryError>;
}
