//! Session scope resolution: maps a watcher's scope onto the concrete
//! sessions it applies to this cycle.

use std::collections::{HashMap, HashSet};

use termwatch_core::{Agent, ProviderConfig, Session, Watcher, WatcherScope};

use crate::directory::{AgentDirectory, DirectoryError, SessionDirectory};

// ─── Provider resolution ──────────────────────────────────────────

/// Ordered ways of finding an agent's effective provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderStrategy {
    /// The agent's active provider-configuration binding.
    ActiveBinding,
    /// First provider configuration registered under the agent's profile.
    ProfileDefault,
}

const PROVIDER_STRATEGIES: [ProviderStrategy; 2] =
    [ProviderStrategy::ActiveBinding, ProviderStrategy::ProfileDefault];

/// Per-cycle memo of provider lookups. Lookup failures are cached as
/// "unresolved" so one broken reference costs one call per cycle.
struct ProviderLookup<'a> {
    agents: &'a dyn AgentDirectory,
    configs: HashMap<String, Option<ProviderConfig>>,
    profiles: HashMap<String, Option<ProviderConfig>>,
}

impl<'a> ProviderLookup<'a> {
    fn new(agents: &'a dyn AgentDirectory) -> Self {
        Self {
            agents,
            configs: HashMap::new(),
            profiles: HashMap::new(),
        }
    }

    fn provider_of(&mut self, agent: &Agent) -> Option<String> {
        PROVIDER_STRATEGIES
            .iter()
            .find_map(|strategy| self.apply(*strategy, agent))
    }

    fn apply(&mut self, strategy: ProviderStrategy, agent: &Agent) -> Option<String> {
        let config = match strategy {
            ProviderStrategy::ActiveBinding => self.config(agent.provider_config_id.as_deref()?),
            ProviderStrategy::ProfileDefault => self.profile_default(agent.profile_id.as_deref()?),
        };
        config.map(|c| c.provider_id)
    }

    fn config(&mut self, config_id: &str) -> Option<ProviderConfig> {
        let agents = self.agents;
        self.configs
            .entry(config_id.to_string())
            .or_insert_with(|| match agents.get_provider_config(config_id) {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!("provider config lookup failed for {config_id}: {e}");
                    None
                }
            })
            .clone()
    }

    fn profile_default(&mut self, profile_id: &str) -> Option<ProviderConfig> {
        let agents = self.agents;
        self.profiles
            .entry(profile_id.to_string())
            .or_insert_with(|| match agents.list_provider_configs_by_profile(profile_id) {
                Ok(configs) => configs.into_iter().next(),
                Err(e) => {
                    tracing::warn!("provider configs lookup failed for profile {profile_id}: {e}");
                    None
                }
            })
            .clone()
    }
}

// ─── Resolver ─────────────────────────────────────────────────────

/// Sessions `watcher` applies to right now.
///
/// A misconfigured scope resolves to nothing with a warning. Only a failure
/// to list the project's sessions or agents is an error.
pub fn resolve_sessions(
    watcher: &Watcher,
    sessions: &dyn SessionDirectory,
    agents: &dyn AgentDirectory,
) -> Result<Vec<Session>, DirectoryError> {
    let target = watcher.target();
    if let WatcherScope::Invalid(reason) = &target {
        tracing::warn!("watcher {} has an invalid scope: {reason}", watcher.id);
        return Ok(Vec::new());
    }

    let active = sessions.list_active_sessions(&watcher.project_id)?;
    let agent_ids: HashSet<String> = match target {
        WatcherScope::All => return Ok(active),
        WatcherScope::Agent(agent_id) => HashSet::from([agent_id]),
        WatcherScope::Profile(profile_id) => agents
            .list_agents(&watcher.project_id)?
            .into_iter()
            .filter(|a| a.profile_id.as_deref() == Some(profile_id.as_str()))
            .map(|a| a.id)
            .collect(),
        WatcherScope::Provider(provider_id) => {
            let mut lookup = ProviderLookup::new(agents);
            agents
                .list_agents(&watcher.project_id)?
                .into_iter()
                .filter(|a| lookup.provider_of(a).as_deref() == Some(provider_id.as_str()))
                .map(|a| a.id)
                .collect()
        }
        WatcherScope::Invalid(_) => return Ok(Vec::new()),
    };

    if agent_ids.is_empty() {
        tracing::debug!("watcher {} scope matched no agents", watcher.id);
    }

    Ok(active
        .into_iter()
        .filter(|s| s.agent_id.as_ref().is_some_and(|id| agent_ids.contains(id)))
        .collect())
}
