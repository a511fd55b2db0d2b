//! JSON-file registry: watcher store, session directory and agent directory
//! backed by one document.
//!
//! ```json
//! { "watchers": [...], "sessions": [...], "agents": [...], "providerConfigs": [...] }
//! ```

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use termwatch_core::{Agent, ProviderConfig, Session, Watcher};

use crate::directory::{AgentDirectory, DirectoryError, SessionDirectory, WatcherStore};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse registry: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("registry has no backing file")]
    NoBackingFile,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryData {
    #[serde(default)]
    pub watchers: Vec<Watcher>,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub provider_configs: Vec<ProviderConfig>,
}

pub struct JsonRegistry {
    path: Option<PathBuf>,
    data: RwLock<RegistryData>,
}

impl JsonRegistry {
    /// In-memory registry with no backing file.
    pub fn new(data: RegistryData) -> Self {
        Self {
            path: None,
            data: RwLock::new(data),
        }
    }

    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let data = read_file(&path)?;
        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// Re-read the backing file. On error the current contents are kept.
    pub fn reload(&self) -> Result<(), RegistryError> {
        let path = self.path.as_ref().ok_or(RegistryError::NoBackingFile)?;
        let fresh = read_file(path)?;
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        *guard = fresh;
        drop(guard);
        self.data.clear_poison();
        Ok(())
    }

    #[cfg(test)]
    pub fn update(&self, f: impl FnOnce(&mut RegistryData)) {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut *guard);
    }

    pub fn snapshot(&self) -> RegistryData {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // Lookups refuse to serve from a registry a panicking writer left behind.
    fn read<T>(&self, f: impl FnOnce(&RegistryData) -> T) -> Result<T, DirectoryError> {
        let guard = self
            .data
            .read()
            .map_err(|_| DirectoryError::Unavailable("registry lock poisoned".into()))?;
        Ok(f(&*guard))
    }
}

fn read_file(path: &Path) -> Result<RegistryData, RegistryError> {
    let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

impl WatcherStore for JsonRegistry {
    fn get_watcher(&self, id: &str) -> Result<Option<Watcher>, DirectoryError> {
        self.read(|d| d.watchers.iter().find(|w| w.id == id).cloned())
    }

    fn list_enabled_watchers(&self) -> Result<Vec<Watcher>, DirectoryError> {
        self.read(|d| d.watchers.iter().filter(|w| w.enabled).cloned().collect())
    }
}

impl SessionDirectory for JsonRegistry {
    fn list_active_sessions(&self, project_id: &str) -> Result<Vec<Session>, DirectoryError> {
        self.read(|d| {
            d.sessions
                .iter()
                .filter(|s| s.project_id == project_id)
                .cloned()
                .collect()
        })
    }
}

impl AgentDirectory for JsonRegistry {
    fn list_agents(&self, project_id: &str) -> Result<Vec<Agent>, DirectoryError> {
        self.read(|d| {
            d.agents
                .iter()
                .filter(|a| a.project_id == project_id)
                .cloned()
                .collect()
        })
    }

    fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, DirectoryError> {
        self.read(|d| d.agents.iter().find(|a| a.id == agent_id).cloned())
    }

    fn get_provider_config(
        &self,
        config_id: &str,
    ) -> Result<Option<ProviderConfig>, DirectoryError> {
        self.read(|d| d.provider_configs.iter().find(|c| c.id == config_id).cloned())
    }

    fn list_provider_configs_by_profile(
        &self,
        profile_id: &str,
    ) -> Result<Vec<ProviderConfig>, DirectoryError> {
        self.read(|d| {
            d.provider_configs
                .iter()
                .filter(|c| c.profile_id == profile_id)
                .cloned()
                .collect()
        })
    }
}
