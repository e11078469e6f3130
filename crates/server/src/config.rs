use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use spine_core::{
    AgentClient, AgentDirectory, DirectoryConfig, HttpAgentClient, MemoryStateStore, Orchestrator,
    OrchestratorConfig, RedbStateStore, StateStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpineConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub registry: DirectoryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Redb,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_index_file() -> String {
    "spine.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            index_file: default_index_file(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl SpineConfig {
    /// Read `config_path` if it exists, otherwise use defaults
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the redb file path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }
}

/// Services shared by the running process
#[derive(Clone)]
pub struct Services {
    pub directory: Arc<AgentDirectory>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Services {
    pub fn new(config: &SpineConfig) -> Result<Self> {
        let store: Arc<dyn StateStore> = match config.storage.backend {
            StorageBackend::Redb => Arc::new(
                RedbStateStore::new(config.index_path()).context("Failed to create state store")?,
            ),
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory state store, state will not survive a restart");
                Arc::new(MemoryStateStore::new())
            }
        };

        let client: Arc<dyn AgentClient> = Arc::new(HttpAgentClient::new(
            config.orchestrator.dispatch_timeout(),
            config.registry.health_check_timeout(),
        )?);

        let directory = Arc::new(AgentDirectory::new(
            store.clone(),
            client.clone(),
            config.registry.clone(),
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            store,
            directory.clone(),
            client,
            config.orchestrator.clone(),
        ));

        Ok(Self {
            directory,
            orchestrator,
        })
    }
}
