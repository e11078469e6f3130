use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Orchestrator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Per-call timeout for `POST {endpoint}/execute`
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,

    /// Upper bound on agent calls in flight across all executions
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,

    /// Directory of `*.json` / `*.toml` flow files loaded at startup
    #[serde(default)]
    pub flows_dir: Option<PathBuf>,
}

fn default_dispatch_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_dispatches() -> usize {
    16
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
            flows_dir: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}

/// Agent directory tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_health_check_timeout_secs() -> u64 {
    5
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            health_check_timeout_secs: default_health_check_timeout_secs(),
        }
    }
}

impl DirectoryConfig {
    pub fn health_check_interval(&self) -> Duration {
        // A zero period would make tokio's interval panic
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }
}
