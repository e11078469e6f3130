// Core of the Spine multi-agent flow engine

pub mod config;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod storage;
pub mod types;

pub use config::{DirectoryConfig, OrchestratorConfig};
pub use dispatch::{AgentClient, DispatchRequest, HttpAgentClient};
pub use error::{
    AgentError, DirectoryError, DispatchError, OrchestratorError, OrchestratorResult, TransitionError,
    ValidationError,
};
pub use orchestrator::Orchestrator;
pub use registry::AgentDirectory;
pub use storage::{MemoryStateStore, RedbStateStore, StateStore};
pub use types::*;
