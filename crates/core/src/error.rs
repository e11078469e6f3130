use crate::types::{AgentId, ExecutionId, ExecutionStatus, FlowId, NodeId};
use thiserror::Error;

/// Structural problems that keep a flow out of the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("flow has no nodes")]
    EmptyFlow,

    #[error("duplicate node id '{0}'")]
    DuplicateNode(NodeId),

    #[error("unknown dependency: node '{node}' depends on '{dependency}' which does not exist")]
    UnknownDependency { node: NodeId, dependency: NodeId },

    #[error("cycle detected involving node '{node}'")]
    CycleDetected { node: NodeId },

    #[error("invalid entry point '{0}'")]
    InvalidEntryPoint(NodeId),

    #[error("invalid exit point '{0}'")]
    InvalidExitPoint(NodeId),
}

/// Agent registration and resolution failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("agent '{0}' not found")]
    NotFound(AgentId),

    #[error("agent '{0}' is inactive")]
    Inactive(AgentId),

    #[error("node '{0}' has no agent assigned")]
    Unassigned(NodeId),

    #[error("invalid agent endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("invalid capability '{0}'")]
    InvalidCapability(String),

    #[error("agent '{0}' declares no capabilities")]
    NoCapabilities(AgentId),
}

/// Errors surfaced by agent directory mutations
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

/// Why a dispatch to an agent did not produce an output
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("agent call timed out after {0}s")]
    Timeout(u64),

    #[error("agent call failed: {0}")]
    Transport(String),

    #[error("agent returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid agent response: {0}")]
    InvalidResponse(String),

    #[error("dispatch cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Rejected execution status change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("execution {execution_id}: invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub execution_id: ExecutionId,
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// Errors surfaced by the orchestrator's public operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("flow '{0}' not found")]
    FlowNotFound(FlowId),

    #[error("flow '{0}' already exists")]
    FlowExists(FlowId),

    #[error("flow id mismatch: expected '{expected}', got '{actual}'")]
    FlowIdMismatch { expected: FlowId, actual: FlowId },

    #[error("flow validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to load flows: {0:#}")]
    FlowLoad(#[source] anyhow::Error),

    #[error("persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages_name_the_offender() {
        let err = ValidationError::UnknownDependency {
            node: NodeId::new("b"),
            dependency: NodeId::new("ghost"),
        };
        let msg = err.to_string();
        assert!(msg.contains("unknown dependency"));
        assert!(msg.contains("'b'"));
        assert!(msg.contains("'ghost'"));

        let err = ValidationError::CycleDetected {
            node: NodeId::new("a"),
        };
        assert!(err.to_string().contains("cycle detected"));
    }

    #[test]
    fn test_persistence_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("disk full").context("Failed to commit");
        let err = OrchestratorError::from(inner);
        let msg = err.to_string();
        assert!(msg.contains("Failed to commit"));
        assert!(msg.contains("disk full"));
    }
}
