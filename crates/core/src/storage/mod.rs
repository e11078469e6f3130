// Durable state for flows, agents, executions, and node results

pub mod memory;
pub mod redb_store;

pub use memory::MemoryStateStore;
pub use redb_store::RedbStateStore;

use crate::types::{
    AgentId, AgentInfo, ExecutionContext, ExecutionId, ExecutionStatus, FlowId, FlowRecord,
    NodeExecutionResult, NodeId, StatusUpdate,
};
use anyhow::Result;

/// Storage contract the orchestrator and agent directory depend on.
///
/// Implementations must enforce the execution state machine in
/// [`StateStore::update_execution_status`] and stamp `completed_at` on
/// terminal transitions.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace an execution context
    async fn put_execution(&self, context: &ExecutionContext) -> Result<()>;

    /// Get an execution context by id
    async fn get_execution(&self, execution_id: &ExecutionId) -> Result<Option<ExecutionContext>>;

    /// Apply a status transition and return the updated context
    async fn update_execution_status(
        &self,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        update: StatusUpdate,
    ) -> Result<ExecutionContext>;

    /// List executions newest-first, optionally restricted to one flow
    async fn list_executions(
        &self,
        flow_id: Option<&FlowId>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExecutionContext>>;

    /// Upsert a node result keyed by `(execution_id, node_id)`
    async fn put_node_result(&self, result: &NodeExecutionResult) -> Result<()>;

    async fn get_node_result(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
    ) -> Result<Option<NodeExecutionResult>>;

    /// All node results of an execution, oldest first
    async fn list_node_results(&self, execution_id: &ExecutionId)
        -> Result<Vec<NodeExecutionResult>>;

    /// Insert or replace a flow definition
    async fn put_flow(&self, flow: &FlowRecord) -> Result<()>;

    async fn get_flow(&self, flow_id: &FlowId) -> Result<Option<FlowRecord>>;

    async fn list_flows(&self, active_only: bool) -> Result<Vec<FlowRecord>>;

    /// Soft delete; returns false if the flow is unknown
    async fn deactivate_flow(&self, flow_id: &FlowId) -> Result<bool>;

    /// Insert or replace an agent
    async fn put_agent(&self, agent: &AgentInfo) -> Result<()>;

    async fn get_agent(&self, agent_id: &AgentId) -> Result<Option<AgentInfo>>;

    /// List agents, newest first
    async fn list_agents(&self, active_only: bool) -> Result<Vec<AgentInfo>>;

    /// Remove an agent; returns false if it was not stored
    async fn delete_agent(&self, agent_id: &AgentId) -> Result<bool>;
}

/// Filter, order newest-first, and page a set of executions
pub(crate) fn page_executions(
    executions: impl IntoIterator<Item = ExecutionContext>,
    flow_id: Option<&FlowId>,
    limit: usize,
    offset: usize,
) -> Vec<ExecutionContext> {
    let mut executions: Vec<ExecutionContext> = executions
        .into_iter()
        .filter(|e| flow_id.map_or(true, |id| &e.flow_id == id))
        .collect();

    executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    executions.into_iter().skip(offset).take(limit).collect()
}
