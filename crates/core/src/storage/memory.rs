use super::{page_executions, StateStore};
use crate::types::{
    AgentId, AgentInfo, ExecutionContext, ExecutionId, ExecutionStatus, FlowId, FlowRecord,
    NodeExecutionResult, NodeId, StatusUpdate,
};
use anyhow::{Context, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local store for tests and single-node development
#[derive(Default)]
pub struct MemoryStateStore {
    executions: RwLock<HashMap<ExecutionId, ExecutionContext>>,
    node_results: RwLock<HashMap<(ExecutionId, NodeId), NodeExecutionResult>>,
    flows: RwLock<HashMap<FlowId, FlowRecord>>,
    agents: RwLock<HashMap<AgentId, AgentInfo>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn put_execution(&self, context: &ExecutionContext) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(context.execution_id, context.clone());
        Ok(())
    }

    async fn get_execution(&self, execution_id: &ExecutionId) -> Result<Option<ExecutionContext>> {
        Ok(self.executions.read().await.get(execution_id).cloned())
    }

    async fn update_execution_status(
        &self,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        update: StatusUpdate,
    ) -> Result<ExecutionContext> {
        let mut executions = self.executions.write().await;
        let context = executions
            .get_mut(execution_id)
            .with_context(|| format!("Execution {} not found", execution_id))?;

        context.transition(status, update)?;
        Ok(context.clone())
    }

    async fn list_executions(
        &self,
        flow_id: Option<&FlowId>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExecutionContext>> {
        let executions = self.executions.read().await;
        Ok(page_executions(
            executions.values().cloned(),
            flow_id,
            limit,
            offset,
        ))
    }

    async fn put_node_result(&self, result: &NodeExecutionResult) -> Result<()> {
        self.node_results.write().await.insert(
            (result.execution_id, result.node_id.clone()),
            result.clone(),
        );
        Ok(())
    }

    async fn get_node_result(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
    ) -> Result<Option<NodeExecutionResult>> {
        Ok(self
            .node_results
            .read()
            .await
            .get(&(*execution_id, node_id.clone()))
            .cloned())
    }

    async fn list_node_results(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<NodeExecutionResult>> {
        let mut results: Vec<NodeExecutionResult> = self
            .node_results
            .read()
            .await
            .values()
            .filter(|r| &r.execution_id == execution_id)
            .cloned()
            .collect();

        results.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(results)
    }

    async fn put_flow(&self, flow: &FlowRecord) -> Result<()> {
        self.flows
            .write()
            .await
            .insert(flow.definition.flow_id.clone(), flow.clone());
        Ok(())
    }

    async fn get_flow(&self, flow_id: &FlowId) -> Result<Option<FlowRecord>> {
        Ok(self.flows.read().await.get(flow_id).cloned())
    }

    async fn list_flows(&self, active_only: bool) -> Result<Vec<FlowRecord>> {
        let mut flows: Vec<FlowRecord> = self
            .flows
            .read()
            .await
            .values()
            .filter(|f| !active_only || f.is_active)
            .cloned()
            .collect();

        flows.sort_by(|a, b| a.definition.flow_id.cmp(&b.definition.flow_id));
        Ok(flows)
    }

    async fn deactivate_flow(&self, flow_id: &FlowId) -> Result<bool> {
        match self.flows.write().await.get_mut(flow_id) {
            Some(flow) => {
                flow.is_active = false;
                flow.updated_at = chrono::Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn put_agent(&self, agent: &AgentInfo) -> Result<()> {
        self.agents
            .write()
            .await
            .insert(agent.agent_id.clone(), agent.clone());
        Ok(())
    }

    async fn get_agent(&self, agent_id: &AgentId) -> Result<Option<AgentInfo>> {
        Ok(self.agents.read().await.get(agent_id).cloned())
    }

    async fn list_agents(&self, active_only: bool) -> Result<Vec<AgentInfo>> {
        let mut agents: Vec<AgentInfo> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| !active_only || a.is_active)
            .cloned()
            .collect();

        agents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(agents)
    }

    async fn delete_agent(&self, agent_id: &AgentId) -> Result<bool> {
        Ok(self.agents.write().await.remove(agent_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract;

    #[tokio::test]
    async fn test_execution_lifecycle() {
        contract::execution_lifecycle(&MemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn test_execution_listing() {
        contract::execution_listing(&MemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn test_node_results() {
        contract::node_results(&MemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn test_flows_and_agents() {
        contract::flows_and_agents(&MemoryStateStore::new()).await;
    }
}
