use super::{page_executions, StateStore};
use crate::types::{
    AgentId, AgentInfo, ExecutionContext, ExecutionId, ExecutionStatus, FlowId, FlowRecord,
    NodeExecutionResult, NodeId, StatusUpdate,
};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition, TableHandle};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const EXECUTIONS_TABLE: JsonTable = TableDefinition::new("executions");
const NODE_RESULTS_TABLE: JsonTable = TableDefinition::new("node_results");
const FLOWS_TABLE: JsonTable = TableDefinition::new("flows");
const AGENTS_TABLE: JsonTable = TableDefinition::new("agents");

/// Durable state store backed by an embedded redb file.
///
/// Records are JSON-encoded. Node results are keyed `<execution_id>/<node_id>`.
#[derive(Clone)]
pub struct RedbStateStore {
    db: Arc<Database>,
}

impl RedbStateStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            for table in [EXECUTIONS_TABLE, NODE_RESULTS_TABLE, FLOWS_TABLE, AGENTS_TABLE] {
                write_txn
                    .open_table(table)
                    .with_context(|| format!("Failed to open {} table", table.name()))?;
            }
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put<T: Serialize>(&self, definition: JsonTable, key: &str, record: &T) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(definition)
                .context("Failed to open table")?;

            let value = serde_json::to_vec(record).context("Failed to serialize record")?;

            table
                .insert(key, value.as_slice())
                .context("Failed to insert record")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, definition: JsonTable, key: &str) -> Result<Option<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(definition)
            .context("Failed to open table")?;

        let value = table.get(key).context("Failed to get record")?;

        match value {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Read every record whose key starts with `prefix`
    fn scan<T: DeserializeOwned>(&self, definition: JsonTable, prefix: &str) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(definition)
            .context("Failed to open table")?;

        let mut records = Vec::new();
        for item in table.iter().context("Failed to iterate table")? {
            let (key, value) = item.context("Failed to read item")?;
            if !key.value().starts_with(prefix) {
                continue;
            }
            let record: T = serde_json::from_slice(value.value())
                .context("Failed to deserialize record")?;
            records.push(record);
        }

        Ok(records)
    }

    /// Read-modify-write a record inside one write transaction
    fn modify<T, F>(&self, definition: JsonTable, key: &str, apply: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> Result<()>,
    {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let updated = {
            let mut table = write_txn
                .open_table(definition)
                .context("Failed to open table")?;

            let current: Option<T> = match table.get(key).context("Failed to get record")? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value())
                        .context("Failed to deserialize record")?,
                ),
                None => None,
            };

            match current {
                Some(mut record) => {
                    apply(&mut record)?;
                    let value =
                        serde_json::to_vec(&record).context("Failed to serialize record")?;
                    table
                        .insert(key, value.as_slice())
                        .context("Failed to update record")?;
                    Some(record)
                }
                None => None,
            }
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(updated)
    }

    fn remove(&self, definition: JsonTable, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let removed = {
            let mut table = write_txn
                .open_table(definition)
                .context("Failed to open table")?;

            let removed = table.remove(key).context("Failed to delete record")?.is_some();
            removed
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(removed)
    }
}

fn node_result_key(execution_id: &ExecutionId, node_id: &NodeId) -> String {
    format!("{}/{}", execution_id, node_id)
}

#[async_trait::async_trait]
impl StateStore for RedbStateStore {
    async fn put_execution(&self, context: &ExecutionContext) -> Result<()> {
        self.put(EXECUTIONS_TABLE, &context.execution_id.to_string(), context)
    }

    async fn get_execution(&self, execution_id: &ExecutionId) -> Result<Option<ExecutionContext>> {
        self.get(EXECUTIONS_TABLE, &execution_id.to_string())
    }

    async fn update_execution_status(
        &self,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        update: StatusUpdate,
    ) -> Result<ExecutionContext> {
        self.modify(
            EXECUTIONS_TABLE,
            &execution_id.to_string(),
            |context: &mut ExecutionContext| Ok(context.transition(status, update)?),
        )?
        .with_context(|| format!("Execution {} not found", execution_id))
    }

    async fn list_executions(
        &self,
        flow_id: Option<&FlowId>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExecutionContext>> {
        let executions: Vec<ExecutionContext> = self.scan(EXECUTIONS_TABLE, "")?;
        Ok(page_executions(executions, flow_id, limit, offset))
    }

    async fn put_node_result(&self, result: &NodeExecutionResult) -> Result<()> {
        let key = node_result_key(&result.execution_id, &result.node_id);
        self.put(NODE_RESULTS_TABLE, &key, result)
    }

    async fn get_node_result(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
    ) -> Result<Option<NodeExecutionResult>> {
        self.get(NODE_RESULTS_TABLE, &node_result_key(execution_id, node_id))
    }

    async fn list_node_results(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<NodeExecutionResult>> {
        let prefix = format!("{}/", execution_id);
        let mut results: Vec<NodeExecutionResult> = self.scan(NODE_RESULTS_TABLE, &prefix)?;
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(results)
    }

    async fn put_flow(&self, flow: &FlowRecord) -> Result<()> {
        self.put(FLOWS_TABLE, flow.definition.flow_id.as_str(), flow)
    }

    async fn get_flow(&self, flow_id: &FlowId) -> Result<Option<FlowRecord>> {
        self.get(FLOWS_TABLE, flow_id.as_str())
    }

    async fn list_flows(&self, active_only: bool) -> Result<Vec<FlowRecord>> {
        let flows: Vec<FlowRecord> = self.scan(FLOWS_TABLE, "")?;
        Ok(flows
            .into_iter()
            .filter(|f| !active_only || f.is_active)
            .collect())
    }

    async fn deactivate_flow(&self, flow_id: &FlowId) -> Result<bool> {
        let updated = self.modify(FLOWS_TABLE, flow_id.as_str(), |flow: &mut FlowRecord| {
            flow.is_active = false;
            flow.updated_at = chrono::Utc::now();
            Ok(())
        })?;
        Ok(updated.is_some())
    }

    async fn put_agent(&self, agent: &AgentInfo) -> Result<()> {
        self.put(AGENTS_TABLE, agent.agent_id.as_str(), agent)
    }

    async fn get_agent(&self, agent_id: &AgentId) -> Result<Option<AgentInfo>> {
        self.get(AGENTS_TABLE, agent_id.as_str())
    }

    async fn list_agents(&self, active_only: bool) -> Result<Vec<AgentInfo>> {
        let mut agents: Vec<AgentInfo> = self
            .scan(AGENTS_TABLE, "")?
            .into_iter()
            .filter(|a: &AgentInfo| !active_only || a.is_active)
            .collect();

        agents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(agents)
    }

    async fn delete_agent(&self, agent_id: &AgentId) -> Result<bool> {
        self.remove(AGENTS_TABLE, agent_id.as_str())
    }
}
