//! Flow admission and execution lifecycle.
//!
//! The orchestrator owns the active flow cache, accepts execution requests,
//! and drives each execution on its own task. Node dispatch and the
//! wavefront loop live in [`scheduler`].

mod scheduler;

pub use scheduler::merge_node_input;

use crate::config::OrchestratorConfig;
use crate::dispatch::AgentClient;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::flow::{load_flow_dir, validate_flow};
use crate::metrics::{AgentDispatchStats, DispatchMetrics, ExecutionMetrics};
use crate::registry::AgentDirectory;
use crate::storage::StateStore;
use crate::types::{
    ExecutionContext, ExecutionId, ExecutionRequest, ExecutionResponse, ExecutionStatus, FlowDefinition,
    FlowId, FlowRecord, NodeExecutionResult, StatusUpdate,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

const MAX_PRIORITY: u8 = 10;

const USER_CANCEL_REASON: &str = "Execution cancelled by user";
const SHUTDOWN_CANCEL_REASON: &str = "Execution cancelled by orchestrator shutdown";

/// Runs flows against registered agents
pub struct Orchestrator {
    flows: RwLock<HashMap<FlowId, Arc<FlowDefinition>>>,
    /// Contexts of executions that have not been durably finished yet
    live: RwLock<HashMap<ExecutionId, ExecutionContext>>,
    running: Mutex<HashMap<ExecutionId, CancellationToken>>,
    store: Arc<dyn StateStore>,
    directory: Arc<AgentDirectory>,
    client: Arc<dyn AgentClient>,
    permits: Arc<Semaphore>,
    dispatch_metrics: Arc<DispatchMetrics>,
    tasks: TaskTracker,
    /// Parent of every execution token; cancelled on shutdown
    stopping: CancellationToken,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        directory: Arc<AgentDirectory>,
        client: Arc<dyn AgentClient>,
        config: OrchestratorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_dispatches.max(1)));

        Self {
            flows: RwLock::new(HashMap::new()),
            live: RwLock::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            store,
            directory,
            client,
            permits,
            dispatch_metrics: Arc::new(DispatchMetrics::new()),
            tasks: TaskTracker::new(),
            stopping: CancellationToken::new(),
            config,
        }
    }

    pub fn directory(&self) -> &Arc<AgentDirectory> {
        &self.directory
    }

    /// Load active flows from the store, then from `flows_dir`.
    ///
    /// Stored flows that no longer validate are skipped. Flow files are
    /// validated and upserted into the store. Returns the number of flows
    /// cached afterwards.
    pub async fn start(&self) -> OrchestratorResult<usize> {
        for record in self.store.list_flows(true).await? {
            let flow_id = record.definition.flow_id.clone();
            match validate_flow(&record.definition) {
                Ok(_) => {
                    self.flows
                        .write()
                        .await
                        .insert(flow_id, Arc::new(record.definition));
                }
                Err(e) => warn!(flow_id = %flow_id, error = %e, "Skipping invalid stored flow"),
            }
        }

        if let Some(dir) = &self.config.flows_dir {
            let files = load_flow_dir(dir).map_err(OrchestratorError::FlowLoad)?;
            for (path, flow) in files {
                let flow_id = flow.flow_id.clone();
                if let Err(e) = validate_flow(&flow) {
                    warn!(file = %path.display(), flow_id = %flow_id, error = %e, "Skipping invalid flow file");
                    continue;
                }
                self.persist_flow(flow).await?;
            }
        }

        let count = self.flows.read().await.len();
        info!(flows = count, "Orchestrator started");
        Ok(count)
    }

    /// Cancel running executions and wait for their tasks to finish
    pub async fn shutdown(&self) {
        self.stopping.cancel();

        let ids: Vec<ExecutionId> = self.running.lock().await.keys().copied().collect();
        for execution_id in ids {
            if let Err(e) = self.cancel_with(&execution_id, SHUTDOWN_CANCEL_REASON).await {
                warn!(execution_id = %execution_id, error = %e, "Failed to cancel execution on shutdown");
            }
        }

        self.tasks.close();
        self.tasks.wait().await;
        info!("Orchestrator stopped");
    }

    /// Admit a new flow
    pub async fn add_flow(&self, flow: FlowDefinition) -> OrchestratorResult<()> {
        validate_flow(&flow)?;
        if self.flows.read().await.contains_key(&flow.flow_id) {
            return Err(OrchestratorError::FlowExists(flow.flow_id));
        }

        self.persist_flow(flow).await
    }

    /// Replace an admitted flow; running executions keep the old definition
    pub async fn update_flow(&self, flow_id: &FlowId, flow: FlowDefinition) -> OrchestratorResult<()> {
        if &flow.flow_id != flow_id {
            return Err(OrchestratorError::FlowIdMismatch {
                expected: flow_id.clone(),
                actual: flow.flow_id,
            });
        }
        if !self.flows.read().await.contains_key(flow_id) {
            return Err(OrchestratorError::FlowNotFound(flow_id.clone()));
        }

        validate_flow(&flow)?;
        self.persist_flow(flow).await
    }

    /// Soft delete; returns false if the flow is not admitted
    pub async fn delete_flow(&self, flow_id: &FlowId) -> OrchestratorResult<bool> {
        if !self.flows.read().await.contains_key(flow_id) {
            return Ok(false);
        }

        self.store.deactivate_flow(flow_id).await?;
        self.flows.write().await.remove(flow_id);

        info!(flow_id = %flow_id, "Deactivated flow");
        Ok(true)
    }

    pub async fn get_flow(&self, flow_id: &FlowId) -> Option<FlowDefinition> {
        self.flows
            .read()
            .await
            .get(flow_id)
            .map(|flow| flow.as_ref().clone())
    }

    /// Admitted flows, ordered by id
    pub async fn list_flows(&self) -> Vec<FlowDefinition> {
        let mut flows: Vec<FlowDefinition> = self
            .flows
            .read()
            .await
            .values()
            .map(|flow| flow.as_ref().clone())
            .collect();
        flows.sort_by(|a, b| a.flow_id.cmp(&b.flow_id));
        flows
    }

    async fn persist_flow(&self, flow: FlowDefinition) -> OrchestratorResult<()> {
        let mut record = FlowRecord::new(flow);
        if let Some(existing) = self.store.get_flow(&record.definition.flow_id).await? {
            record.created_at = existing.created_at;
        }
        self.store.put_flow(&record).await?;

        let flow_id = record.definition.flow_id.clone();
        let nodes = record.definition.nodes.len();
        self.flows
            .write()
            .await
            .insert(flow_id.clone(), Arc::new(record.definition));

        info!(flow_id = %flow_id, nodes = nodes, "Admitted flow");
        Ok(())
    }

    /// Accept an execution request and start it in the background.
    ///
    /// Returns once the pending context is durable; the run itself is
    /// observed through [`Orchestrator::get_execution_status`].
    pub async fn execute_flow(
        self: &Arc<Self>,
        request: ExecutionRequest,
    ) -> OrchestratorResult<ExecutionResponse> {
        if request.priority > MAX_PRIORITY {
            return Err(OrchestratorError::InvalidRequest(format!(
                "priority must be between 0 and {}, got {}",
                MAX_PRIORITY, request.priority
            )));
        }
        if self.stopping.is_cancelled() {
            return Err(OrchestratorError::InvalidRequest(
                "orchestrator is shutting down".to_string(),
            ));
        }
        if request.timeout == Some(0) {
            return Err(OrchestratorError::InvalidRequest(
                "timeout must be at least 1 second".to_string(),
            ));
        }

        let flow = self
            .flows
            .read()
            .await
            .get(&request.flow_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::FlowNotFound(request.flow_id.clone()))?;

        let execution_id = ExecutionId::new();
        let context = ExecutionContext::pending(execution_id, &request);
        self.store.put_execution(&context).await?;
        self.live.write().await.insert(execution_id, context);

        info!(
            execution_id = %execution_id,
            flow_id = %request.flow_id,
            priority = request.priority,
            "Accepted execution"
        );

        let orchestrator = Arc::clone(self);
        self.tasks.spawn(orchestrator.run_execution(
            execution_id,
            flow,
            request.input_data,
            request.timeout,
        ));

        Ok(ExecutionResponse {
            execution_id,
            status: ExecutionStatus::Pending,
        })
    }

    /// Cancel a running execution; returns false if it is not running
    pub async fn cancel_execution(&self, execution_id: &ExecutionId) -> OrchestratorResult<bool> {
        self.cancel_with(execution_id, USER_CANCEL_REASON).await
    }

    async fn cancel_with(&self, execution_id: &ExecutionId, reason: &str) -> OrchestratorResult<bool> {
        // Taking the token makes this call the owner of the terminal status
        let Some(token) = self.running.lock().await.remove(execution_id) else {
            return Ok(false);
        };
        token.cancel();

        if let Err(e) = self
            .transition(*execution_id, ExecutionStatus::Cancelled, StatusUpdate::error(reason))
            .await
        {
            self.abandon(*execution_id, &e).await;
            return Err(e);
        }
        self.live.write().await.remove(execution_id);

        info!(execution_id = %execution_id, reason = reason, "Execution cancelled");
        Ok(true)
    }

    /// Current context of an execution.
    ///
    /// Unfinished executions are served from the in-process cache, which is
    /// never behind the store.
    pub async fn get_execution_status(
        &self,
        execution_id: &ExecutionId,
    ) -> OrchestratorResult<Option<ExecutionContext>> {
        if let Some(context) = self.live.read().await.get(execution_id) {
            return Ok(Some(context.clone()));
        }
        Ok(self.store.get_execution(execution_id).await?)
    }

    pub async fn list_executions(
        &self,
        flow_id: Option<&FlowId>,
        limit: usize,
        offset: usize,
    ) -> OrchestratorResult<Vec<ExecutionContext>> {
        Ok(self.store.list_executions(flow_id, limit, offset).await?)
    }

    pub async fn get_node_results(
        &self,
        execution_id: &ExecutionId,
    ) -> OrchestratorResult<Vec<NodeExecutionResult>> {
        Ok(self.store.list_node_results(execution_id).await?)
    }

    pub async fn running_executions(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<ExecutionId> = self.running.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn metrics(&self) -> OrchestratorResult<ExecutionMetrics> {
        let executions = self.store.list_executions(None, usize::MAX, 0).await?;
        Ok(ExecutionMetrics::from_executions(&executions))
    }

    pub fn dispatch_stats(&self) -> Vec<AgentDispatchStats> {
        self.dispatch_metrics.snapshot()
    }

    /// Persist a status change, then apply it to the live context.
    ///
    /// Returns false if the execution is not live or the change is not a
    /// legal transition from its current status. The cache lock is held
    /// until the store has answered, and the cached context only moves once
    /// the store has accepted the change.
    async fn transition(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        update: StatusUpdate,
    ) -> OrchestratorResult<bool> {
        let mut live = self.live.write().await;
        let Some(context) = live.get_mut(&execution_id) else {
            return Ok(false);
        };
        let mut next = context.clone();
        if let Err(e) = next.transition(status, update.clone()) {
            warn!(error = %e, "Ignoring status change");
            return Ok(false);
        }

        self.store
            .update_execution_status(&execution_id, status, update)
            .await?;
        *context = next;
        Ok(true)
    }

    /// Fail a live execution after the store rejected a write.
    ///
    /// The cached context still holds the last status the store accepted.
    /// It is moved to FAILED and written back in full; if that also fails
    /// the context stays cached.
    async fn abandon(&self, execution_id: ExecutionId, cause: &OrchestratorError) {
        error!(execution_id = %execution_id, error = %cause, "Execution aborted");

        let snapshot = {
            let mut live = self.live.write().await;
            let Some(context) = live.get_mut(&execution_id) else {
                return;
            };
            if context.status == ExecutionStatus::Pending {
                // Never started; pass through RUNNING so FAILED is legal
                let _ = context.transition(ExecutionStatus::Running, StatusUpdate::default());
            }
            if context
                .transition(ExecutionStatus::Failed, StatusUpdate::error(cause.to_string()))
                .is_err()
            {
                return;
            }
            context.clone()
        };

        match self.store.put_execution(&snapshot).await {
            Ok(()) => {
                self.live.write().await.remove(&execution_id);
            }
            Err(e) => {
                let error = format!("{:#}", e);
                error!(execution_id = %execution_id, error = %error, "Failed to record execution failure");
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
