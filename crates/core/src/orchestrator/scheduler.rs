use super::{Orchestrator, SHUTDOWN_CANCEL_REASON};
use crate::dispatch::{AgentClient, DispatchRequest};
use crate::error::{DispatchError, OrchestratorError};
use crate::flow::validate_flow;
use crate::metrics::DispatchMetrics;
use crate::registry::AgentDirectory;
use crate::types::{
    ExecutionId, ExecutionStatus, FlowDefinition, FlowNode, JsonObject, NodeExecutionResult, NodeId,
    StatusUpdate,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Build a node's input: the request input overlaid with each dependency's
/// output, in `depends_on` order. Later keys win.
pub fn merge_node_input<'a>(
    request_input: &JsonObject,
    dependency_outputs: impl IntoIterator<Item = &'a JsonObject>,
) -> JsonObject {
    let mut input = request_input.clone();
    for output in dependency_outputs {
        for (key, value) in output {
            input.insert(key.clone(), value.clone());
        }
    }
    input
}

/// What a node task needs, detached from the orchestrator's lifetime
#[derive(Clone)]
struct NodeRunner {
    directory: Arc<AgentDirectory>,
    client: Arc<dyn AgentClient>,
    permits: Arc<Semaphore>,
    metrics: Arc<DispatchMetrics>,
}

impl NodeRunner {
    async fn run(
        self,
        node: FlowNode,
        mut result: NodeExecutionResult,
        abort: CancellationToken,
    ) -> NodeExecutionResult {
        let started = Instant::now();
        let outcome = self.call_agent(&node, &result, &abort).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        self.metrics
            .record(node.agent_id.as_ref(), elapsed_ms, outcome.is_ok());

        match outcome {
            Ok(output) => result.complete(output, elapsed_ms),
            Err(message) => result.fail(message, elapsed_ms),
        }
        result
    }

    async fn call_agent(
        &self,
        node: &FlowNode,
        result: &NodeExecutionResult,
        abort: &CancellationToken,
    ) -> Result<JsonObject, String> {
        if abort.is_cancelled() {
            return Err(DispatchError::Cancelled.to_string());
        }

        let agent = self
            .directory
            .resolve(&node.id, node.agent_id.as_ref())
            .await
            .map_err(|e| e.to_string())?;

        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| DispatchError::Cancelled.to_string())?
            }
            _ = abort.cancelled() => return Err(DispatchError::Cancelled.to_string()),
        };

        let request = DispatchRequest {
            execution_id: result.execution_id,
            node_id: node.id.clone(),
            input: result.input_data.clone(),
            config: node.config.clone(),
        };

        tokio::select! {
            outcome = self.client.execute(&agent, &request) => outcome.map_err(|e| e.to_string()),
            _ = abort.cancelled() => Err(DispatchError::Cancelled.to_string()),
        }
    }
}

impl Orchestrator {
    fn node_runner(&self) -> NodeRunner {
        NodeRunner {
            directory: Arc::clone(&self.directory),
            client: Arc::clone(&self.client),
            permits: Arc::clone(&self.permits),
            metrics: Arc::clone(&self.dispatch_metrics),
        }
    }

    /// Body of the task spawned per execution
    pub(super) async fn run_execution(
        self: Arc<Self>,
        execution_id: ExecutionId,
        flow: Arc<FlowDefinition>,
        input: JsonObject,
        timeout_secs: Option<u64>,
    ) {
        let token = self.stopping.child_token();

        // RUNNING and membership in the running set become visible together
        {
            let mut running = self.running.lock().await;
            match self
                .transition(execution_id, ExecutionStatus::Running, StatusUpdate::default())
                .await
            {
                Ok(true) => {
                    running.insert(execution_id, token.clone());
                }
                Ok(false) => return,
                Err(e) => {
                    drop(running);
                    self.abandon(execution_id, &e).await;
                    return;
                }
            }
        }

        info!(execution_id = %execution_id, flow_id = %flow.flow_id, "Execution started");

        let deadline = timeout_secs.map(|secs| (Instant::now() + Duration::from_secs(secs), secs));
        let outcome = self
            .drive(execution_id, &flow, &input, &token, deadline)
            .await;

        // Whoever takes the token out of the running set owns the terminal status
        if self.running.lock().await.remove(&execution_id).is_none() {
            debug!(execution_id = %execution_id, "Execution finished after cancellation");
            return;
        }

        let (status, update) = match outcome {
            // Shutdown began after the running set was swept
            _ if token.is_cancelled() => (
                ExecutionStatus::Cancelled,
                StatusUpdate::error(SHUTDOWN_CANCEL_REASON),
            ),
            Ok(output) => (ExecutionStatus::Completed, StatusUpdate::output(output)),
            Err(message) => (ExecutionStatus::Failed, StatusUpdate::error(message)),
        };

        match self.transition(execution_id, status, update).await {
            Ok(_) => {
                self.live.write().await.remove(&execution_id);
                match status {
                    ExecutionStatus::Completed => info!(execution_id = %execution_id, "Execution completed"),
                    ExecutionStatus::Cancelled => info!(execution_id = %execution_id, "Execution cancelled"),
                    _ => warn!(execution_id = %execution_id, "Execution failed"),
                }
            }
            Err(e) => {
                warn!(execution_id = %execution_id, status = %status, "Execution outcome not persisted");
                self.abandon(execution_id, &e).await;
            }
        }
    }

    /// Wavefront scheduler.
    ///
    /// Dispatches every node whose dependencies have completed, persists each
    /// final node result before releasing its dependents, and stops
    /// dispatching on the first failure. In-flight siblings are cancelled and
    /// drained so every started node ends with a terminal result.
    async fn drive(
        &self,
        execution_id: ExecutionId,
        flow: &FlowDefinition,
        input: &JsonObject,
        cancel: &CancellationToken,
        deadline: Option<(Instant, u64)>,
    ) -> Result<JsonObject, String> {
        let dag = validate_flow(flow).map_err(|e| e.to_string())?;

        let abort = cancel.child_token();
        let mut remaining = dag.in_degrees();
        let mut ready: VecDeque<NodeId> = dag.entry_nodes().into_iter().collect();
        let mut outputs: HashMap<NodeId, JsonObject> = HashMap::new();
        let mut in_flight: JoinSet<NodeExecutionResult> = JoinSet::new();
        let mut failure: Option<String> = None;

        let expiry = async move {
            match deadline {
                Some((at, _)) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        loop {
            while failure.is_none() && !abort.is_cancelled() {
                let Some(node_id) = ready.pop_front() else {
                    break;
                };
                let Some(node) = flow.node(&node_id) else {
                    continue;
                };

                let node_input = merge_node_input(
                    input,
                    node.depends_on.iter().filter_map(|dep| outputs.get(dep)),
                );
                let result = NodeExecutionResult::running(execution_id, node, node_input);
                if let Err(e) = self.store.put_node_result(&result).await {
                    failure = Some(OrchestratorError::from(e).to_string());
                    abort.cancel();
                    break;
                }

                debug!(execution_id = %execution_id, node_id = %node_id, "Dispatching node");
                in_flight.spawn(self.node_runner().run(node.clone(), result, abort.clone()));
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    let Some(joined) = joined else {
                        continue;
                    };
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) => {
                            failure.get_or_insert_with(|| format!("node task aborted: {}", e));
                            abort.cancel();
                            continue;
                        }
                    };

                    if let Err(e) = self.store.put_node_result(&result).await {
                        failure.get_or_insert_with(|| OrchestratorError::from(e).to_string());
                        abort.cancel();
                        continue;
                    }

                    if result.status == ExecutionStatus::Completed {
                        debug!(
                            execution_id = %execution_id,
                            node_id = %result.node_id,
                            elapsed_ms = result.execution_time_ms.unwrap_or_default(),
                            "Node completed"
                        );
                        for dependent in dag.dependents(&result.node_id) {
                            if let Some(count) = remaining.get_mut(&dependent) {
                                *count -= 1;
                                if *count == 0 {
                                    ready.push_back(dependent);
                                }
                            }
                        }
                        outputs.insert(result.node_id, result.output_data);
                    } else {
                        let cause = result.error_message.as_deref().unwrap_or("unknown error");
                        warn!(
                            execution_id = %execution_id,
                            node_id = %result.node_id,
                            error = %cause,
                            "Node failed"
                        );
                        failure.get_or_insert_with(|| format!("node '{}' failed: {}", result.node_id, cause));
                        abort.cancel();
                    }
                }
                _ = &mut expiry, if !abort.is_cancelled() => {
                    let secs = deadline.map(|(_, secs)| secs).unwrap_or_default();
                    failure.get_or_insert_with(|| format!("execution timed out after {}s", secs));
                    abort.cancel();
                }
            }
        }

        if let Some(failure) = failure {
            return Err(failure);
        }
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled.to_string());
        }

        let mut output = JsonObject::new();
        for exit in &flow.exit_points {
            if let Some(exit_output) = outputs.remove(exit) {
                output.insert(exit.to_string(), serde_json::Value::Object(exit_output));
            }
        }
        Ok(output)
    }
}
