use crate::error::{AgentError, TransitionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque JSON object used for node config, inputs, and outputs
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for a flow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Globally unique, immutable key of a flow definition
    FlowId
);
string_id!(
    /// Identifier of a node, unique within its flow
    NodeId
);
string_id!(
    /// Identifier of a registered agent
    AgentId
);

/// Kind of a flow node, also used to classify agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Input,
    Processor,
    Output,
    Conditional,
}

/// A single step in a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: NodeId,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub depends_on: Vec<NodeId>,
    #[serde(default)]
    pub config: JsonObject,
    #[serde(default)]
    pub conditions: Option<JsonObject>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// A named, versioned DAG of nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub flow_id: FlowId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub nodes: Vec<FlowNode>,
    pub entry_point: NodeId,
    #[serde(default)]
    pub exit_points: Vec<NodeId>,
    #[serde(default)]
    pub metadata: JsonObject,
}

impl FlowDefinition {
    pub fn node(&self, node_id: &NodeId) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| &n.id == node_id)
    }
}

/// A flow definition as persisted, carrying its soft-delete flag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    #[serde(flatten)]
    pub definition: FlowDefinition,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowRecord {
    pub fn new(definition: FlowDefinition) -> Self {
        let now = Utc::now();
        Self {
            definition,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A validated agent capability tag (lowercase `[a-z0-9_-]`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Capability(String);

impl Capability {
    pub fn parse(raw: &str) -> Result<Self, AgentError> {
        let tag = raw.trim();
        let valid = !tag.is_empty()
            && tag
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if valid {
            Ok(Self(tag.to_string()))
        } else {
            Err(AgentError::InvalidCapability(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Capability {
    type Error = AgentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Capability> for String {
    fn from(capability: Capability) -> Self {
        capability.0
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub endpoint: String,
    pub capabilities: BTreeSet<Capability>,
    #[serde(rename = "agent_type")]
    pub kind: NodeKind,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last successful health probe; observational only
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    /// Outcome of the latest health probe; None until one has run
    #[serde(default)]
    pub healthy: Option<bool>,
}

/// Registration payload for an agent, validated into [`AgentInfo`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub endpoint: String,
    pub capabilities: Vec<String>,
    #[serde(rename = "agent_type")]
    pub kind: NodeKind,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Status of an execution or a node result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// pending -> running -> {completed | failed | cancelled}
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Extra fields written alongside a status transition
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub output_data: Option<JsonObject>,
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn output(output_data: JsonObject) -> Self {
        Self {
            output_data: Some(output_data),
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output_data: None,
            error_message: Some(message.into()),
        }
    }
}

/// One run of a flow against a specific input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub flow_id: FlowId,
    pub status: ExecutionStatus,
    pub input_data: JsonObject,
    #[serde(default)]
    pub output_data: JsonObject,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: JsonObject,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    /// Create a pending context for a request
    pub fn pending(execution_id: ExecutionId, request: &ExecutionRequest) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            flow_id: request.flow_id.clone(),
            status: ExecutionStatus::Pending,
            input_data: request.input_data.clone(),
            output_data: JsonObject::new(),
            error_message: None,
            metadata: request.metadata.clone(),
            user_id: request.user_id.clone(),
            priority: request.priority,
            timeout_secs: request.timeout,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a state-machine transition, stamping timestamps
    pub fn transition(
        &mut self,
        status: ExecutionStatus,
        update: StatusUpdate,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(status) {
            return Err(TransitionError {
                execution_id: self.execution_id,
                from: self.status,
                to: status,
            });
        }

        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
        if let Some(output) = update.output_data {
            self.output_data = output;
        }
        if let Some(error) = update.error_message {
            self.error_message = Some(error);
        }
        Ok(())
    }

    /// Wall-clock run time, once the execution has finished
    pub fn duration_secs(&self) -> Option<f64> {
        let start = self.started_at.unwrap_or(self.created_at);
        self.completed_at
            .map(|end| (end - start).num_milliseconds() as f64 / 1000.0)
    }
}

/// Outcome of executing one node within an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionResult {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub agent_id: Option<AgentId>,
    pub status: ExecutionStatus,
    pub input_data: JsonObject,
    #[serde(default)]
    pub output_data: JsonObject,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeExecutionResult {
    pub fn running(execution_id: ExecutionId, node: &FlowNode, input_data: JsonObject) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            execution_id,
            node_id: node.id.clone(),
            agent_id: node.agent_id.clone(),
            status: ExecutionStatus::Running,
            input_data,
            output_data: JsonObject::new(),
            error_message: None,
            execution_time_ms: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn complete(&mut self, output_data: JsonObject, elapsed_ms: u64) {
        self.finish(ExecutionStatus::Completed, elapsed_ms);
        self.output_data = output_data;
    }

    pub fn fail(&mut self, error: impl Into<String>, elapsed_ms: u64) {
        self.finish(ExecutionStatus::Failed, elapsed_ms);
        self.error_message = Some(error.into());
    }

    fn finish(&mut self, status: ExecutionStatus, elapsed_ms: u64) {
        let now = Utc::now();
        self.status = status;
        self.execution_time_ms = Some(elapsed_ms);
        self.updated_at = now;
        self.completed_at = Some(now);
    }
}

/// Request to execute a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub flow_id: FlowId,
    #[serde(default)]
    pub input_data: JsonObject,
    #[serde(default)]
    pub user_id: Option<String>,
    /// 0..=10, recorded on the context
    #[serde(default)]
    pub priority: u8,
    /// Overall run deadline in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub metadata: JsonObject,
}

impl ExecutionRequest {
    pub fn new(flow_id: impl Into<String>, input_data: JsonObject) -> Self {
        Self {
            flow_id: FlowId::new(flow_id),
            input_data,
            user_id: None,
            priority: 0,
            timeout: None,
            metadata: JsonObject::new(),
        }
    }
}

/// Immediate answer to an execution request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
}
