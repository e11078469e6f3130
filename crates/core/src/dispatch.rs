//! Outbound calls to agent endpoints.

use crate::error::DispatchError;
use crate::types::{AgentInfo, ExecutionId, JsonObject, NodeId};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Upper bound on how much of an error body is kept in a node's error message
const MAX_ERROR_BODY: usize = 512;

/// Body of `POST {endpoint}/execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub input: JsonObject,
    pub config: JsonObject,
}

/// Transport used to reach agents.
///
/// The orchestrator only talks to agents through this trait so tests can
/// swap in recording or scripted clients.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Run one node on an agent and return its output object
    async fn execute(
        &self,
        agent: &AgentInfo,
        request: &DispatchRequest,
    ) -> Result<JsonObject, DispatchError>;

    /// Probe `GET {endpoint}/health`; true only on HTTP 200
    async fn health(&self, agent: &AgentInfo) -> Result<bool, DispatchError>;
}

/// [`AgentClient`] speaking JSON over HTTP
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    client: Client,
    execute_timeout: Duration,
    health_timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(execute_timeout: Duration, health_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("spine/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            execute_timeout,
            health_timeout,
        })
    }

    fn url(endpoint: &str, path: &str) -> String {
        format!("{}/{}", endpoint.trim_end_matches('/'), path)
    }

    fn send_error(err: reqwest::Error, timeout: Duration) -> DispatchError {
        if err.is_timeout() {
            DispatchError::Timeout(timeout.as_secs())
        } else {
            err.into()
        }
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn execute(
        &self,
        agent: &AgentInfo,
        request: &DispatchRequest,
    ) -> Result<JsonObject, DispatchError> {
        let url = Self::url(&agent.endpoint, "execute");
        debug!(url = %url, node_id = %request.node_id, "Dispatching node");

        let response = self
            .client
            .post(&url)
            .timeout(self.execute_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| Self::send_error(e, self.execute_timeout))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Self::send_error(e, self.execute_timeout))?;

        // A body without `output` is treated as an empty result
        match body.get("output") {
            None | Some(serde_json::Value::Null) => Ok(JsonObject::new()),
            Some(serde_json::Value::Object(output)) => Ok(output.clone()),
            Some(other) => Err(DispatchError::InvalidResponse(format!(
                "expected `output` to be an object, got {}",
                json_kind(other)
            ))),
        }
    }

    async fn health(&self, agent: &AgentInfo) -> Result<bool, DispatchError> {
        let url = Self::url(&agent.endpoint, "health");

        let response = self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| Self::send_error(e, self.health_timeout))?;

        Ok(response.status() == StatusCode::OK)
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentId, NodeKind};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn agent(endpoint: &str) -> AgentInfo {
        let now = chrono::Utc::now();
        AgentInfo {
            agent_id: AgentId::new("scorer"),
            name: "Scorer".to_string(),
            description: String::new(),
            endpoint: endpoint.to_string(),
            capabilities: Default::default(),
            kind: NodeKind::Processor,
            is_active: true,
            created_at: now,
            updated_at: now,
            last_health_check: None,
            healthy: None,
        }
    }

    fn request() -> DispatchRequest {
        let mut input = JsonObject::new();
        input.insert("amount".into(), json!(1200));
        DispatchRequest {
            execution_id: ExecutionId::new(),
            node_id: NodeId::new("score"),
            input,
            config: JsonObject::new(),
        }
    }

    fn client() -> HttpAgentClient {
        HttpAgentClient::new(Duration::from_secs(2), Duration::from_secs(1)).unwrap()
    }

    #[tokio::test]
    async fn test_execute_returns_output_object() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .and(body_partial_json(json!({"node_id": "score", "input": {"amount": 1200}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"output": {"score": 710}})))
            .expect(1)
            .mount(&server)
            .await;

        let output = client().execute(&agent(&server.uri()), &request()).await.unwrap();
        assert_eq!(output["score"], 710);
    }

    #[tokio::test]
    async fn test_execute_tolerates_trailing_slash_and_missing_output() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .mount(&server)
            .await;

        let endpoint = format!("{}/", server.uri());
        let output = client().execute(&agent(&endpoint), &request()).await.unwrap();
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_execute_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model exploded"))
            .mount(&server)
            .await;

        let err = client()
            .execute(&agent(&server.uri()), &request())
            .await
            .unwrap_err();
        match err {
            DispatchError::Status { status, ref body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "model exploded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn test_execute_rejects_non_object_output() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"output": [1, 2]})))
            .mount(&server)
            .await;

        let err = client()
            .execute(&agent(&server.uri()), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_execute_rejects_malformed_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client()
            .execute(&agent(&server.uri()), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"output": {}}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client = HttpAgentClient::new(Duration::from_millis(200), Duration::from_secs(1)).unwrap();
        let err = client
            .execute(&agent(&server.uri()), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_transport_error() {
        // Nothing listens on the discard port
        let err = client()
            .execute(&agent("http://127.0.0.1:9"), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));
    }

    #[tokio::test]
    async fn test_health_requires_200() {
        let healthy = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&healthy)
            .await;

        let degraded = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&degraded)
            .await;

        assert!(client().health(&agent(&healthy.uri())).await.unwrap());
        assert!(!client().health(&agent(&degraded.uri())).await.unwrap());
    }
}
