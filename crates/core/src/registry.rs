//! Agent directory: registration, resolution, and background health probing.

use crate::config::DirectoryConfig;
use crate::dispatch::AgentClient;
use crate::error::{AgentError, DirectoryError};
use crate::storage::StateStore;
use crate::types::{AgentId, AgentInfo, AgentRegistration, Capability, NodeId, NodeKind};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
struct DirectoryState {
    agents: HashMap<AgentId, AgentInfo>,
    by_capability: HashMap<Capability, HashSet<AgentId>>,
}

impl DirectoryState {
    fn insert(&mut self, agent: AgentInfo) {
        self.remove(&agent.agent_id);
        for capability in &agent.capabilities {
            self.by_capability
                .entry(capability.clone())
                .or_default()
                .insert(agent.agent_id.clone());
        }
        self.agents.insert(agent.agent_id.clone(), agent);
    }

    fn remove(&mut self, agent_id: &AgentId) -> Option<AgentInfo> {
        let agent = self.agents.remove(agent_id)?;
        for capability in &agent.capabilities {
            if let Some(ids) = self.by_capability.get_mut(capability) {
                ids.remove(agent_id);
                if ids.is_empty() {
                    self.by_capability.remove(capability);
                }
            }
        }
        Some(agent)
    }
}

struct HealthLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// In-process view of registered agents, backed by the state store.
///
/// Mutations are persisted before the in-memory map changes, so a failed
/// write leaves the directory as it was.
pub struct AgentDirectory {
    state: RwLock<DirectoryState>,
    store: Arc<dyn StateStore>,
    client: Arc<dyn AgentClient>,
    config: DirectoryConfig,
    health_loop: Mutex<Option<HealthLoop>>,
}

impl AgentDirectory {
    pub fn new(
        store: Arc<dyn StateStore>,
        client: Arc<dyn AgentClient>,
        config: DirectoryConfig,
    ) -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
            store,
            client,
            config,
            health_loop: Mutex::new(None),
        }
    }

    /// Load persisted agents and start the health loop
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<usize> {
        let loaded = self.load_from_store().await?;
        self.spawn_health_loop().await;
        Ok(loaded)
    }

    /// Stop the health loop and wait for it to exit
    pub async fn shutdown(&self) {
        let Some(health_loop) = self.health_loop.lock().await.take() else {
            return;
        };
        health_loop.token.cancel();
        if let Err(e) = health_loop.handle.await {
            warn!(error = %e, "Health loop task ended abnormally");
        }
        info!("Agent directory stopped");
    }

    /// Populate the directory with every active agent in the store
    pub async fn load_from_store(&self) -> anyhow::Result<usize> {
        let agents = self.store.list_agents(true).await?;
        let count = agents.len();

        let mut state = self.state.write().await;
        for agent in agents {
            state.insert(agent);
        }

        info!(count = count, "Loaded agents from store");
        Ok(count)
    }

    /// Validate and upsert an agent
    pub async fn register_agent(
        &self,
        registration: AgentRegistration,
    ) -> Result<AgentInfo, DirectoryError> {
        validate_endpoint(&registration.endpoint)?;

        if registration.capabilities.is_empty() {
            return Err(AgentError::NoCapabilities(registration.agent_id).into());
        }
        let capabilities = registration
            .capabilities
            .iter()
            .map(|raw| Capability::parse(raw))
            .collect::<Result<BTreeSet<_>, _>>()?;

        let now = Utc::now();
        let created_at = self
            .state
            .read()
            .await
            .agents
            .get(&registration.agent_id)
            .map_or(now, |existing| existing.created_at);

        let agent = AgentInfo {
            agent_id: registration.agent_id,
            name: registration.name,
            description: registration.description,
            endpoint: registration.endpoint,
            capabilities,
            kind: registration.kind,
            is_active: registration.is_active,
            created_at,
            updated_at: now,
            last_health_check: None,
            healthy: None,
        };

        self.store.put_agent(&agent).await?;
        self.state.write().await.insert(agent.clone());

        info!(
            agent_id = %agent.agent_id,
            endpoint = %agent.endpoint,
            capabilities = agent.capabilities.len(),
            "Registered agent"
        );
        Ok(agent)
    }

    /// Remove an agent; returns false if it was not registered
    pub async fn unregister_agent(&self, agent_id: &AgentId) -> Result<bool, DirectoryError> {
        if !self.state.read().await.agents.contains_key(agent_id) {
            return Ok(false);
        }

        self.store.delete_agent(agent_id).await?;
        let removed = self.state.write().await.remove(agent_id).is_some();

        info!(agent_id = %agent_id, "Unregistered agent");
        Ok(removed)
    }

    pub async fn get_agent(&self, agent_id: &AgentId) -> Option<AgentInfo> {
        self.state.read().await.agents.get(agent_id).cloned()
    }

    /// Find the active agent a node should be dispatched to
    pub async fn resolve(
        &self,
        node_id: &NodeId,
        agent_id: Option<&AgentId>,
    ) -> Result<AgentInfo, AgentError> {
        let agent_id = agent_id.ok_or_else(|| AgentError::Unassigned(node_id.clone()))?;

        match self.state.read().await.agents.get(agent_id) {
            None => Err(AgentError::NotFound(agent_id.clone())),
            Some(agent) if !agent.is_active => Err(AgentError::Inactive(agent_id.clone())),
            Some(agent) => Ok(agent.clone()),
        }
    }

    /// All registered agents, ordered by id
    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        self.collect(|_| true).await
    }

    pub async fn list_active_agents(&self) -> Vec<AgentInfo> {
        self.collect(|agent| agent.is_active).await
    }

    /// Active agents advertising a capability
    pub async fn agents_by_capability(&self, capability: &Capability) -> Vec<AgentInfo> {
        let state = self.state.read().await;
        let mut agents: Vec<AgentInfo> = state
            .by_capability
            .get(capability)
            .into_iter()
            .flatten()
            .filter_map(|id| state.agents.get(id))
            .filter(|agent| agent.is_active)
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Active agents of a kind
    pub async fn agents_by_kind(&self, kind: NodeKind) -> Vec<AgentInfo> {
        self.collect(|agent| agent.is_active && agent.kind == kind)
            .await
    }

    async fn collect(&self, keep: impl Fn(&AgentInfo) -> bool) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self
            .state
            .read()
            .await
            .agents
            .values()
            .filter(|agent| keep(agent))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Probe one agent and record the outcome in memory.
    ///
    /// Inactive agents are reported unhealthy without a probe. Failures are
    /// logged only; they never deactivate the agent.
    pub async fn health_check_agent(&self, agent_id: &AgentId) -> bool {
        let Some(agent) = self.get_agent(agent_id).await else {
            return false;
        };
        if !agent.is_active {
            debug!(agent_id = %agent_id, "Skipping health check of inactive agent");
            return false;
        }

        let healthy = match self.client.health(&agent).await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Agent health check failed");
                false
            }
        };

        if let Some(entry) = self.state.write().await.agents.get_mut(agent_id) {
            entry.healthy = Some(healthy);
            if healthy {
                entry.last_health_check = Some(Utc::now());
            }
        }

        if healthy {
            debug!(agent_id = %agent_id, "Agent healthy");
        } else {
            warn!(agent_id = %agent_id, endpoint = %agent.endpoint, "Agent unhealthy");
        }
        healthy
    }

    /// Probe every active agent; returns how many were healthy
    pub async fn check_all(&self) -> usize {
        let ids: Vec<AgentId> = self
            .list_active_agents()
            .await
            .into_iter()
            .map(|agent| agent.agent_id)
            .collect();

        let mut healthy = 0;
        for agent_id in &ids {
            if self.health_check_agent(agent_id).await {
                healthy += 1;
            }
        }

        debug!(checked = ids.len(), healthy = healthy, "Health sweep complete");
        healthy
    }

    /// Start the periodic health sweep; a second call is a no-op
    pub async fn spawn_health_loop(self: &Arc<Self>) {
        let mut slot = self.health_loop.lock().await;
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let directory = Arc::clone(self);
        let cancelled = token.clone();
        let period = self.config.health_check_interval();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        directory.check_all().await;
                    }
                }
            }
        });

        info!(interval_secs = period.as_secs(), "Started agent health loop");
        *slot = Some(HealthLoop { token, handle });
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), AgentError> {
    let invalid = |reason: String| AgentError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };

    let url = url::Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme '{}'", other))),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}

impl std::fmt::Debug for AgentDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDirectory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchRequest, HttpAgentClient};
    use crate::error::DispatchError;
    use crate::storage::MemoryStateStore;
    use crate::types::JsonObject;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Health-only client that counts probes
    #[derive(Default)]
    struct CountingClient {
        probes: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl AgentClient for CountingClient {
        async fn execute(
            &self,
            _agent: &AgentInfo,
            _request: &DispatchRequest,
        ) -> Result<JsonObject, DispatchError> {
            Ok(JsonObject::new())
        }

        async fn health(&self, _agent: &AgentInfo) -> Result<bool, DispatchError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    fn registration(id: &str, endpoint: &str, capabilities: &[&str]) -> AgentRegistration {
        AgentRegistration {
            agent_id: AgentId::new(id),
            name: id.to_string(),
            description: String::new(),
            endpoint: endpoint.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            kind: NodeKind::Processor,
            is_active: true,
        }
    }

    fn directory_with(store: Arc<dyn StateStore>) -> Arc<AgentDirectory> {
        let client = HttpAgentClient::new(Duration::from_secs(2), Duration::from_secs(1)).unwrap();
        Arc::new(AgentDirectory::new(
            store,
            Arc::new(client),
            DirectoryConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_register_then_resolve() {
        let store = Arc::new(MemoryStateStore::new());
        let directory = directory_with(store.clone());

        directory
            .register_agent(registration("scorer", "http://scorer.local:8080", &["credit_analysis"]))
            .await
            .unwrap();

        let agent = directory
            .resolve(&NodeId::new("score"), Some(&AgentId::new("scorer")))
            .await
            .unwrap();
        assert_eq!(agent.endpoint, "http://scorer.local:8080");

        // Persisted as well
        let stored = store.get_agent(&AgentId::new("scorer")).await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let directory = directory_with(Arc::new(MemoryStateStore::new()));
        let mut dormant = registration("dormant", "http://dormant.local", &["ocr"]);
        dormant.is_active = false;
        directory.register_agent(dormant).await.unwrap();

        let node = NodeId::new("n");
        assert_eq!(
            directory.resolve(&node, None).await.unwrap_err(),
            AgentError::Unassigned(node.clone())
        );
        assert_eq!(
            directory.resolve(&node, Some(&AgentId::new("ghost"))).await.unwrap_err(),
            AgentError::NotFound(AgentId::new("ghost"))
        );
        assert_eq!(
            directory.resolve(&node, Some(&AgentId::new("dormant"))).await.unwrap_err(),
            AgentError::Inactive(AgentId::new("dormant"))
        );
    }

    #[tokio::test]
    async fn test_registration_validation() {
        let directory = directory_with(Arc::new(MemoryStateStore::new()));

        let cases = [
            registration("a", "ftp://files.local", &["ocr"]),
            registration("b", "not a url", &["ocr"]),
            registration("c", "http://ok.local", &[]),
            registration("d", "http://ok.local", &["Bad Tag"]),
        ];
        for case in cases {
            let err = directory.register_agent(case).await.unwrap_err();
            assert!(matches!(err, DirectoryError::Agent(_)), "{err}");
        }
        assert!(directory.list_agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_reregistration_replaces_capabilities() {
        let directory = directory_with(Arc::new(MemoryStateStore::new()));
        let first = directory
            .register_agent(registration("scorer", "http://a.local", &["credit_analysis", "risk"]))
            .await
            .unwrap();
        let second = directory
            .register_agent(registration("scorer", "http://b.local", &["risk"]))
            .await
            .unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert_eq!(directory.list_agents().await.len(), 1);
        assert!(directory
            .agents_by_capability(&Capability::parse("credit_analysis").unwrap())
            .await
            .is_empty());
        let risk = directory
            .agents_by_capability(&Capability::parse("risk").unwrap())
            .await;
        assert_eq!(risk.len(), 1);
        assert_eq!(risk[0].endpoint, "http://b.local");
    }

    #[tokio::test]
    async fn test_lookup_by_kind_and_capability() {
        let directory = directory_with(Arc::new(MemoryStateStore::new()));
        directory
            .register_agent(registration("scorer", "http://a.local", &["risk"]))
            .await
            .unwrap();
        let mut collector = registration("collector", "http://b.local", &["intake", "risk"]);
        collector.kind = NodeKind::Input;
        directory.register_agent(collector).await.unwrap();

        let risk = directory
            .agents_by_capability(&Capability::parse("risk").unwrap())
            .await;
        let ids: Vec<_> = risk.iter().map(|a| a.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["collector", "scorer"]);

        let inputs = directory.agents_by_kind(NodeKind::Input).await;
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].agent_id.as_str(), "collector");
    }

    #[tokio::test]
    async fn test_unregister_removes_everywhere() {
        let store = Arc::new(MemoryStateStore::new());
        let directory = directory_with(store.clone());
        directory
            .register_agent(registration("scorer", "http://a.local", &["risk"]))
            .await
            .unwrap();

        assert!(directory.unregister_agent(&AgentId::new("scorer")).await.unwrap());
        assert!(!directory.unregister_agent(&AgentId::new("scorer")).await.unwrap());
        assert!(directory.get_agent(&AgentId::new("scorer")).await.is_none());
        assert!(store.get_agent(&AgentId::new("scorer")).await.unwrap().is_none());
        assert!(directory
            .agents_by_capability(&Capability::parse("risk").unwrap())
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_load_from_store_skips_inactive() {
        let store = Arc::new(MemoryStateStore::new());
        {
            let seed = directory_with(store.clone());
            seed.register_agent(registration("live", "http://a.local", &["risk"]))
                .await
                .unwrap();
            let mut off = registration("off", "http://b.local", &["risk"]);
            off.is_active = false;
            seed.register_agent(off).await.unwrap();
        }

        let directory = directory_with(store);
        assert_eq!(directory.load_from_store().await.unwrap(), 1);
        assert!(directory.get_agent(&AgentId::new("live")).await.is_some());
        assert!(directory.get_agent(&AgentId::new("off")).await.is_none());
    }

    #[tokio::test]
    async fn test_health_check_records_outcome_without_deactivating() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let directory = directory_with(Arc::new(MemoryStateStore::new()));
        directory
            .register_agent(registration("up", &server.uri(), &["risk"]))
            .await
            .unwrap();
        directory
            .register_agent(registration("down", "http://127.0.0.1:9", &["risk"]))
            .await
            .unwrap();

        assert!(directory.health_check_agent(&AgentId::new("up")).await);
        assert!(!directory.health_check_agent(&AgentId::new("down")).await);
        assert!(!directory.health_check_agent(&AgentId::new("ghost")).await);

        let up = directory.get_agent(&AgentId::new("up")).await.unwrap();
        assert_eq!(up.healthy, Some(true));
        assert!(up.last_health_check.is_some());

        let down = directory.get_agent(&AgentId::new("down")).await.unwrap();
        assert_eq!(down.healthy, Some(false));
        assert!(down.last_health_check.is_none());
        assert!(down.is_active);
    }

    #[tokio::test]
    async fn test_health_check_skips_inactive_agent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let directory = directory_with(Arc::new(MemoryStateStore::new()));
        let mut dormant = registration("dormant", &server.uri(), &["risk"]);
        dormant.is_active = false;
        directory.register_agent(dormant).await.unwrap();

        assert!(!directory.health_check_agent(&AgentId::new("dormant")).await);

        let agent = directory.get_agent(&AgentId::new("dormant")).await.unwrap();
        assert_eq!(agent.healthy, None);
        assert!(agent.last_health_check.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loop_runs_until_shutdown() {
        let client = Arc::new(CountingClient::default());
        let directory = Arc::new(AgentDirectory::new(
            Arc::new(MemoryStateStore::new()),
            client.clone(),
            DirectoryConfig::default(),
        ));
        directory
            .register_agent(registration("scorer", "http://a.local", &["risk"]))
            .await
            .unwrap();

        directory.start().await.unwrap();
        // Ticks at 0s, 30s and 60s
        tokio::time::sleep(Duration::from_secs(65)).await;
        directory.shutdown().await;

        let probes = client.probes.load(Ordering::SeqCst);
        assert_eq!(probes, 3);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(client.probes.load(Ordering::SeqCst), probes);
    }
}
