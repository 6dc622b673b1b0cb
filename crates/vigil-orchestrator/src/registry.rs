use std::sync::Arc;
use tracing::info;
use vigil_core::{keys, Agent, AgentStatus, VigilError, VigilResult};
use vigil_store::Store;

/// Directory of agent descriptors, indexed by agent type.
///
/// There is no heartbeat: an agent that dies without unregistering stays
/// listed until someone removes it.
pub struct AgentRegistry {
    store: Arc<dyn Store>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Register or overwrite an agent. Re-registering resets it to idle.
    pub async fn register(
        &self,
        agent_id: &str,
        agent_type: &str,
        capabilities: Vec<String>,
    ) -> VigilResult<Agent> {
        if agent_id.trim().is_empty() {
            return Err(VigilError::validation("agent_id must not be empty"));
        }
        if agent_type.trim().is_empty() {
            return Err(VigilError::validation("agent_type must not be empty"));
        }

        if let Some(previous) = self.load(agent_id).await? {
            if previous.agent_type != agent_type {
                self.store
                    .set_remove(&keys::agents_of_type(&previous.agent_type), agent_id)
                    .await?;
            }
        }

        let agent = Agent::new(agent_id, agent_type, capabilities);
        self.save(&agent).await?;
        self.store
            .set_add(&keys::agents_of_type(agent_type), agent_id)
            .await?;

        info!(agent_id, agent_type, capabilities = ?agent.capabilities, "Agent registered");
        Ok(agent)
    }

    pub async fn unregister(&self, agent_id: &str) -> VigilResult<()> {
        let agent = self.get(agent_id).await?;
        self.store.delete(&keys::agent(agent_id)).await?;
        self.store
            .set_remove(&keys::agents_of_type(&agent.agent_type), agent_id)
            .await?;
        info!(agent_id, "Agent unregistered");
        Ok(())
    }

    pub async fn update_status(&self, agent_id: &str, status: AgentStatus) -> VigilResult<Agent> {
        let mut agent = self.get(agent_id).await?;
        agent.status = status;
        self.save(&agent).await?;
        Ok(agent)
    }

    pub async fn get(&self, agent_id: &str) -> VigilResult<Agent> {
        self.load(agent_id)
            .await?
            .ok_or_else(|| VigilError::not_found(format!("agent {agent_id}")))
    }

    /// Registered agents, optionally only those of `agent_type`, sorted by id.
    pub async fn list(&self, agent_type: Option<&str>) -> VigilResult<Vec<Agent>> {
        let ids: Vec<String> = match agent_type {
            Some(agent_type) => {
                self.store
                    .set_members(&keys::agents_of_type(agent_type))
                    .await?
            }
            None => self
                .store
                .keys(keys::AGENT_PREFIX)
                .await?
                .into_iter()
                .filter_map(|k| k.strip_prefix(keys::AGENT_PREFIX).map(str::to_string))
                .collect(),
        };

        let mut agents = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(agent) = self.load(&id).await? {
                agents.push(agent);
            }
        }
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }

    async fn load(&self, agent_id: &str) -> VigilResult<Option<Agent>> {
        match self.store.get(&keys::agent(agent_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, agent: &Agent) -> VigilResult<()> {
        let json = serde_json::to_string(agent)?;
        self.store
            .set(&keys::agent(&agent.agent_id), &json, None)
            .await
    }
}
