use crate::error::VigilError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Availability of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
}

impl FromStr for AgentStatus {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(AgentStatus::Idle),
            "busy" => Ok(AgentStatus::Busy),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(VigilError::validation(format!("unknown agent status: {other}"))),
        }
    }
}

/// Descriptor of a worker process, stored under `agent:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    /// Usually a task type name; `knowledge_base` and similar helpers use their own.
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            capabilities,
            status: AgentStatus::Idle,
            registered_at: Utc::now(),
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}
