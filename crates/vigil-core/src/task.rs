use crate::error::{VigilError, VigilResult};
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

/// Stage of a security assessment a task belongs to.
///
/// Each type has its own queue partition; agents claim by type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Reconnaissance,
    VulnerabilityDiscovery,
    Exploitation,
    Reporting,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Reconnaissance,
        TaskType::VulnerabilityDiscovery,
        TaskType::Exploitation,
        TaskType::Reporting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Reconnaissance => "reconnaissance",
            TaskType::VulnerabilityDiscovery => "vulnerability_discovery",
            TaskType::Exploitation => "exploitation",
            TaskType::Reporting => "reporting",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| VigilError::validation(format!("unknown task type: {s}")))
    }
}

fn default_max_depth() -> u32 {
    2
}

/// Structural constraints an agent must stay within.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskScope {
    /// Address range in CIDR notation.
    pub ip_range: String,
    #[serde(default)]
    pub excluded_ips: Vec<String>,
    #[serde(default)]
    pub excluded_ports: Vec<u16>,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
}

impl TaskScope {
    pub fn new(ip_range: impl Into<String>) -> Self {
        Self {
            ip_range: ip_range.into(),
            excluded_ips: Vec::new(),
            excluded_ports: Vec::new(),
            max_depth: default_max_depth(),
        }
    }

    pub fn excluding_ips<I, S>(mut self, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_ips = ips.into_iter().map(Into::into).collect();
        self
    }

    pub fn excluding_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.excluded_ports = ports.into_iter().collect();
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Parsed form of [`TaskScope::ip_range`].
    pub fn network(&self) -> VigilResult<IpNetwork> {
        self.ip_range.trim().parse::<IpNetwork>().map_err(|e| {
            VigilError::validation(format!("invalid ip_range '{}': {e}", self.ip_range))
        })
    }

    /// Checks that the scope is well-formed. Whether the target actually lies
    /// inside the range is a policy question and is not checked here.
    pub fn validate(&self) -> VigilResult<()> {
        self.network()?;
        for ip in &self.excluded_ips {
            ip.trim().parse::<IpAddr>().map_err(|e| {
                VigilError::validation(format!("invalid excluded ip '{ip}': {e}"))
            })?;
        }
        if self.excluded_ports.contains(&0) {
            return Err(VigilError::validation("excluded port 0 is not a valid port"));
        }
        if self.max_depth == 0 {
            return Err(VigilError::validation("max_depth must be at least 1"));
        }
        Ok(())
    }
}

/// Lifecycle status of a task.
///
/// `created → assigned → in_progress → {completed | failed}`; the last two
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Position along the lifecycle. Both terminal states share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            TaskStatus::Created => 0,
            TaskStatus::Assigned => 1,
            TaskStatus::InProgress => 2,
            TaskStatus::Completed | TaskStatus::Failed => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// True if moving from `self` to `next` goes strictly forward.
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(TaskStatus::Created),
            "assigned" => Ok(TaskStatus::Assigned),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(VigilError::validation(format!("unknown task status: {other}"))),
        }
    }
}

/// A unit of security-testing work, as stored under `task:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub target: String,
    pub scope: TaskScope,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<Uuid>,
    pub priority: u8,
    pub status: TaskStatus,
    pub progress: f32,
    #[serde(default)]
    pub message: String,
    /// Agent that claimed the task, if it was claimed through one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_priority() -> u8 {
    1
}

/// Request to enqueue a task. Validated by [`NewTask::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub target: String,
    pub scope: TaskScope,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub parent_task_id: Option<Uuid>,
}

impl NewTask {
    pub fn new(task_type: TaskType, target: impl Into<String>, scope: TaskScope) -> Self {
        Self {
            task_type,
            target: target.into(),
            scope,
            description: String::new(),
            priority: default_priority(),
            parent_task_id: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent_task_id: Uuid) -> Self {
        self.parent_task_id = Some(parent_task_id);
        self
    }

    pub fn validate(&self) -> VigilResult<()> {
        if self.target.trim().is_empty() {
            return Err(VigilError::validation("target must not be empty"));
        }
        self.scope.validate()
    }

    /// Materialize the record in `created` status.
    pub fn into_task(self) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            task_type: self.task_type,
            target: self.target.trim().to_string(),
            scope: self.scope,
            description: self.description,
            parent_task_id: self.parent_task_id,
            priority: self.priority,
            status: TaskStatus::Created,
            progress: 0.0,
            message: String::new(),
            assigned_agent: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Checks a reported progress value.
pub fn validate_progress(progress: f32) -> VigilResult<()> {
    if !progress.is_finite() || !(0.0..=100.0).contains(&progress) {
        return Err(VigilError::validation(format!(
            "progress must be within 0..=100, got {progress}"
        )));
    }
    Ok(())
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Partial,
    Failed,
}

impl Outcome {
    /// Task status reached when a result with this outcome is stored.
    pub fn terminal_status(&self) -> TaskStatus {
        match self {
            Outcome::Success | Outcome::Partial => TaskStatus::Completed,
            Outcome::Failed => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFingerprint {
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconFindings {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub open_ports: Vec<u16>,
    #[serde(default)]
    pub services: Vec<ServiceFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub title: String,
    pub severity: Severity,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub cve: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityFindings {
    #[serde(default)]
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExploitAttempt {
    pub technique: String,
    #[serde(default)]
    pub finding: Option<String>,
    pub succeeded: bool,
    #[serde(default)]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExploitationFindings {
    #[serde(default)]
    pub attempts: Vec<ExploitAttempt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSection {
    pub heading: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDraft {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub sections: Vec<ReportSection>,
}

/// Domain payload of a result, keyed by the task type that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultPayload {
    Reconnaissance(ReconFindings),
    VulnerabilityDiscovery(VulnerabilityFindings),
    Exploitation(ExploitationFindings),
    Reporting(ReportDraft),
}

impl ResultPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            ResultPayload::Reconnaissance(_) => TaskType::Reconnaissance,
            ResultPayload::VulnerabilityDiscovery(_) => TaskType::VulnerabilityDiscovery,
            ResultPayload::Exploitation(_) => TaskType::Exploitation,
            ResultPayload::Reporting(_) => TaskType::Reporting,
        }
    }

    /// Empty payload of the given type, used when a stage produced nothing.
    pub fn empty(task_type: TaskType) -> Self {
        match task_type {
            TaskType::Reconnaissance => ResultPayload::Reconnaissance(ReconFindings::default()),
            TaskType::VulnerabilityDiscovery => {
                ResultPayload::VulnerabilityDiscovery(VulnerabilityFindings::default())
            }
            TaskType::Exploitation => ResultPayload::Exploitation(ExploitationFindings::default()),
            TaskType::Reporting => ResultPayload::Reporting(ReportDraft::default()),
        }
    }
}

/// Result reported by an agent, before it is stamped and stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTaskResult {
    pub outcome: Outcome,
    pub payload: ResultPayload,
    #[serde(default)]
    pub summary: String,
}

impl NewTaskResult {
    pub fn new(outcome: Outcome, payload: ResultPayload) -> Self {
        Self {
            outcome,
            payload,
            summary: String::new(),
        }
    }

    pub fn success(payload: ResultPayload) -> Self {
        Self::new(Outcome::Success, payload)
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }
}

/// Immutable record stored under `result:{task_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub outcome: Outcome,
    pub payload: ResultPayload,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
