use crate::error::VigilError;
use crate::task::{Task, TaskResult, TaskScope, TaskType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Known multi-stage assessments and their stage sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Reconnaissance followed by vulnerability discovery.
    ReconVuln,
    /// Every stage through to the report.
    FullAssessment,
}

impl WorkflowKind {
    pub fn stages(&self) -> &'static [TaskType] {
        match self {
            WorkflowKind::ReconVuln => &[TaskType::Reconnaissance, TaskType::VulnerabilityDiscovery],
            WorkflowKind::FullAssessment => &[
                TaskType::Reconnaissance,
                TaskType::VulnerabilityDiscovery,
                TaskType::Exploitation,
                TaskType::Reporting,
            ],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::ReconVuln => "recon_vuln",
            WorkflowKind::FullAssessment => "full_assessment",
        }
    }
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowKind {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recon_vuln" => Ok(WorkflowKind::ReconVuln),
            "full_assessment" => Ok(WorkflowKind::FullAssessment),
            other => Err(VigilError::validation(format!("unknown workflow type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

/// One task in a workflow's ordered stage list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEntry {
    pub task_id: Uuid,
    pub stage_type: TaskType,
    pub added_at: DateTime<Utc>,
}

/// Ordered composition of tasks, stored under `workflow:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub workflow_type: WorkflowKind,
    pub target: String,
    pub scope: TaskScope,
    #[serde(default)]
    pub description: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub stages: Vec<StageEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(
        workflow_type: WorkflowKind,
        target: impl Into<String>,
        scope: TaskScope,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_type,
            target: target.into(),
            scope,
            description: description.into(),
            status: WorkflowStatus::Pending,
            stages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Stage type that follows the current last stage, if any.
    pub fn next_stage_type(&self) -> Option<TaskType> {
        self.workflow_type.stages().get(self.stages.len()).copied()
    }

    pub fn is_final_stage(&self, index: usize) -> bool {
        index + 1 == self.workflow_type.stages().len()
    }

    pub fn stage_index(&self, task_id: Uuid) -> Option<usize> {
        self.stages.iter().position(|s| s.task_id == task_id)
    }

    pub fn push_stage(&mut self, task_id: Uuid, stage_type: TaskType) {
        let now = Utc::now();
        self.stages.push(StageEntry {
            task_id,
            stage_type,
            added_at: now,
        });
        self.updated_at = now;
    }

    pub fn set_status(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Task and result of one stage at the time of the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub stage_type: TaskType,
    pub task: Task,
    #[serde(default)]
    pub result: Option<TaskResult>,
}

/// Snapshot of a finished workflow, handed to the report generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub workflow: Workflow,
    pub stages: Vec<StageSnapshot>,
}

impl WorkflowReport {
    /// The stage whose failure ended the workflow, if it failed.
    pub fn failed_stage(&self) -> Option<&StageSnapshot> {
        self.stages
            .iter()
            .find(|s| s.task.status == crate::TaskStatus::Failed)
    }
}
