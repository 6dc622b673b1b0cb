use crate::task::{Task, TaskStatus, TaskType};
use crate::workflow::{Workflow, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    TaskCreated,
    TaskAssigned,
    TaskUpdated,
    TaskCompleted,
    TaskFailed,
}

impl TaskEventKind {
    pub fn for_status(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Created => TaskEventKind::TaskCreated,
            TaskStatus::Assigned => TaskEventKind::TaskAssigned,
            TaskStatus::InProgress => TaskEventKind::TaskUpdated,
            TaskStatus::Completed => TaskEventKind::TaskCompleted,
            TaskStatus::Failed => TaskEventKind::TaskFailed,
        }
    }
}

/// Emitted on every accepted task status change or progress report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event: TaskEventKind,
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub progress: f32,
    #[serde(default)]
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn from_task(event: TaskEventKind, task: &Task) -> Self {
        Self {
            event,
            task_id: task.id,
            status: task.status,
            progress: task.progress,
            message: task.message.clone(),
            timestamp: task.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventKind {
    WorkflowStarted,
    WorkflowAdvanced,
    WorkflowCompleted,
    WorkflowFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event: WorkflowEventKind,
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    /// Stage task the event refers to (the new stage, or the failed one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_type: Option<TaskType>,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn new(event: WorkflowEventKind, workflow: &Workflow) -> Self {
        let last = workflow.stages.last();
        Self {
            event,
            workflow_id: workflow.id,
            status: workflow.status,
            task_id: last.map(|s| s.task_id),
            stage_type: last.map(|s| s.stage_type),
            timestamp: workflow.updated_at,
        }
    }
}

/// Everything published on the `task_updates` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LifecycleEvent {
    Task(TaskEvent),
    Workflow(WorkflowEvent),
}

impl LifecycleEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            LifecycleEvent::Task(e) => Some(e.task_id),
            LifecycleEvent::Workflow(e) => e.task_id,
        }
    }
}

impl From<TaskEvent> for LifecycleEvent {
    fn from(event: TaskEvent) -> Self {
        LifecycleEvent::Task(event)
    }
}

impl From<WorkflowEvent> for LifecycleEvent {
    fn from(event: WorkflowEvent) -> Self {
        LifecycleEvent::Workflow(event)
    }
}
