//! Store key and channel naming shared by every process.

use uuid::Uuid;

/// Pub/sub channel carrying [`LifecycleEvent`](crate::LifecycleEvent)s.
pub const TASK_UPDATES_CHANNEL: &str = "task_updates";
/// Pub/sub channel carrying [`MessageNotice`](crate::MessageNotice)s.
pub const AGENT_MESSAGES_CHANNEL: &str = "agent_messages";

pub const TASK_PREFIX: &str = "task:";
pub const WORKFLOW_PREFIX: &str = "workflow:";
pub const AGENT_PREFIX: &str = "agent:";
pub const MESSAGE_PREFIX: &str = "message:";

pub fn task(id: Uuid) -> String {
    format!("{TASK_PREFIX}{id}")
}

pub fn result(task_id: Uuid) -> String {
    format!("result:{task_id}")
}

pub fn queue(task_type: crate::TaskType) -> String {
    format!("queue:{task_type}")
}

pub fn workflow(id: Uuid) -> String {
    format!("{WORKFLOW_PREFIX}{id}")
}

/// Guard key claimed once by whoever creates stage `index` of a workflow.
pub fn workflow_stage(id: Uuid, index: usize) -> String {
    format!("{WORKFLOW_PREFIX}{id}:stage:{index}")
}

/// Reverse index from a stage task to its workflow.
pub fn workflow_of_task(task_id: Uuid) -> String {
    format!("workflow_task:{task_id}")
}

pub fn agent(id: &str) -> String {
    format!("{AGENT_PREFIX}{id}")
}

pub fn agents_of_type(agent_type: &str) -> String {
    format!("agents:{agent_type}")
}

pub fn message(id: Uuid) -> String {
    format!("{MESSAGE_PREFIX}{id}")
}

/// Parses the id out of a `prefix{uuid}` key; `None` for other key shapes.
pub fn parse_id(key: &str, prefix: &str) -> Option<Uuid> {
    key.strip_prefix(prefix).and_then(|rest| Uuid::parse_str(rest).ok())
}
