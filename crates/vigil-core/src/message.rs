use crate::task::{Outcome, ResultPayload, TaskScope, TaskStatus, TaskType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Tag of a [`MessageContent`]; handlers register against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssignment,
    TaskStatusUpdate,
    TaskResult,
    KnowledgeQuery,
    KnowledgeResponse,
    Notification,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskAssignment => "task_assignment",
            MessageType::TaskStatusUpdate => "task_status_update",
            MessageType::TaskResult => "task_result",
            MessageType::KnowledgeQuery => "knowledge_query",
            MessageType::KnowledgeResponse => "knowledge_response",
            MessageType::Notification => "notification",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_n_results() -> u32 {
    5
}

/// Typed body of a [`Message`], serialized as `message_type` + `content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", content = "content", rename_all = "snake_case")]
pub enum MessageContent {
    TaskAssignment {
        task_id: Uuid,
        task_type: TaskType,
        target: String,
        #[serde(default)]
        scope: Option<TaskScope>,
        #[serde(default)]
        description: String,
    },
    TaskStatusUpdate {
        task_id: Uuid,
        status: TaskStatus,
        #[serde(default)]
        progress: f32,
        #[serde(default)]
        message: String,
    },
    TaskResult {
        task_id: Uuid,
        outcome: Outcome,
        #[serde(default)]
        summary: String,
        #[serde(default)]
        payload: Option<ResultPayload>,
    },
    /// Request to the knowledge base collaborator. Opaque to the engine.
    KnowledgeQuery {
        query: String,
        collection: String,
        #[serde(default = "default_n_results")]
        n_results: u32,
    },
    KnowledgeResponse {
        query: String,
        #[serde(default)]
        results: Vec<serde_json::Value>,
    },
    Notification {
        subject: String,
        #[serde(default)]
        body: String,
    },
}

impl MessageContent {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageContent::TaskAssignment { .. } => MessageType::TaskAssignment,
            MessageContent::TaskStatusUpdate { .. } => MessageType::TaskStatusUpdate,
            MessageContent::TaskResult { .. } => MessageType::TaskResult,
            MessageContent::KnowledgeQuery { .. } => MessageType::KnowledgeQuery,
            MessageContent::KnowledgeResponse { .. } => MessageType::KnowledgeResponse,
            MessageContent::Notification { .. } => MessageType::Notification,
        }
    }
}

/// A message exchanged between agents. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub sender_id: String,
    /// `None` means every handler of the message type receives it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(flatten)]
    pub body: MessageContent,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    /// Creates a broadcast message from `sender_id`.
    pub fn new(sender_id: impl Into<String>, body: MessageContent) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            sender_id: sender_id.into(),
            recipient_id: None,
            body,
            timestamp: Utc::now(),
            reply_to: None,
            metadata: HashMap::new(),
        }
    }

    /// Addresses the message to a single agent.
    pub fn to(mut self, recipient_id: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    pub fn in_reply_to(mut self, message_id: Uuid) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// True if the message was sent by or addressed to `agent_id`.
    pub fn involves(&self, agent_id: &str) -> bool {
        self.sender_id == agent_id || self.recipient_id.as_deref() == Some(agent_id)
    }
}

/// Lightweight notice published on the bus channel after a message is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageNotice {
    pub message_id: Uuid,
    pub message_type: MessageType,
}
