//! Core types and error definitions for the Vigil orchestration engine.
//!
//! Every other crate speaks in these types: the records kept in the shared
//! store, the lifecycle events published on `task_updates`, and the typed
//! message bodies carried by the bus.
//!
//! # Main types
//!
//! - [`Task`], [`TaskResult`]: units of work and their immutable results.
//! - [`Workflow`]: ordered chain of stage tasks.
//! - [`Agent`]: descriptor of a registered worker.
//! - [`Message`]: inter-agent message with a typed [`MessageContent`].
//! - [`LifecycleEvent`]: task and workflow transitions fanned out to observers.
//! - [`VigilError`]: error taxonomy shared by all components.

pub mod agent;
pub mod error;
pub mod event;
pub mod keys;
pub mod message;
pub mod task;
pub mod workflow;

pub use agent::{Agent, AgentStatus};
pub use error::{VigilError, VigilResult};
pub use event::{LifecycleEvent, TaskEvent, TaskEventKind, WorkflowEvent, WorkflowEventKind};
pub use message::{Message, MessageContent, MessageNotice, MessageType};
pub use task::{
    validate_progress, ExploitAttempt, ExploitationFindings, Finding, NewTask, NewTaskResult,
    Outcome, ReconFindings, ReportDraft, ReportSection, ResultPayload, ServiceFingerprint,
    Severity, Task, TaskResult, TaskScope, TaskStatus, TaskType, VulnerabilityFindings,
};
pub use workflow::{
    StageEntry, StageSnapshot, Workflow, WorkflowKind, WorkflowReport, WorkflowStatus,
};
