//! Orchestration engine for multi-stage security assessments.
//!
//! Every component here is a thin handle over an injected
//! [`Store`](vigil_store::Store), so the orchestrator service, each agent
//! process and each observer can run separately and still agree on state.
//!
//! # Main types
//!
//! - [`TaskQueue`]: type-partitioned priority queue with atomic claim and a
//!   forward-only status machine.
//! - [`MessageBus`]: persisted agent messages, announced on `agent_messages`
//!   and dispatched by a [`BusListener`].
//! - [`WorkflowOrchestrator`]: creates each workflow stage when the previous
//!   one completes, and fails the workflow when a stage fails.
//! - [`AgentRegistry`]: agent descriptors indexed by type.
//! - [`AgentWorker`]: runs a [`TaskProcessor`] as a polling agent, and on
//!   a [`MessageBus`] as the target of direct task assignments.

/// Store-backed message bus and listener.
pub mod message_bus;
/// Agent directory.
pub mod registry;
/// Priority task queue and task lifecycle.
pub mod task_queue;
/// Agent runtime: processors, progress reporting, poll backoff.
pub mod worker;
/// Event-driven workflow advancement.
pub mod workflow;

pub use message_bus::{BusListener, DispatchReport, MessageBus, MessageHandler, DEFAULT_MESSAGE_TTL};
pub use registry::AgentRegistry;
pub use task_queue::TaskQueue;
pub use worker::{
    AgentWorker, PollBackoff, ProgressReporter, TaskProcessor, KNOWLEDGE_BASE_AGENT,
};
pub use workflow::{WorkflowOrchestrator, STAGE_PRIORITY};
