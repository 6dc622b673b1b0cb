use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vigil_core::{
    Agent, AgentStatus, Message, MessageContent, MessageType, NewTaskResult, Outcome, Task,
    TaskResult, TaskStatus, TaskType, VigilError, VigilResult,
};

use crate::message_bus::{MessageBus, MessageHandler};
use crate::registry::AgentRegistry;
use crate::task_queue::TaskQueue;

/// Behavior of an agent: which task types it takes and how it runs them.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Task types this processor claims, in the order they are polled.
    fn task_types(&self) -> &[TaskType];

    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Run one claimed task. An `Err` fails the task with the error text.
    async fn process(&self, task: &Task, progress: &ProgressReporter)
        -> VigilResult<NewTaskResult>;
}

/// Lets a [`TaskProcessor`] report progress on the task it is running.
pub struct ProgressReporter {
    queue: Arc<TaskQueue>,
    task_id: Uuid,
}

impl ProgressReporter {
    pub fn new(queue: Arc<TaskQueue>, task_id: Uuid) -> Self {
        Self { queue, task_id }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Progress may only grow while the task is in progress.
    pub async fn report(&self, progress: f32, message: impl Into<String>) -> VigilResult<()> {
        self.queue
            .update_status(
                self.task_id,
                TaskStatus::InProgress,
                Some(progress),
                Some(message.into()),
            )
            .await
            .map(|_| ())
    }
}

/// Exponential delay between empty polls, reset once work is found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollBackoff {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl PollBackoff {
    /// Delay after `empty_polls` consecutive empty polls.
    pub fn delay(&self, empty_polls: u32) -> Duration {
        let exponent = i32::try_from(empty_polls).unwrap_or(i32::MAX);
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if base.is_finite() {
            (base as u64).min(self.max_delay_ms)
        } else {
            self.max_delay_ms
        };
        Duration::from_millis(capped)
    }
}

/// Agent id knowledge queries are addressed to.
pub const KNOWLEDGE_BASE_AGENT: &str = "knowledge_base_agent";

type PendingQueries = Mutex<HashMap<Uuid, oneshot::Sender<Message>>>;

/// How one task run ended.
enum Execution {
    Completed(TaskResult),
    Failed(String),
}

/// Runs a [`TaskProcessor`] against the shared queue as a registered agent.
///
/// With a [`MessageBus`] attached the worker also runs tasks handed to it in
/// `task_assignment` messages, replying with a `task_result`, and can ask
/// the knowledge base agent questions over the bus.
pub struct AgentWorker {
    agent_id: String,
    agent_type: String,
    processor: Arc<dyn TaskProcessor>,
    queue: Arc<TaskQueue>,
    registry: Arc<AgentRegistry>,
    backoff: PollBackoff,
    bus: Option<Arc<MessageBus>>,
    pending: Arc<PendingQueries>,
}

impl AgentWorker {
    pub fn new(
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        processor: Arc<dyn TaskProcessor>,
        queue: Arc<TaskQueue>,
        registry: Arc<AgentRegistry>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            processor,
            queue,
            registry,
            backoff: PollBackoff::default(),
            bus: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_backoff(mut self, backoff: PollBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub async fn register(&self) -> VigilResult<Agent> {
        self.registry
            .register(
                &self.agent_id,
                &self.agent_type,
                self.processor.capabilities(),
            )
            .await
    }

    /// Register this worker's message handlers on its bus: task assignments
    /// addressed to it, and knowledge responses to its own queries.
    ///
    /// Handlers run on whichever [`crate::BusListener`] the caller drives.
    pub async fn attach(self: &Arc<Self>) -> VigilResult<()> {
        let bus = self.require_bus()?;
        bus.register_handler(
            MessageType::TaskAssignment,
            Arc::new(AssignmentHandler {
                worker: Arc::downgrade(self),
            }),
        )
        .await;
        bus.register_handler(
            MessageType::KnowledgeResponse,
            Arc::new(KnowledgeResponseHandler {
                agent_id: self.agent_id.clone(),
                pending: self.pending.clone(),
            }),
        )
        .await;
        debug!(agent_id = %self.agent_id, "Worker attached to message bus");
        Ok(())
    }

    /// Claim and run at most one task, polling each declared type in turn.
    /// Returns the id of the task that was run.
    ///
    /// An agent that is no longer registered claims nothing and gets
    /// `NotFound`.
    pub async fn run_once(&self) -> VigilResult<Option<Uuid>> {
        self.registry.get(&self.agent_id).await?;

        for &task_type in self.processor.task_types() {
            if let Some(task) = self
                .queue
                .claim_for_agent(task_type, &self.agent_id)
                .await?
            {
                let task_id = task.id;
                // The claim holds from here on; the task runs even if the
                // registry cannot be updated.
                self.set_agent_status(AgentStatus::Busy).await;
                let outcome = self.execute(&task, "Starting task").await;
                self.set_agent_status(AgentStatus::Idle).await;
                outcome?;
                return Ok(Some(task_id));
            }
        }
        Ok(None)
    }

    /// Run a task delivered in a `task_assignment` message and reply to the
    /// sender with a `task_result`.
    ///
    /// The assigner must have claimed the task for this agent first, so a
    /// task is never run by two agents.
    pub async fn handle_assignment(&self, message: &Message) -> VigilResult<()> {
        let MessageContent::TaskAssignment { task_id, .. } = &message.body else {
            return Err(VigilError::validation("not a task assignment"));
        };
        let task_id = *task_id;
        let (task, _) = self.queue.get(task_id).await?;
        if task.status != TaskStatus::Assigned
            || task.assigned_agent.as_deref() != Some(self.agent_id.as_str())
        {
            return Err(VigilError::validation(format!(
                "task {task_id} is not assigned to {}",
                self.agent_id
            )));
        }
        info!(agent_id = %self.agent_id, task_id = %task_id, sender_id = %message.sender_id, "Task assigned by message");

        self.set_agent_status(AgentStatus::Busy).await;
        let outcome = self
            .execute(&task, "Starting task from direct assignment")
            .await;
        self.set_agent_status(AgentStatus::Idle).await;

        let reply = match outcome? {
            Execution::Completed(result) => MessageContent::TaskResult {
                task_id,
                outcome: result.outcome,
                summary: result.summary,
                payload: Some(result.payload),
            },
            Execution::Failed(reason) => MessageContent::TaskResult {
                task_id,
                outcome: Outcome::Failed,
                summary: reason,
                payload: None,
            },
        };
        let reply = Message::new(self.agent_id.clone(), reply)
            .to(message.sender_id.clone())
            .in_reply_to(message.message_id);
        self.require_bus()?.send(reply).await?;
        Ok(())
    }

    /// Ask the knowledge base agent and wait up to `wait` for its answer.
    /// Returns the `results` of the matching `knowledge_response`.
    ///
    /// Requires [`AgentWorker::attach`] and a running bus listener.
    pub async fn query_knowledge(
        &self,
        query: &str,
        collection: &str,
        n_results: u32,
        wait: Duration,
    ) -> VigilResult<Vec<serde_json::Value>> {
        let bus = self.require_bus()?;
        let message = Message::new(
            self.agent_id.clone(),
            MessageContent::KnowledgeQuery {
                query: query.to_string(),
                collection: collection.to_string(),
                n_results,
            },
        )
        .to(KNOWLEDGE_BASE_AGENT);
        let query_id = message.message_id;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(query_id, tx);
        if let Err(e) = bus.send(message).await {
            self.pending.lock().remove(&query_id);
            return Err(e);
        }
        debug!(agent_id = %self.agent_id, message_id = %query_id, "Knowledge query sent");

        let answer = tokio::time::timeout(wait, rx).await;
        self.pending.lock().remove(&query_id);
        match answer {
            Ok(Ok(response)) => match response.body {
                MessageContent::KnowledgeResponse { results, .. } => Ok(results),
                _ => Err(VigilError::validation("reply is not a knowledge response")),
            },
            Ok(Err(_)) => Err(VigilError::Timeout(format!(
                "knowledge query {query_id} abandoned"
            ))),
            Err(_) => Err(VigilError::Timeout(format!(
                "no knowledge response to {query_id} within {wait:?}"
            ))),
        }
    }

    /// Moves the task through `in_progress` to its result or failure.
    async fn execute(&self, task: &Task, starting: &str) -> VigilResult<Execution> {
        self.queue
            .update_status(
                task.id,
                TaskStatus::InProgress,
                Some(0.0),
                Some(starting.to_string()),
            )
            .await?;

        let reporter = ProgressReporter::new(self.queue.clone(), task.id);
        let processed = AssertUnwindSafe(self.processor.process(task, &reporter))
            .catch_unwind()
            .await;

        let failure = match processed {
            Ok(Ok(result)) => {
                let stored = self.queue.store_result(task.id, result).await?;
                info!(agent_id = %self.agent_id, task_id = %task.id, "Task processed");
                return Ok(Execution::Completed(stored));
            }
            Ok(Err(e)) => {
                warn!(agent_id = %self.agent_id, task_id = %task.id, error = %e, "Task processing failed");
                e.to_string()
            }
            Err(_) => {
                error!(agent_id = %self.agent_id, task_id = %task.id, "Task processor panicked");
                "task processor panicked".to_string()
            }
        };
        self.queue
            .update_status(task.id, TaskStatus::Failed, None, Some(failure.clone()))
            .await?;
        Ok(Execution::Failed(failure))
    }

    async fn set_agent_status(&self, status: AgentStatus) {
        if let Err(e) = self.registry.update_status(&self.agent_id, status).await {
            warn!(agent_id = %self.agent_id, status = ?status, error = %e, "Could not update agent status");
        }
    }

    async fn is_unregistered(&self) -> bool {
        matches!(
            self.registry.get(&self.agent_id).await,
            Err(VigilError::NotFound(_))
        )
    }

    fn require_bus(&self) -> VigilResult<&Arc<MessageBus>> {
        self.bus.as_ref().ok_or_else(|| {
            VigilError::Config(format!("worker {} has no message bus", self.agent_id))
        })
    }

    /// Register, then poll until `cancel` fires or the agent is
    /// unregistered. The agent is marked offline on the way out unless it
    /// was unregistered.
    pub async fn run(&self, cancel: CancellationToken) -> VigilResult<()> {
        self.register().await?;
        info!(agent_id = %self.agent_id, agent_type = %self.agent_type, "Agent worker started");

        let mut empty_polls: u32 = 0;
        let mut unregistered = false;
        while !cancel.is_cancelled() {
            match self.run_once().await {
                Ok(Some(_)) => {
                    empty_polls = 0;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    if matches!(e, VigilError::NotFound(_)) && self.is_unregistered().await {
                        info!(agent_id = %self.agent_id, "Agent unregistered; stopping");
                        unregistered = true;
                        break;
                    }
                    warn!(agent_id = %self.agent_id, error = %e, "Poll failed");
                }
            }

            let delay = self.backoff.delay(empty_polls);
            empty_polls = empty_polls.saturating_add(1);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if !unregistered {
            self.set_agent_status(AgentStatus::Offline).await;
        }
        info!(agent_id = %self.agent_id, "Agent worker stopped");
        Ok(())
    }
}

/// Runs assignments addressed to its worker. Holds the worker weakly so the
/// bus does not keep it alive.
struct AssignmentHandler {
    worker: Weak<AgentWorker>,
}

#[async_trait]
impl MessageHandler for AssignmentHandler {
    async fn handle(&self, message: &Message) -> VigilResult<()> {
        let Some(worker) = self.worker.upgrade() else {
            return Ok(());
        };
        if message.recipient_id.as_deref() != Some(worker.agent_id()) {
            return Ok(());
        }
        worker.handle_assignment(message).await
    }
}

/// Completes the pending query a `knowledge_response` replies to.
struct KnowledgeResponseHandler {
    agent_id: String,
    pending: Arc<PendingQueries>,
}

#[async_trait]
impl MessageHandler for KnowledgeResponseHandler {
    async fn handle(&self, message: &Message) -> VigilResult<()> {
        if message.recipient_id.as_deref() != Some(self.agent_id.as_str()) {
            return Ok(());
        }
        let Some(query_id) = message.reply_to else {
            debug!(agent_id = %self.agent_id, message_id = %message.message_id, "Knowledge response without reply_to");
            return Ok(());
        };
        match self.pending.lock().remove(&query_id) {
            Some(tx) => {
                // The asker may have given up already.
                let _ = tx.send(message.clone());
            }
            None => {
                debug!(agent_id = %self.agent_id, query_id = %query_id, "No pending query for knowledge response");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use vigil_core::{NewTask, ReconFindings, ResultPayload, TaskScope};
    use vigil_store::{MemoryStore, Store};

    struct PortScanner;

    #[async_trait]
    impl TaskProcessor for PortScanner {
        fn task_types(&self) -> &[TaskType] {
            &[TaskType::Reconnaissance]
        }

        fn capabilities(&self) -> Vec<String> {
            vec!["port_scan".to_string()]
        }

        async fn process(
            &self,
            _task: &Task,
            progress: &ProgressReporter,
        ) -> VigilResult<NewTaskResult> {
            progress.report(50.0, "scanning").await?;
            Ok(NewTaskResult::success(ResultPayload::Reconnaissance(
                ReconFindings {
                    open_ports: vec![22, 80],
                    ..Default::default()
                },
            )))
        }
    }

    struct Broken;

    #[async_trait]
    impl TaskProcessor for Broken {
        fn task_types(&self) -> &[TaskType] {
            &[TaskType::Reconnaissance]
        }

        async fn process(
            &self,
            _task: &Task,
            _progress: &ProgressReporter,
        ) -> VigilResult<NewTaskResult> {
            Err(VigilError::validation("target unreachable"))
        }
    }

    /// Unregisters its own agent halfway through the task.
    struct Retiring {
        registry: Arc<AgentRegistry>,
    }

    #[async_trait]
    impl TaskProcessor for Retiring {
        fn task_types(&self) -> &[TaskType] {
            &[TaskType::Reconnaissance]
        }

        async fn process(
            &self,
            _task: &Task,
            progress: &ProgressReporter,
        ) -> VigilResult<NewTaskResult> {
            self.registry.unregister("recon_1").await?;
            progress.report(60.0, "still scanning").await?;
            Ok(NewTaskResult::success(ResultPayload::Reconnaissance(
                ReconFindings::default(),
            )))
        }
    }

    /// Answers knowledge queries with the query text echoed back.
    struct KnowledgeBase {
        bus: Arc<MessageBus>,
    }

    #[async_trait]
    impl MessageHandler for KnowledgeBase {
        async fn handle(&self, message: &Message) -> VigilResult<()> {
            let MessageContent::KnowledgeQuery { query, .. } = &message.body else {
                return Ok(());
            };
            let reply = Message::new(
                KNOWLEDGE_BASE_AGENT,
                MessageContent::KnowledgeResponse {
                    query: query.clone(),
                    results: vec![serde_json::json!({ "cve": "CVE-2021-41773", "query": query })],
                },
            )
            .to(message.sender_id.clone())
            .in_reply_to(message.message_id);
            self.bus.send(reply).await?;
            Ok(())
        }
    }

    struct Harness {
        queue: Arc<TaskQueue>,
        registry: Arc<AgentRegistry>,
        bus: Arc<MessageBus>,
    }

    impl Harness {
        fn new() -> Self {
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            Self {
                queue: Arc::new(TaskQueue::new(store.clone())),
                registry: Arc::new(AgentRegistry::new(store.clone())),
                bus: Arc::new(MessageBus::new(store)),
            }
        }

        fn worker(&self, processor: Arc<dyn TaskProcessor>) -> AgentWorker {
            AgentWorker::new(
                "recon_1",
                "reconnaissance",
                processor,
                self.queue.clone(),
                self.registry.clone(),
            )
        }

        async fn enqueue(&self) -> Uuid {
            self.queue
                .enqueue(NewTask::new(
                    TaskType::Reconnaissance,
                    "10.0.0.5",
                    TaskScope::new("10.0.0.0/24"),
                ))
                .await
                .unwrap()
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = PollBackoff {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(10), Duration::from_millis(1_000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_run_once_processes_and_stores_result() {
        let h = Harness::new();
        let worker = h.worker(Arc::new(PortScanner));
        worker.register().await.unwrap();
        let id = h.enqueue().await;

        assert_eq!(worker.run_once().await.unwrap(), Some(id));
        let (task, result) = h.queue.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.assigned_agent.as_deref(), Some("recon_1"));
        assert_eq!(result.unwrap().agent_id.as_deref(), Some("recon_1"));
        assert_eq!(
            h.registry.get("recon_1").await.unwrap().status,
            AgentStatus::Idle
        );
        assert_eq!(worker.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_processor_error_fails_task() {
        let h = Harness::new();
        let worker = h.worker(Arc::new(Broken));
        worker.register().await.unwrap();
        let id = h.enqueue().await;

        worker.run_once().await.unwrap();
        let (task, result) = h.queue.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.message.contains("target unreachable"));
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_run_marks_agent_offline_on_cancel() {
        let h = Harness::new();
        let worker = Arc::new(h.worker(Arc::new(PortScanner)).with_backoff(PollBackoff {
            initial_delay_ms: 5,
            max_delay_ms: 20,
            backoff_multiplier: 2.0,
        }));
        let id = h.enqueue().await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let worker = worker.clone();
            let cancel = cancel.clone();
            async move { worker.run(cancel).await }
        });

        for _ in 0..100 {
            if h.queue.get(id).await.unwrap().0.status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(
            h.queue.get(id).await.unwrap().0.status,
            TaskStatus::Completed
        );
        let agent = h.registry.get("recon_1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
        assert!(agent.has_capability("port_scan"));
    }

    #[tokio::test]
    async fn test_unregistered_agent_claims_nothing() {
        let h = Harness::new();
        let worker = h.worker(Arc::new(PortScanner));
        worker.register().await.unwrap();
        h.registry.unregister("recon_1").await.unwrap();
        let ids = [h.enqueue().await, h.enqueue().await, h.enqueue().await];

        for _ in 0..ids.len() {
            assert!(matches!(
                worker.run_once().await,
                Err(VigilError::NotFound(_))
            ));
        }
        assert_eq!(
            h.queue
                .pending_count(TaskType::Reconnaissance)
                .await
                .unwrap(),
            3
        );
        for id in ids {
            let (task, _) = h.queue.get(id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Created);
            assert!(task.assigned_agent.is_none());
        }
    }

    #[tokio::test]
    async fn test_claimed_task_finishes_when_agent_unregisters_mid_run() {
        let h = Harness::new();
        let worker = h.worker(Arc::new(Retiring {
            registry: h.registry.clone(),
        }));
        worker.register().await.unwrap();
        let id = h.enqueue().await;

        assert_eq!(worker.run_once().await.unwrap(), Some(id));
        let (task, result) = h.queue.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(result.is_some());
        assert!(h.registry.get("recon_1").await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_once_agent_is_unregistered() {
        let h = Harness::new();
        let worker = Arc::new(h.worker(Arc::new(PortScanner)).with_backoff(PollBackoff {
            initial_delay_ms: 5,
            max_delay_ms: 20,
            backoff_multiplier: 2.0,
        }));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let worker = worker.clone();
            let cancel = cancel.clone();
            async move { worker.run(cancel).await }
        });

        for _ in 0..100 {
            if h.registry.get("recon_1").await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.registry.unregister("recon_1").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker keeps polling after unregister")
            .unwrap()
            .unwrap();
        assert!(!cancel.is_cancelled());
        assert!(matches!(
            h.registry.get("recon_1").await,
            Err(VigilError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_assignment_message_runs_task_and_replies() {
        let h = Harness::new();
        let worker = Arc::new(h.worker(Arc::new(PortScanner)).with_bus(h.bus.clone()));
        worker.register().await.unwrap();
        worker.attach().await.unwrap();
        let mut listener = h.bus.listener().await.unwrap();

        let id = h.enqueue().await;
        h.queue
            .claim_for_agent(TaskType::Reconnaissance, "recon_1")
            .await
            .unwrap()
            .unwrap();
        let assignment = Message::new(
            "coordinator",
            MessageContent::TaskAssignment {
                task_id: id,
                task_type: TaskType::Reconnaissance,
                target: "10.0.0.5".to_string(),
                scope: None,
                description: String::new(),
            },
        )
        .to("recon_1");
        let assignment_id = h.bus.send(assignment).await.unwrap();

        let report = listener.drain().await.unwrap();
        assert_eq!(report.deliveries, 1);
        assert_eq!(report.handler_failures, 0);

        let (task, _) = h.queue.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let inbox = h.bus.messages_for_agent("coordinator", 10).await.unwrap();
        let reply = inbox
            .iter()
            .find(|m| m.reply_to == Some(assignment_id))
            .expect("task_result reply");
        assert_eq!(reply.sender_id, "recon_1");
        assert_eq!(reply.recipient_id.as_deref(), Some("coordinator"));
        match &reply.body {
            MessageContent::TaskResult {
                task_id,
                outcome,
                payload,
                ..
            } => {
                assert_eq!(*task_id, id);
                assert_eq!(*outcome, Outcome::Success);
                assert!(payload.is_some());
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_assignment_for_unclaimed_task_is_refused() {
        let h = Harness::new();
        let worker = Arc::new(h.worker(Arc::new(PortScanner)).with_bus(h.bus.clone()));
        worker.register().await.unwrap();
        worker.attach().await.unwrap();
        let mut listener = h.bus.listener().await.unwrap();

        let id = h.enqueue().await;
        h.bus
            .send(
                Message::new(
                    "coordinator",
                    MessageContent::TaskAssignment {
                        task_id: id,
                        task_type: TaskType::Reconnaissance,
                        target: "10.0.0.5".to_string(),
                        scope: None,
                        description: String::new(),
                    },
                )
                .to("recon_1"),
            )
            .await
            .unwrap();

        let report = listener.drain().await.unwrap();
        assert_eq!(report.handler_failures, 1);
        assert_eq!(h.queue.get(id).await.unwrap().0.status, TaskStatus::Created);
    }

    #[tokio::test]
    async fn test_failed_assignment_replies_with_failure() {
        let h = Harness::new();
        let worker = Arc::new(h.worker(Arc::new(Broken)).with_bus(h.bus.clone()));
        worker.register().await.unwrap();
        worker.attach().await.unwrap();
        let mut listener = h.bus.listener().await.unwrap();

        let id = h.enqueue().await;
        h.queue
            .claim_for_agent(TaskType::Reconnaissance, "recon_1")
            .await
            .unwrap();
        let assignment_id = h
            .bus
            .send(
                Message::new(
                    "coordinator",
                    MessageContent::TaskAssignment {
                        task_id: id,
                        task_type: TaskType::Reconnaissance,
                        target: "10.0.0.5".to_string(),
                        scope: None,
                        description: String::new(),
                    },
                )
                .to("recon_1"),
            )
            .await
            .unwrap();
        listener.drain().await.unwrap();

        let inbox = h.bus.messages_for_agent("coordinator", 10).await.unwrap();
        let reply = inbox
            .iter()
            .find(|m| m.reply_to == Some(assignment_id))
            .expect("task_result reply");
        match &reply.body {
            MessageContent::TaskResult {
                outcome, summary, ..
            } => {
                assert_eq!(*outcome, Outcome::Failed);
                assert!(summary.contains("target unreachable"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(h.queue.get(id).await.unwrap().0.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_knowledge_query_resolves_matching_response() {
        let h = Harness::new();
        let worker = Arc::new(h.worker(Arc::new(PortScanner)).with_bus(h.bus.clone()));
        worker.attach().await.unwrap();
        h.bus
            .register_handler(
                MessageType::KnowledgeQuery,
                Arc::new(KnowledgeBase { bus: h.bus.clone() }),
            )
            .await;
        let cancel = CancellationToken::new();
        let listener = h.bus.listener().await.unwrap();
        let handle = tokio::spawn(listener.run(cancel.clone()));

        let results = worker
            .query_knowledge("apache 2.4.49", "vulnerabilities", 5, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["cve"], "CVE-2021-41773");
        assert_eq!(results[0]["query"], "apache 2.4.49");
        assert!(worker.pending.lock().is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_knowledge_query_times_out_without_response() {
        let h = Harness::new();
        let worker = Arc::new(h.worker(Arc::new(PortScanner)).with_bus(h.bus.clone()));
        worker.attach().await.unwrap();

        let err = worker
            .query_knowledge("openssh 7.2", "vulnerabilities", 5, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, VigilError::Timeout(_)));
        assert!(worker.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_bus_features_need_a_bus() {
        let h = Harness::new();
        let worker = Arc::new(h.worker(Arc::new(PortScanner)));
        assert!(matches!(
            worker.attach().await,
            Err(VigilError::Config(_))
        ));
        assert!(worker
            .query_knowledge("q", "c", 1, Duration::from_millis(10))
            .await
            .is_err());
    }
}
