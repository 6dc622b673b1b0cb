use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vigil_core::{
    keys, validate_progress, LifecycleEvent, NewTask, NewTaskResult, Task, TaskEvent,
    TaskEventKind, TaskResult, TaskStatus, TaskType, VigilError, VigilResult,
};
use vigil_store::Store;

/// Type-partitioned priority queue of tasks with status and result tracking.
///
/// Records live in the shared store, so any number of `TaskQueue` handles in
/// any number of processes see the same queue. Every accepted change is
/// published on `task_updates`.
pub struct TaskQueue {
    store: Arc<dyn Store>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Validate and enqueue a task in `created` status.
    pub async fn enqueue(&self, request: NewTask) -> VigilResult<Uuid> {
        request.validate()?;
        let task = request.into_task();

        // Record first, so a claimer never pops an id it cannot load.
        self.save(&task).await?;
        self.store
            .queue_push(
                &keys::queue(task.task_type),
                &task.id.to_string(),
                task.priority,
            )
            .await?;

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = task.priority,
            parent_task_id = ?task.parent_task_id,
            "Task enqueued"
        );
        self.publish(TaskEventKind::TaskCreated, &task).await?;
        Ok(task.id)
    }

    /// Atomically take the highest-priority pending task of `task_type`.
    ///
    /// Non-blocking: returns `None` when the partition is empty.
    pub async fn claim(&self, task_type: TaskType) -> VigilResult<Option<Task>> {
        self.claim_inner(task_type, None).await
    }

    /// Like [`TaskQueue::claim`], recording the claiming agent on the task.
    pub async fn claim_for_agent(
        &self,
        task_type: TaskType,
        agent_id: &str,
    ) -> VigilResult<Option<Task>> {
        self.claim_inner(task_type, Some(agent_id)).await
    }

    async fn claim_inner(
        &self,
        task_type: TaskType,
        agent_id: Option<&str>,
    ) -> VigilResult<Option<Task>> {
        let queue = keys::queue(task_type);
        loop {
            let Some(raw_id) = self.store.queue_pop(&queue).await? else {
                return Ok(None);
            };
            let Ok(id) = Uuid::parse_str(&raw_id) else {
                warn!(queue = %queue, entry = %raw_id, "Discarding malformed queue entry");
                continue;
            };
            let mut task = match self.load(id).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    warn!(task_id = %id, "Queued task has no record; skipping");
                    continue;
                }
                Err(VigilError::Json(e)) => {
                    warn!(task_id = %id, error = %e, "Queued task record is malformed; skipping");
                    continue;
                }
                Err(e) => {
                    // It was the head of the partition; keep it there.
                    self.requeue(&queue, id, u8::MAX).await;
                    return Err(e);
                }
            };
            if task.status != TaskStatus::Created {
                warn!(task_id = %id, status = %task.status, "Queued task already moved on; skipping");
                continue;
            }

            task.status = TaskStatus::Assigned;
            task.progress = 0.0;
            task.message = match agent_id {
                Some(agent) => format!("Assigned to agent {agent}"),
                None => "Assigned".to_string(),
            };
            task.assigned_agent = agent_id.map(str::to_string);
            task.updated_at = Utc::now();
            if let Err(e) = self.save(&task).await {
                self.requeue(&queue, id, task.priority).await;
                return Err(e);
            }

            info!(task_id = %task.id, task_type = %task_type, agent_id = ?agent_id, "Task claimed");
            // The claim already holds; a lost event must not orphan the task.
            if let Err(e) = self.publish(TaskEventKind::TaskAssigned, &task).await {
                warn!(task_id = %task.id, error = %e, "Could not publish assignment");
            }
            return Ok(Some(task));
        }
    }

    /// Put a popped id back after a failed claim.
    async fn requeue(&self, queue: &str, task_id: Uuid, priority: u8) {
        match self
            .store
            .queue_push(queue, &task_id.to_string(), priority)
            .await
        {
            Ok(()) => debug!(task_id = %task_id, "Task returned to queue after failed claim"),
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Could not return task to queue; reconcile it by hand");
            }
        }
    }

    /// Apply a status/progress report.
    ///
    /// Repeating the current status updates progress and message, provided
    /// progress does not go down. Repeating a terminal status is a no-op.
    /// Anything that would move the status backward is rejected.
    pub async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        progress: Option<f32>,
        message: Option<String>,
    ) -> VigilResult<Task> {
        if let Some(p) = progress {
            validate_progress(p)?;
        }
        let mut task = self.require(task_id).await?;

        if task.status == status {
            if status.is_terminal() {
                debug!(task_id = %task_id, status = %status, "Repeated terminal status ignored");
                return Ok(task);
            }
            if let Some(p) = progress {
                if p < task.progress {
                    return Err(VigilError::validation(format!(
                        "progress of task {task_id} may not decrease ({} -> {p})",
                        task.progress
                    )));
                }
                task.progress = p;
            }
            if let Some(m) = message {
                task.message = m;
            }
            task.updated_at = Utc::now();
            self.save(&task).await?;
            self.publish(TaskEventKind::TaskUpdated, &task).await?;
            return Ok(task);
        }

        if !task.status.can_advance_to(status) {
            return Err(VigilError::validation(format!(
                "illegal transition for task {task_id}: {} -> {status}",
                task.status
            )));
        }

        let previous = task.status;
        task.status = status;
        match (progress, status) {
            (Some(p), _) => task.progress = p,
            (None, TaskStatus::Completed) => task.progress = 100.0,
            _ => {}
        }
        if let Some(m) = message {
            task.message = m;
        }
        task.updated_at = Utc::now();
        self.save(&task).await?;

        info!(task_id = %task_id, from = %previous, to = %status, progress = task.progress, "Task status changed");
        self.publish(TaskEventKind::for_status(status), &task).await?;
        Ok(task)
    }

    /// Store the task's result and move it to the matching terminal status.
    ///
    /// Only one result is ever accepted per task.
    pub async fn store_result(
        &self,
        task_id: Uuid,
        result: NewTaskResult,
    ) -> VigilResult<TaskResult> {
        let task = self.require(task_id).await?;
        if result.payload.task_type() != task.task_type {
            return Err(VigilError::validation(format!(
                "payload of kind {} does not match task type {}",
                result.payload.task_type(),
                task.task_type
            )));
        }
        if task.status.is_terminal() {
            return Err(VigilError::validation(format!(
                "task {task_id} is already {}; its result cannot be written",
                task.status
            )));
        }

        let record = TaskResult {
            task_id,
            outcome: result.outcome,
            payload: result.payload,
            summary: result.summary,
            agent_id: task.assigned_agent.clone(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&record)?;
        if !self
            .store
            .set_if_absent(&keys::result(task_id), &json)
            .await?
        {
            return Err(VigilError::validation(format!(
                "result for task {task_id} already stored"
            )));
        }

        let terminal = record.outcome.terminal_status();
        let message = if record.summary.is_empty() {
            match terminal {
                TaskStatus::Completed => "Task completed".to_string(),
                _ => "Task failed".to_string(),
            }
        } else {
            record.summary.clone()
        };
        let progress = (terminal == TaskStatus::Completed).then_some(100.0);
        self.update_status(task_id, terminal, progress, Some(message))
            .await?;

        info!(task_id = %task_id, outcome = ?record.outcome, "Task result stored");
        Ok(record)
    }

    /// The task and its result, if one was stored.
    pub async fn get(&self, task_id: Uuid) -> VigilResult<(Task, Option<TaskResult>)> {
        let task = self.require(task_id).await?;
        let result = self.result(task_id).await?;
        Ok((task, result))
    }

    pub async fn result(&self, task_id: Uuid) -> VigilResult<Option<TaskResult>> {
        match self.store.get(&keys::result(task_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Tasks not yet completed or failed, most recently updated first.
    pub async fn list_active(&self) -> VigilResult<Vec<Task>> {
        let mut active = Vec::new();
        for key in self.store.keys(keys::TASK_PREFIX).await? {
            let Some(id) = keys::parse_id(&key, keys::TASK_PREFIX) else {
                continue;
            };
            if let Some(task) = self.load(id).await? {
                if !task.status.is_terminal() {
                    active.push(task);
                }
            }
        }
        active.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(active)
    }

    /// Number of tasks waiting to be claimed in one partition.
    pub async fn pending_count(&self, task_type: TaskType) -> VigilResult<usize> {
        self.store.queue_len(&keys::queue(task_type)).await
    }

    pub(crate) async fn load(&self, task_id: Uuid) -> VigilResult<Option<Task>> {
        match self.store.get(&keys::task(task_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn require(&self, task_id: Uuid) -> VigilResult<Task> {
        self.load(task_id)
            .await?
            .ok_or_else(|| VigilError::not_found(format!("task {task_id}")))
    }

    async fn save(&self, task: &Task) -> VigilResult<()> {
        let json = serde_json::to_string(task)?;
        self.store.set(&keys::task(task.id), &json, None).await
    }

    async fn publish(&self, kind: TaskEventKind, task: &Task) -> VigilResult<()> {
        let event = LifecycleEvent::from(TaskEvent::from_task(kind, task));
        self.store
            .publish(keys::TASK_UPDATES_CHANNEL, &event.to_json()?)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use vigil_core::{Outcome, ReconFindings, ResultPayload, TaskScope};
    use vigil_store::MemoryStore;

    fn queue() -> TaskQueue {
        TaskQueue::new(Arc::new(MemoryStore::new()))
    }

    fn recon(target: &str) -> NewTask {
        NewTask::new(
            TaskType::Reconnaissance,
            target,
            TaskScope::new("10.0.0.0/24"),
        )
    }

    fn recon_result() -> NewTaskResult {
        NewTaskResult::success(ResultPayload::Reconnaissance(ReconFindings {
            open_ports: vec![22, 80],
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_empty_partition_returns_none() {
        let queue = queue();
        assert!(queue.claim(TaskType::Reconnaissance).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_claim_returns_task_to_queue() {
        let store = Arc::new(MemoryStore::new());
        let queue = TaskQueue::new(store.clone());
        let id = queue.enqueue(recon("10.0.0.1")).await.unwrap();

        store.fail_value_writes(true);
        assert!(matches!(
            queue.claim(TaskType::Reconnaissance).await,
            Err(VigilError::TransientStore(_))
        ));
        store.fail_value_writes(false);

        assert_eq!(queue.pending_count(TaskType::Reconnaissance).await.unwrap(), 1);
        assert_eq!(queue.get(id).await.unwrap().0.status, TaskStatus::Created);
        let claimed = queue.claim(TaskType::Reconnaissance).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
    }

    #[tokio::test]
    async fn test_claim_survives_lost_assignment_event() {
        let store = Arc::new(MemoryStore::new());
        let queue = TaskQueue::new(store.clone());
        let id = queue.enqueue(recon("10.0.0.1")).await.unwrap();

        store.fail_publish(true);
        let claimed = queue
            .claim_for_agent(TaskType::Reconnaissance, "recon_1")
            .await
            .unwrap()
            .unwrap();
        store.fail_publish(false);

        assert_eq!(claimed.id, id);
        let (task, _) = queue.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_agent.as_deref(), Some("recon_1"));
        assert_eq!(queue.pending_count(TaskType::Reconnaissance).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_malformed_scope() {
        let queue = queue();
        let bad = NewTask::new(
            TaskType::Reconnaissance,
            "10.0.0.5",
            TaskScope::new("10.0.0.0/99"),
        );
        assert!(matches!(
            queue.enqueue(bad).await,
            Err(VigilError::Validation(_))
        ));
        assert_eq!(queue.pending_count(TaskType::Reconnaissance).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_respects_priority_and_fifo() {
        let queue = queue();
        let low = queue.enqueue(recon("10.0.0.1")).await.unwrap();
        let high_a = queue
            .enqueue(recon("10.0.0.2").with_priority(3))
            .await
            .unwrap();
        let high_b = queue
            .enqueue(recon("10.0.0.3").with_priority(3))
            .await
            .unwrap();

        let order: Vec<Uuid> = [
            queue.claim(TaskType::Reconnaissance).await.unwrap().unwrap().id,
            queue.claim(TaskType::Reconnaissance).await.unwrap().unwrap().id,
            queue.claim(TaskType::Reconnaissance).await.unwrap().unwrap().id,
        ]
        .to_vec();
        assert_eq!(order, vec![high_a, high_b, low]);
    }

    #[tokio::test]
    async fn test_claim_is_partitioned_by_type() {
        let queue = queue();
        queue.enqueue(recon("10.0.0.1")).await.unwrap();
        assert!(queue
            .claim(TaskType::VulnerabilityDiscovery)
            .await
            .unwrap()
            .is_none());
        let task = queue
            .claim_for_agent(TaskType::Reconnaissance, "recon_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_agent.as_deref(), Some("recon_1"));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_within_in_progress() {
        let queue = queue();
        let id = queue.enqueue(recon("10.0.0.1")).await.unwrap();
        queue.claim(TaskType::Reconnaissance).await.unwrap();
        queue
            .update_status(id, TaskStatus::InProgress, Some(50.0), Some("scanning".into()))
            .await
            .unwrap();
        let same = queue
            .update_status(id, TaskStatus::InProgress, Some(50.0), None)
            .await
            .unwrap();
        assert_eq!(same.message, "scanning");
        assert!(matches!(
            queue
                .update_status(id, TaskStatus::InProgress, Some(40.0), None)
                .await,
            Err(VigilError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_backward_transition_rejected() {
        let queue = queue();
        let id = queue.enqueue(recon("10.0.0.1")).await.unwrap();
        queue.claim(TaskType::Reconnaissance).await.unwrap();
        assert!(matches!(
            queue
                .update_status(id, TaskStatus::Created, None, None)
                .await,
            Err(VigilError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_update_unknown_task_is_not_found() {
        let queue = queue();
        assert!(matches!(
            queue
                .update_status(Uuid::new_v4(), TaskStatus::InProgress, None, None)
                .await,
            Err(VigilError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_result_is_written_once() {
        let queue = queue();
        let id = queue.enqueue(recon("10.0.0.1")).await.unwrap();
        queue.claim(TaskType::Reconnaissance).await.unwrap();
        let stored = queue.store_result(id, recon_result()).await.unwrap();

        let again = NewTaskResult::new(
            Outcome::Failed,
            ResultPayload::Reconnaissance(ReconFindings::default()),
        );
        assert!(matches!(
            queue.store_result(id, again).await,
            Err(VigilError::Validation(_))
        ));

        let (task, result) = queue.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100.0);
        assert_eq!(result.unwrap(), stored);
    }

    #[tokio::test]
    async fn test_result_payload_must_match_task_type() {
        let queue = queue();
        let id = queue.enqueue(recon("10.0.0.1")).await.unwrap();
        let wrong = NewTaskResult::success(ResultPayload::empty(TaskType::Reporting));
        assert!(matches!(
            queue.store_result(id, wrong).await,
            Err(VigilError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_outcome_fails_task() {
        let queue = queue();
        let id = queue.enqueue(recon("10.0.0.1")).await.unwrap();
        queue.claim(TaskType::Reconnaissance).await.unwrap();
        let failed = NewTaskResult::new(
            Outcome::Failed,
            ResultPayload::empty(TaskType::Reconnaissance),
        )
        .with_summary("host unreachable");
        queue.store_result(id, failed).await.unwrap();
        let (task, _) = queue.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.message, "host unreachable");
    }

    #[tokio::test]
    async fn test_repeated_terminal_status_is_noop() {
        let queue = queue();
        let id = queue.enqueue(recon("10.0.0.1")).await.unwrap();
        queue
            .update_status(id, TaskStatus::Failed, None, Some("boom".into()))
            .await
            .unwrap();
        let again = queue
            .update_status(id, TaskStatus::Failed, None, Some("other".into()))
            .await
            .unwrap();
        assert_eq!(again.message, "boom");
    }

    #[tokio::test]
    async fn test_list_active_orders_by_recent_update() {
        let queue = queue();
        let first = queue.enqueue(recon("10.0.0.1")).await.unwrap();
        let second = queue.enqueue(recon("10.0.0.2")).await.unwrap();
        let done = queue.enqueue(recon("10.0.0.3")).await.unwrap();
        queue
            .update_status(done, TaskStatus::Failed, None, None)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        queue
            .update_status(first, TaskStatus::InProgress, Some(10.0), None)
            .await
            .unwrap();

        let ids: Vec<Uuid> = queue
            .list_active()
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[tokio::test]
    async fn test_every_transition_is_published() {
        let store = Arc::new(MemoryStore::new());
        let mut events = store.subscribe(keys::TASK_UPDATES_CHANNEL).await.unwrap();
        let queue = TaskQueue::new(store);

        let id = queue.enqueue(recon("10.0.0.1")).await.unwrap();
        queue.claim(TaskType::Reconnaissance).await.unwrap();
        queue
            .update_status(id, TaskStatus::InProgress, Some(5.0), None)
            .await
            .unwrap();
        queue.store_result(id, recon_result()).await.unwrap();

        let mut kinds = Vec::new();
        while let Some(raw) = events.try_recv() {
            match LifecycleEvent::from_json(&raw).unwrap() {
                LifecycleEvent::Task(e) => kinds.push(e.event),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(
            kinds,
            vec![
                TaskEventKind::TaskCreated,
                TaskEventKind::TaskAssigned,
                TaskEventKind::TaskUpdated,
                TaskEventKind::TaskCompleted,
            ]
        );
    }
}
