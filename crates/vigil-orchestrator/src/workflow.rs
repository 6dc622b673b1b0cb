use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::{
    keys, LifecycleEvent, NewTask, StageSnapshot, TaskScope, TaskStatus, VigilError,
    VigilResult, Workflow, WorkflowEvent, WorkflowEventKind, WorkflowKind, WorkflowReport,
    WorkflowStatus,
};
use vigil_store::{Delivery, Store, Subscription};

use crate::task_queue::TaskQueue;

/// Priority given to every stage task a workflow enqueues.
pub const STAGE_PRIORITY: u8 = 2;

/// Drives multi-stage assessments by reacting to task lifecycle events.
///
/// When the last stage's task completes, the next stage is enqueued with the
/// finished task as its parent. A failed stage fails the workflow and no
/// further stage is created. Each stage is created at most once: the store
/// guards creation with `set_if_absent`, and within this process a
/// per-workflow mutex serializes evaluation.
pub struct WorkflowOrchestrator {
    store: Arc<dyn Store>,
    queue: Arc<TaskQueue>,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkflowOrchestrator {
    pub fn new(store: Arc<dyn Store>, queue: Arc<TaskQueue>) -> Self {
        Self {
            store,
            queue,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a workflow and enqueue its first stage.
    pub async fn start(
        &self,
        workflow_type: &str,
        target: &str,
        scope: TaskScope,
        description: &str,
    ) -> VigilResult<Uuid> {
        let kind: WorkflowKind = workflow_type.parse()?;
        if target.trim().is_empty() {
            return Err(VigilError::validation("target must not be empty"));
        }
        scope.validate()?;

        let mut workflow = Workflow::new(kind, target.trim(), scope, description);
        self.save(&workflow).await?;

        let lock = self.lock_for(workflow.id);
        let _guard = lock.lock().await;

        self.create_stage(&mut workflow, None).await?;
        workflow.set_status(WorkflowStatus::InProgress);
        self.save(&workflow).await?;
        info!(
            workflow_id = %workflow.id,
            workflow_type = %kind,
            target = %workflow.target,
            "Workflow started"
        );
        self.publish(WorkflowEventKind::WorkflowStarted, &workflow)
            .await?;

        self.advance(&mut workflow).await?;
        Ok(workflow.id)
    }

    /// React to one event from `task_updates`. Only terminal task events
    /// for tasks that belong to a workflow have any effect.
    pub async fn handle_event(&self, event: &LifecycleEvent) -> VigilResult<()> {
        let LifecycleEvent::Task(task_event) = event else {
            return Ok(());
        };
        if !task_event.status.is_terminal() {
            return Ok(());
        }
        let Some(workflow_id) = self.workflow_of(task_event.task_id).await? else {
            return Ok(());
        };
        debug!(workflow_id = %workflow_id, task_id = %task_event.task_id, status = %task_event.status, "Evaluating workflow");
        self.evaluate(workflow_id).await.map(|_| ())
    }

    /// Consume lifecycle events until `cancel` fires or the subscription
    /// closes. Errors are logged and the loop continues. After the store
    /// resubscribes, every active workflow is reconciled to pick up
    /// transitions published while the connection was down.
    pub async fn run(&self, mut subscription: Subscription, cancel: CancellationToken) {
        info!(channel = subscription.channel(), "Workflow orchestrator listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = subscription.next_delivery() => {
                    let raw = match next {
                        Some(Delivery::Payload(raw)) => raw,
                        Some(Delivery::Resubscribed) => {
                            warn!("Lifecycle subscription re-established; reconciling workflows");
                            if let Err(e) = self.resume().await {
                                warn!(error = %e, "Reconciliation after resubscribe failed");
                            }
                            continue;
                        }
                        None => {
                            warn!("Lifecycle subscription closed");
                            break;
                        }
                    };
                    let event = match LifecycleEvent::from_json(&raw) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(error = %e, "Ignoring malformed lifecycle event");
                            continue;
                        }
                    };
                    if let Err(e) = self.handle_event(&event).await {
                        warn!(task_id = ?event.task_id(), error = %e, "Workflow evaluation failed");
                    }
                }
            }
        }
        info!("Workflow orchestrator stopped");
    }

    /// Re-evaluate one workflow from stored task state.
    pub async fn reconcile(&self, workflow_id: Uuid) -> VigilResult<Workflow> {
        self.evaluate(workflow_id).await
    }

    /// Reconcile every active workflow. Returns how many were checked.
    ///
    /// Pub/sub does not replay, so this catches up on terminal transitions
    /// that happened while no orchestrator was listening.
    pub async fn resume(&self) -> VigilResult<usize> {
        let active = self.list_active().await?;
        for workflow in &active {
            self.evaluate(workflow.id).await?;
        }
        if !active.is_empty() {
            info!(count = active.len(), "Reconciled active workflows");
        }
        Ok(active.len())
    }

    pub async fn get(&self, workflow_id: Uuid) -> VigilResult<Workflow> {
        self.load(workflow_id)
            .await?
            .ok_or_else(|| VigilError::not_found(format!("workflow {workflow_id}")))
    }

    /// Per-stage task and result snapshot of a finished workflow.
    ///
    /// Stages completed before a failure keep their results.
    pub async fn get_results(&self, workflow_id: Uuid) -> VigilResult<WorkflowReport> {
        let workflow = self.get(workflow_id).await?;
        if !workflow.status.is_terminal() {
            return Err(VigilError::validation(format!(
                "workflow {workflow_id} has not finished"
            )));
        }

        let mut stages = Vec::with_capacity(workflow.stages.len());
        for entry in &workflow.stages {
            let (task, result) = self.queue.get(entry.task_id).await?;
            stages.push(StageSnapshot {
                stage_type: entry.stage_type,
                task,
                result,
            });
        }
        Ok(WorkflowReport { workflow, stages })
    }

    /// Workflows not yet completed or failed, most recently updated first.
    pub async fn list_active(&self) -> VigilResult<Vec<Workflow>> {
        let mut active = Vec::new();
        for key in self.store.keys(keys::WORKFLOW_PREFIX).await? {
            let Some(id) = keys::parse_id(&key, keys::WORKFLOW_PREFIX) else {
                continue;
            };
            if let Some(workflow) = self.load(id).await? {
                if !workflow.status.is_terminal() {
                    active.push(workflow);
                }
            }
        }
        active.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(active)
    }

    async fn evaluate(&self, workflow_id: Uuid) -> VigilResult<Workflow> {
        // Finished and unknown workflows never get a lock entry.
        let workflow = self.get(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Ok(workflow);
        }

        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;

        let mut workflow = self.get(workflow_id).await?;
        self.advance(&mut workflow).await?;
        if workflow.status.is_terminal() {
            // Finished while we waited on a lock the finisher already dropped.
            self.locks.lock().remove(&workflow_id);
        }
        Ok(workflow)
    }

    /// Walk the workflow forward as far as stored task state allows.
    /// Caller holds the workflow's lock.
    async fn advance(&self, workflow: &mut Workflow) -> VigilResult<()> {
        loop {
            if workflow.status.is_terminal() {
                return Ok(());
            }
            let Some(last) = workflow.stages.last().cloned() else {
                return Ok(());
            };
            let index = workflow.stages.len() - 1;
            let Some(task) = self.queue.load(last.task_id).await? else {
                warn!(workflow_id = %workflow.id, task_id = %last.task_id, "Stage task missing");
                return Ok(());
            };

            match task.status {
                TaskStatus::Completed if workflow.is_final_stage(index) => {
                    return self
                        .finish(workflow, WorkflowStatus::Completed)
                        .await;
                }
                TaskStatus::Completed => {
                    if !self.create_stage(workflow, Some(task.id)).await? {
                        return Ok(());
                    }
                }
                TaskStatus::Failed => {
                    return self.finish(workflow, WorkflowStatus::Failed).await;
                }
                _ => return Ok(()),
            }
        }
    }

    /// Enqueue the next stage. Returns false if another evaluator already
    /// created it; the caller's copy of the workflow is then stale.
    async fn create_stage(
        &self,
        workflow: &mut Workflow,
        parent: Option<Uuid>,
    ) -> VigilResult<bool> {
        let index = workflow.stages.len();
        let Some(stage_type) = workflow.next_stage_type() else {
            return Ok(false);
        };
        if !self
            .store
            .set_if_absent(&keys::workflow_stage(workflow.id, index), stage_type.as_str())
            .await?
        {
            debug!(workflow_id = %workflow.id, stage = index, "Stage already created elsewhere");
            return Ok(false);
        }

        let mut request = NewTask::new(stage_type, workflow.target.clone(), workflow.scope.clone())
            .with_description(stage_description(workflow, stage_type.as_str()))
            .with_priority(STAGE_PRIORITY);
        if let Some(parent) = parent {
            request = request.with_parent(parent);
        }
        let task_id = self.queue.enqueue(request).await?;

        self.store
            .set(
                &keys::workflow_of_task(task_id),
                &workflow.id.to_string(),
                None,
            )
            .await?;
        workflow.push_stage(task_id, stage_type);
        self.save(workflow).await?;

        if index > 0 {
            info!(
                workflow_id = %workflow.id,
                stage = index,
                stage_type = %stage_type,
                task_id = %task_id,
                "Workflow advanced"
            );
            self.publish(WorkflowEventKind::WorkflowAdvanced, workflow)
                .await?;
        }
        Ok(true)
    }

    async fn finish(&self, workflow: &mut Workflow, status: WorkflowStatus) -> VigilResult<()> {
        workflow.set_status(status);
        self.save(workflow).await?;

        let kind = match status {
            WorkflowStatus::Completed => WorkflowEventKind::WorkflowCompleted,
            _ => WorkflowEventKind::WorkflowFailed,
        };
        match status {
            WorkflowStatus::Completed => {
                info!(workflow_id = %workflow.id, stages = workflow.stages.len(), "Workflow completed");
            }
            _ => {
                warn!(
                    workflow_id = %workflow.id,
                    failed_stage = ?workflow.stages.last().map(|s| s.stage_type),
                    "Workflow failed"
                );
            }
        }
        self.publish(kind, workflow).await?;
        self.locks.lock().remove(&workflow.id);
        Ok(())
    }

    async fn workflow_of(&self, task_id: Uuid) -> VigilResult<Option<Uuid>> {
        Ok(self
            .store
            .get(&keys::workflow_of_task(task_id))
            .await?
            .and_then(|raw| Uuid::parse_str(&raw).ok()))
    }

    fn lock_for(&self, workflow_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(workflow_id).or_default().clone()
    }

    async fn load(&self, workflow_id: Uuid) -> VigilResult<Option<Workflow>> {
        match self.store.get(&keys::workflow(workflow_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, workflow: &Workflow) -> VigilResult<()> {
        let json = serde_json::to_string(workflow)?;
        self.store
            .set(&keys::workflow(workflow.id), &json, None)
            .await
    }

    async fn publish(&self, kind: WorkflowEventKind, workflow: &Workflow) -> VigilResult<()> {
        let event = LifecycleEvent::from(WorkflowEvent::new(kind, workflow));
        self.store
            .publish(keys::TASK_UPDATES_CHANNEL, &event.to_json()?)
            .await
    }
}

fn stage_description(workflow: &Workflow, stage: &str) -> String {
    let stage = stage.replace('_', " ");
    if workflow.description.is_empty() {
        format!("{stage} for {}", workflow.target)
    } else {
        format!("{stage} for {}: {}", workflow.target, workflow.description)
    }
}
