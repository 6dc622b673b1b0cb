use crate::error::ApiResult;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::notifier::EventNotifier;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;
use vigil_core::{
    AgentStatus, Message, MessageContent, NewTask, NewTaskResult, TaskScope, TaskStatus,
    TaskType,
};
use vigil_orchestrator::{AgentRegistry, MessageBus, TaskQueue, WorkflowOrchestrator};
use vigil_store::Store;

/// Shared application state: one handle per engine component.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<TaskQueue>,
    pub workflows: Arc<WorkflowOrchestrator>,
    pub registry: Arc<AgentRegistry>,
    pub bus: Arc<MessageBus>,
    pub notifier: Arc<EventNotifier>,
}

impl AppState {
    /// Wire every component over one store.
    pub fn new(store: Arc<dyn Store>, notifier_buffer: usize, message_ttl: Duration) -> Arc<Self> {
        let queue = Arc::new(TaskQueue::new(store.clone()));
        Arc::new(Self {
            workflows: Arc::new(WorkflowOrchestrator::new(store.clone(), queue.clone())),
            registry: Arc::new(AgentRegistry::new(store.clone())),
            bus: Arc::new(MessageBus::with_ttl(store.clone(), message_ttl)),
            notifier: EventNotifier::new(notifier_buffer),
            queue,
            store,
        })
    }
}

/// The HTTP/WebSocket gateway.
pub struct GatewayServer;

impl GatewayServer {
    pub fn build(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .route("/api/tasks", post(create_task).get(list_tasks))
            .route("/api/tasks/{id}", get(get_task))
            .route("/api/tasks/{id}/status", post(update_task_status))
            .route("/api/tasks/{id}/result", post(store_task_result))
            .route("/api/queues/{task_type}/claim", post(claim_task))
            .route("/api/workflows", post(start_workflow).get(list_workflows))
            .route("/api/workflows/{id}", get(get_workflow))
            .route("/api/workflows/{id}/results", get(get_workflow_results))
            .route("/api/agents", get(list_agents).post(register_agent))
            .route("/api/agents/{id}", delete(unregister_agent))
            .route("/api/agents/{id}/status", put(update_agent_status))
            .route("/api/agents/{id}/messages", get(agent_messages))
            .route("/api/messages", post(send_message))
            .route("/api/messages/{id}", get(get_message))
            .with_state(state)
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = state.store.ping().await;
    Json(json!({
        "status": if store { "ok" } else { "degraded" },
        "service": "vigil",
        "store": store,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Observers only listen; anything they send other than close is ignored.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (connection_id, mut rx) = state.notifier.connect().await;

    let welcome = json!({
        "type": "connected",
        "connection_id": connection_id,
    });
    if ws_sender
        .send(WsMessage::Text(welcome.to_string().into()))
        .await
        .is_err()
    {
        state.notifier.disconnect(connection_id).await;
        return;
    }

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                WsMessage::Close(_) => break,
                other => debug!(connection_id = %connection_id, frame = ?other, "Ignoring observer frame"),
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.notifier.disconnect(connection_id).await;
    info!(connection_id = %connection_id, "WebSocket disconnected");
}

// --- tasks ---

async fn create_task(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<NewTask>,
) -> ApiResult<Response> {
    let task_id = state.queue.enqueue(request).await?;
    Ok((StatusCode::CREATED, Json(json!({ "task_id": task_id }))).into_response())
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    Ok(Json(state.queue.list_active().await?).into_response())
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Response> {
    let (task, result) = state.queue.get(id).await?;
    Ok(Json(json!({ "task": task, "result": result })).into_response())
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: TaskStatus,
    #[serde(default)]
    progress: Option<f32>,
    #[serde(default)]
    message: Option<String>,
}

async fn update_task_status(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(update): ApiJson<StatusUpdate>,
) -> ApiResult<Response> {
    let task = state
        .queue
        .update_status(id, update.status, update.progress, update.message)
        .await?;
    Ok(Json(task).into_response())
}

async fn store_task_result(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(result): ApiJson<NewTaskResult>,
) -> ApiResult<Response> {
    let stored = state.queue.store_result(id, result).await?;
    Ok((StatusCode::CREATED, Json(stored)).into_response())
}

#[derive(Debug, Deserialize)]
struct ClaimParams {
    agent_id: Option<String>,
}

/// 200 with the claimed task, or 204 when the partition is empty.
async fn claim_task(
    State(state): State<Arc<AppState>>,
    ApiPath(task_type): ApiPath<String>,
    ApiQuery(params): ApiQuery<ClaimParams>,
) -> ApiResult<Response> {
    let task_type: TaskType = task_type.parse()?;
    let claimed = match params.agent_id.as_deref() {
        Some(agent_id) => state.queue.claim_for_agent(task_type, agent_id).await?,
        None => state.queue.claim(task_type).await?,
    };
    Ok(match claimed {
        Some(task) => Json(task).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

// --- workflows ---

#[derive(Debug, Deserialize)]
struct StartWorkflow {
    workflow_type: String,
    target: String,
    scope: TaskScope,
    #[serde(default)]
    description: String,
}

async fn start_workflow(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<StartWorkflow>,
) -> ApiResult<Response> {
    let workflow_id = state
        .workflows
        .start(
            &request.workflow_type,
            &request.target,
            request.scope,
            &request.description,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "workflow_id": workflow_id }))).into_response())
}

async fn list_workflows(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    Ok(Json(state.workflows.list_active().await?).into_response())
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Response> {
    Ok(Json(state.workflows.get(id).await?).into_response())
}

async fn get_workflow_results(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Response> {
    Ok(Json(state.workflows.get_results(id).await?).into_response())
}

// --- agents ---

#[derive(Debug, Deserialize)]
struct AgentFilter {
    agent_type: Option<String>,
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
    ApiQuery(filter): ApiQuery<AgentFilter>,
) -> ApiResult<Response> {
    let agents = state.registry.list(filter.agent_type.as_deref()).await?;
    Ok(Json(agents).into_response())
}

#[derive(Debug, Deserialize)]
struct RegisterAgent {
    agent_id: String,
    agent_type: String,
    #[serde(default)]
    capabilities: Vec<String>,
}

async fn register_agent(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<RegisterAgent>,
) -> ApiResult<Response> {
    let agent = state
        .registry
        .register(&request.agent_id, &request.agent_type, request.capabilities)
        .await?;
    Ok((StatusCode::CREATED, Json(agent)).into_response())
}

async fn unregister_agent(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<StatusCode> {
    state.registry.unregister(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct AgentStatusUpdate {
    status: AgentStatus,
}

async fn update_agent_status(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<String>,
    ApiJson(update): ApiJson<AgentStatusUpdate>,
) -> ApiResult<Response> {
    Ok(Json(state.registry.update_status(&id, update.status).await?).into_response())
}

// --- messages ---

#[derive(Debug, Deserialize)]
struct SendMessage {
    sender_id: String,
    #[serde(default)]
    recipient_id: Option<String>,
    #[serde(flatten)]
    body: MessageContent,
    #[serde(default)]
    reply_to: Option<Uuid>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<SendMessage>,
) -> ApiResult<Response> {
    let mut message = Message::new(request.sender_id, request.body);
    if let Some(recipient) = request.recipient_id {
        message = message.to(recipient);
    }
    if let Some(reply_to) = request.reply_to {
        message = message.in_reply_to(reply_to);
    }
    message.metadata = request.metadata;

    let message_id = state.bus.send(message).await?;
    Ok((StatusCode::CREATED, Json(json!({ "message_id": message_id }))).into_response())
}

async fn get_message(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Response> {
    Ok(Json(state.bus.get(id).await?).into_response())
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

async fn agent_messages(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<String>,
    ApiQuery(query): ApiQuery<MessageQuery>,
) -> ApiResult<Response> {
    let messages = state.bus.messages_for_agent(&id, query.limit).await?;
    Ok(Json(messages).into_response())
}
