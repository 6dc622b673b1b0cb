#![allow(clippy::unwrap_used, clippy::expect_used)]

use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use vigil_core::keys;
use vigil_gateway::{AppState, GatewayServer};
use vigil_orchestrator::DEFAULT_MESSAGE_TTL;
use vigil_store::{MemoryStore, Store};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    addr: String,
    client: reqwest::Client,
    cancel: CancellationToken,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client.post(self.url(path)).json(&body).send().await.unwrap()
    }

    async fn get_json(&self, path: &str) -> (u16, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Helper: full stack on a random port, with the orchestrator and notifier
/// loops running.
async fn start_test_server() -> TestServer {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let state = AppState::new(store.clone(), 16, DEFAULT_MESSAGE_TTL);
    let cancel = CancellationToken::new();

    let orchestrator_events = store.subscribe(keys::TASK_UPDATES_CHANNEL).await.unwrap();
    let notifier_events = store.subscribe(keys::TASK_UPDATES_CHANNEL).await.unwrap();
    tokio::spawn({
        let workflows = state.workflows.clone();
        let cancel = cancel.clone();
        async move { workflows.run(orchestrator_events, cancel).await }
    });
    tokio::spawn({
        let notifier = state.notifier.clone();
        let cancel = cancel.clone();
        async move { notifier.run(notifier_events, cancel).await }
    });

    let app = GatewayServer::build(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Small yield to let the server task start
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr: format!("127.0.0.1:{}", addr.port()),
        client: reqwest::Client::new(),
        cancel,
    }
}

async fn connect_ws(addr: &str) -> (WsStream, String) {
    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let welcome = next_frame(&mut ws).await;
    assert_eq!(welcome["type"], "connected");
    let connection_id = welcome["connection_id"].as_str().unwrap().to_string();
    (ws, connection_id)
}

async fn next_frame(ws: &mut WsStream) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    serde_json::from_str(&msg.into_text().unwrap()).unwrap()
}

fn recon_task() -> Value {
    json!({
        "type": "reconnaissance",
        "target": "10.0.0.5",
        "scope": {"ip_range": "10.0.0.0/24"},
        "priority": 2
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = start_test_server().await;
    let (status, body) = server.get_json("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "vigil");
    assert_eq!(body["store"], true);
}

#[tokio::test]
async fn test_task_lifecycle_is_streamed_to_observers() {
    let server = start_test_server().await;
    let (mut ws, _) = connect_ws(&server.addr).await;

    let resp = server.post("/api/tasks", recon_task()).await;
    assert_eq!(resp.status(), 201);
    let task_id = resp.json::<Value>().await.unwrap()["task_id"]
        .as_str()
        .unwrap()
        .to_string();

    let created = next_frame(&mut ws).await;
    assert_eq!(created["event"], "task_created");
    assert_eq!(created["task_id"], task_id.as_str());

    let resp = server
        .post("/api/queues/reconnaissance/claim?agent_id=recon_1", json!({}))
        .await;
    assert_eq!(resp.status(), 200);
    let claimed: Value = resp.json().await.unwrap();
    assert_eq!(claimed["id"], task_id.as_str());
    assert_eq!(claimed["assigned_agent"], "recon_1");
    assert_eq!(next_frame(&mut ws).await["event"], "task_assigned");

    let resp = server
        .post(
            &format!("/api/tasks/{task_id}/status"),
            json!({"status": "in_progress", "progress": 50.0, "message": "scanning"}),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let update = next_frame(&mut ws).await;
    assert_eq!(update["event"], "task_updated");
    assert_eq!(update["progress"], 50.0);

    let result = json!({
        "outcome": "success",
        "payload": {"kind": "reconnaissance", "open_ports": [22, 80]}
    });
    let resp = server
        .post(&format!("/api/tasks/{task_id}/result"), result.clone())
        .await;
    assert_eq!(resp.status(), 201);
    assert_eq!(next_frame(&mut ws).await["event"], "task_completed");

    let resp = server
        .post(&format!("/api/tasks/{task_id}/result"), result)
        .await;
    assert_eq!(resp.status(), 422);
    assert_eq!(resp.json::<Value>().await.unwrap()["kind"], "validation");

    let resp = server
        .post(
            &format!("/api/tasks/{task_id}/status"),
            json!({"status": "in_progress"}),
        )
        .await;
    assert_eq!(resp.status(), 422);

    let (status, body) = server.get_json(&format!("/api/tasks/{task_id}")).await;
    assert_eq!(status, 200);
    assert_eq!(body["task"]["status"], "completed");
    assert_eq!(body["result"]["payload"]["open_ports"], json!([22, 80]));
}

#[tokio::test]
async fn test_workflow_advances_over_http() {
    let server = start_test_server().await;

    let resp = server
        .post(
            "/api/workflows",
            json!({
                "workflow_type": "recon_vuln",
                "target": "10.0.0.5",
                "scope": {"ip_range": "10.0.0.0/24"}
            }),
        )
        .await;
    assert_eq!(resp.status(), 201);
    let workflow_id = resp.json::<Value>().await.unwrap()["workflow_id"]
        .as_str()
        .unwrap()
        .to_string();

    let (_, active) = server.get_json("/api/workflows").await;
    assert_eq!(active.as_array().unwrap().len(), 1);

    let (status, _) = server
        .get_json(&format!("/api/workflows/{workflow_id}/results"))
        .await;
    assert_eq!(status, 422);

    let recon: Value = server
        .post("/api/queues/reconnaissance/claim", json!({}))
        .await
        .json()
        .await
        .unwrap();
    let recon_id = recon["id"].as_str().unwrap().to_string();
    server
        .post(
            &format!("/api/tasks/{recon_id}/result"),
            json!({"outcome": "success", "payload": {"kind": "reconnaissance", "open_ports": [22]}}),
        )
        .await;

    let mut vuln = Value::Null;
    for _ in 0..100 {
        let resp = server
            .post("/api/queues/vulnerability_discovery/claim", json!({}))
            .await;
        if resp.status() == 200 {
            vuln = resp.json().await.unwrap();
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(vuln["parent_task_id"], recon_id.as_str());

    let vuln_id = vuln["id"].as_str().unwrap().to_string();
    server
        .post(
            &format!("/api/tasks/{vuln_id}/result"),
            json!({"outcome": "partial", "payload": {"kind": "vulnerability_discovery"}}),
        )
        .await;

    let mut report = Value::Null;
    for _ in 0..100 {
        let (status, body) = server
            .get_json(&format!("/api/workflows/{workflow_id}/results"))
            .await;
        if status == 200 {
            report = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(report["workflow"]["status"], "completed");
    assert_eq!(report["stages"].as_array().unwrap().len(), 2);
    assert_eq!(report["stages"][1]["result"]["outcome"], "partial");
}

#[tokio::test]
async fn test_agents_and_messages() {
    let server = start_test_server().await;

    let resp = server
        .post(
            "/api/agents",
            json!({"agent_id": "recon_1", "agent_type": "reconnaissance", "capabilities": ["nmap"]}),
        )
        .await;
    assert_eq!(resp.status(), 201);

    let resp = server
        .client
        .put(server.url("/api/agents/recon_1/status"))
        .json(&json!({"status": "busy"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let (_, agents) = server.get_json("/api/agents?agent_type=reconnaissance").await;
    assert_eq!(agents[0]["status"], "busy");
    let (_, none) = server.get_json("/api/agents?agent_type=reporting").await;
    assert!(none.as_array().unwrap().is_empty());

    let resp = server
        .post(
            "/api/messages",
            json!({
                "sender_id": "recon_1",
                "recipient_id": "knowledge_base",
                "message_type": "knowledge_query",
                "content": {"query": "apache 2.4.41", "collection": "vulnerabilities"}
            }),
        )
        .await;
    assert_eq!(resp.status(), 201);
    let message_id = resp.json::<Value>().await.unwrap()["message_id"]
        .as_str()
        .unwrap()
        .to_string();

    let (status, message) = server.get_json(&format!("/api/messages/{message_id}")).await;
    assert_eq!(status, 200);
    assert_eq!(message["content"]["n_results"], 5);

    let (_, inbox) = server
        .get_json("/api/agents/knowledge_base/messages?limit=10")
        .await;
    assert_eq!(inbox[0]["message_id"], message_id.as_str());

    let resp = server
        .client
        .delete(server.url("/api/agents/recon_1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    let (_, agents) = server.get_json("/api/agents").await;
    assert!(agents.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let server = start_test_server().await;
    let id = uuid::Uuid::new_v4();
    for path in [
        format!("/api/tasks/{id}"),
        format!("/api/workflows/{id}"),
        format!("/api/messages/{id}"),
    ] {
        let (status, body) = server.get_json(&path).await;
        assert_eq!(status, 404, "{path}");
        assert_eq!(body["kind"], "not_found");
    }
}
