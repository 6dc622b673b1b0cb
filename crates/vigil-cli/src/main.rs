//! `vigil`: runs the orchestration gateway and inspects a shared store.

mod config;

use clap::{Parser, Subcommand};
use config::{LogFormat, StoreBackend, StoreConfig, VigilConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use vigil_core::{keys, NewTask, TaskScope, TaskType};
use vigil_gateway::{AppState, GatewayServer};
use vigil_orchestrator::{AgentRegistry, MessageBus, TaskQueue, WorkflowOrchestrator};
use vigil_store::{MemoryStore, RedisStore, Store};

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil: security assessment orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "vigil.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway, workflow orchestrator and event notifier
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Store health and queue depths
    Status,
    /// Inspect and create tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Start and inspect workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// List registered agents
    Agents {
        /// Only agents of this type
        #[arg(long = "type")]
        agent_type: Option<String>,
    },
    /// Messages sent by or to an agent, newest first
    Messages {
        agent_id: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Enqueue a task
    Create {
        #[arg(long = "type")]
        task_type: TaskType,
        #[arg(long)]
        target: String,
        /// Scope in CIDR notation
        #[arg(long)]
        ip_range: String,
        #[arg(long, default_value_t = 1)]
        priority: u8,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Show a task and its result
    Get { id: Uuid },
    /// List tasks not yet completed or failed
    List,
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Start a workflow (recon_vuln or full_assessment)
    Start {
        #[arg(long = "type", default_value = "recon_vuln")]
        workflow_type: String,
        #[arg(long)]
        target: String,
        #[arg(long)]
        ip_range: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    Get { id: Uuid },
    /// Per-stage results of a finished workflow
    Results { id: Uuid },
    List,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .pretty()
            .init(),
    }
}

async fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn Store>> {
    match config.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store; state is not shared or persisted");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Redis => Ok(Arc::new(RedisStore::connect(&config.redis_url).await?)),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = VigilConfig::load(&cli.config)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    init_tracing(config.log.format);

    let store = open_store(&config.store).await?;
    let queue = Arc::new(TaskQueue::new(store.clone()));

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or(config.server.host);
            let port = port.unwrap_or(config.server.port);

            let state = AppState::new(
                store.clone(),
                config.notifier.buffer,
                Duration::from_secs(config.store.message_ttl_secs),
            );
            let cancel = CancellationToken::new();

            let orchestrator_events = store.subscribe(keys::TASK_UPDATES_CHANNEL).await?;
            let notifier_events = store.subscribe(keys::TASK_UPDATES_CHANNEL).await?;
            let resumed = state.workflows.resume().await?;
            info!(workflows = resumed, "Workflow state reconciled");

            let orchestrator = tokio::spawn({
                let workflows = state.workflows.clone();
                let cancel = cancel.clone();
                async move { workflows.run(orchestrator_events, cancel).await }
            });
            let notifier = tokio::spawn({
                let notifier = state.notifier.clone();
                let cancel = cancel.clone();
                async move { notifier.run(notifier_events, cancel).await }
            });

            let app = GatewayServer::build(state);
            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!("Vigil gateway listening on {}", addr);

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal(cancel.clone()))
                .await?;

            cancel.cancel();
            let _ = tokio::join!(orchestrator, notifier);
            info!("Vigil stopped");
        }
        Commands::Status => {
            let mut depths = serde_json::Map::new();
            for task_type in TaskType::ALL {
                depths.insert(
                    task_type.to_string(),
                    queue.pending_count(task_type).await?.into(),
                );
            }
            print_json(&serde_json::json!({
                "store": store.ping().await,
                "backend": format!("{:?}", config.store.backend).to_lowercase(),
                "pending": depths,
                "active_tasks": queue.list_active().await?.len(),
            }))?;
        }
        Commands::Task { action } => match action {
            TaskAction::Create {
                task_type,
                target,
                ip_range,
                priority,
                description,
            } => {
                let request = NewTask::new(task_type, target, TaskScope::new(ip_range))
                    .with_priority(priority)
                    .with_description(description);
                let id = queue.enqueue(request).await?;
                println!("{id}");
            }
            TaskAction::Get { id } => {
                let (task, result) = queue.get(id).await?;
                print_json(&serde_json::json!({ "task": task, "result": result }))?;
            }
            TaskAction::List => print_json(&queue.list_active().await?)?,
        },
        Commands::Workflow { action } => {
            let workflows = WorkflowOrchestrator::new(store.clone(), queue.clone());
            match action {
                WorkflowAction::Start {
                    workflow_type,
                    target,
                    ip_range,
                    description,
                } => {
                    let id = workflows
                        .start(&workflow_type, &target, TaskScope::new(ip_range), &description)
                        .await?;
                    println!("{id}");
                }
                WorkflowAction::Get { id } => print_json(&workflows.get(id).await?)?,
                WorkflowAction::Results { id } => print_json(&workflows.get_results(id).await?)?,
                WorkflowAction::List => print_json(&workflows.list_active().await?)?,
            }
        }
        Commands::Agents { agent_type } => {
            let registry = AgentRegistry::new(store.clone());
            print_json(&registry.list(agent_type.as_deref()).await?)?;
        }
        Commands::Messages { agent_id, limit } => {
            let bus = MessageBus::with_ttl(
                store.clone(),
                Duration::from_secs(config.store.message_ttl_secs),
            );
            print_json(&bus.messages_for_agent(&agent_id, limit).await?)?;
        }
    }

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => {
                warn!(error = %e, "Could not listen for shutdown signal");
                cancel.cancelled().await;
            }
        },
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
}
