//! Orchestrator binary entrypoint: wires config, logging, persistence and
//! the daemon registry, then drives the event loop from stdin lines.

use clap::Parser;
use opperator_core::{Config, SessionId};
use opperator_engine::{CoreAgent, LlmEngine, SessionAdapter};
use opperator_engine::tools::agent::AgentTool;
use opperator_engine::tools::bash::BashTool;
use opperator_engine::tools::edit::EditTool;
use opperator_engine::tools::ls::LsTool;
use opperator_engine::tools::multi_edit::MultiEditTool;
use opperator_engine::tools::view::ViewTool;
use opperator_engine::tools::write::WriteTool;
use opperator_engine::ToolRegistry;
use opperator_history::store::Store;
use opperator_history::SessionHistory;
use opperator_ipc::{DaemonRegistry, IpcClient};
use opperator_llm::AnthropicProvider;
use opperator_orchestrator::{secrets, Orchestrator, OrchestratorEvent};
use opperator_permission::PermissionService;
use opperator_store::{AsyncTaskTracker, StreamingManager, ToolCallStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "opperator", about = "Opperator session orchestration core")]
struct Cli {
    /// Daemon registry file (default: ~/.opperator/daemons.json)
    #[arg(long)]
    daemon_registry: Option<PathBuf>,
    /// Workspace root the built-in file/shell tools operate against
    #[arg(short, long)]
    workspace: Option<PathBuf>,
    /// TOML config file (overrides built-in defaults; env vars win over it)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(registry) = cli.daemon_registry {
        config.daemon_registry_path = registry;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    let config = Arc::new(config);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("opperator={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let workspace_root = cli
        .workspace
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    let api_key = secrets::load_api_key()?;
    let provider = Arc::new(AnthropicProvider::new(api_key));

    let store = Arc::new(Store::open(&config.sqlite_path)?);
    let history = Arc::new(SessionHistory::new(store));

    let daemon_registry = Arc::new(DaemonRegistry::new(config.daemon_registry_path.clone()));
    let local = daemon_registry
        .load()?
        .into_iter()
        .find(|d| d.is_local())
        .expect("local daemon is always present");
    let ipc_client = Arc::new(IpcClient::new(local.name.as_str(), &local.address, local.auth_token.clone())?);

    let mut tools = ToolRegistry::new();
    tools.register(LsTool::new(&workspace_root));
    tools.register(ViewTool::new(&workspace_root));
    tools.register(WriteTool::new(&workspace_root));
    tools.register(EditTool::new(&workspace_root));
    tools.register(MultiEditTool::new(&workspace_root));
    tools.register(BashTool::new(&workspace_root));
    tools.register(AgentTool::new(ipc_client.clone(), Vec::new()));
    let tools = Arc::new(tools);

    let tool_store = Arc::new(ToolCallStore::new());
    let streaming = Arc::new(StreamingManager::new());
    let permission = Arc::new(PermissionService::new(config.permission_allow_list.clone()));
    let (tracker, tracker_rx) = AsyncTaskTracker::new(1024);
    let tracker = Arc::new(tracker);

    let engine = Arc::new(LlmEngine::new(
        provider,
        tools,
        tool_store.clone(),
        streaming.clone(),
        permission.clone(),
        tracker.clone(),
        Some(ipc_client),
        config.clone(),
    ));

    let (ui_tx, mut ui_rx) = tokio::sync::mpsc::channel::<OrchestratorEvent>(256);
    let core_prompt = "You are Opperator, a terminal workbench assistant.".to_string();
    let adapter_history = history.clone();
    let adapter_factory = Arc::new(move |session: &SessionId| {
        SessionAdapter::new(adapter_history.clone(), session.clone(), CoreAgent::Opperator, core_prompt.clone())
    });

    let orchestrator = Arc::new(Orchestrator::new(
        engine,
        history,
        tool_store,
        streaming,
        permission,
        tracker,
        daemon_registry,
        adapter_factory,
        config,
        ui_tx,
    ));

    let cancel = CancellationToken::new();
    let loop_orchestrator = orchestrator.clone();
    let loop_cancel = cancel.clone();
    tokio::spawn(async move {
        loop_orchestrator.run(tracker_rx, loop_cancel).await;
    });

    tokio::spawn(async move {
        while let Some(event) = ui_rx.recv().await {
            print_event(event);
        }
    });

    let session = SessionId::from("default");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        if line == "/quit" {
            break;
        }
        if line == "/cancel" {
            orchestrator.cancel_key(&session);
            continue;
        }
        orchestrator.submit(session.clone(), line);
    }

    cancel.cancel();
    Ok(())
}

fn print_event(event: OrchestratorEvent) {
    use opperator_engine::EngineEvent;
    match event {
        OrchestratorEvent::Engine { event, .. } => match event {
            EngineEvent::Text(t) => print!("{t}"),
            EngineEvent::Done => println!(),
            EngineEvent::Error(e) => eprintln!("error: {e}"),
            EngineEvent::ToolResult { name, content, is_error, .. } => {
                let tag = if is_error { "tool error" } else { "tool" };
                println!("[{tag}:{name}] {content}");
            }
            _ => {}
        },
        OrchestratorEvent::PermissionDialog(req) => {
            println!("[permission] {} wants to {} ({})", req.tool_name, req.action, req.description);
        }
        OrchestratorEvent::AsyncProgress { entry, .. } => println!("[progress] {entry}"),
        OrchestratorEvent::AsyncTerminal { result, .. } => println!("[done] {}", result.content),
        _ => {}
    }
}
