//! Orchestrator: the single cooperative event loop that
//! owns turn dispatch, async-task resume, permission debounce, daemon
//! fan-out and the cancel key. It is a library surface, not a UI: callers
//! drain `OrchestratorEvent`s and drive their own rendering.

pub mod secrets;

use dashmap::{DashMap, DashSet};
use opperator_core::{AsyncTask, Config, PermissionRequest, SessionId, ToolResult};
use opperator_engine::{apply_progress_update, apply_terminal_update, EngineEvent, LlmEngine, SessionAdapter};
use opperator_history::SessionHistory;
use opperator_ipc::{DaemonEvent, DaemonRegistry, MultiDaemonWatcher};
use opperator_permission::{Notification, PermissionService};
use opperator_store::{AsyncTaskTracker, StreamingManager, ToolCallStore, TrackerUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// The 2 s grace window during which a second cancel key press force-cancels
/// the live stream.
const CANCEL_GRACE: Duration = Duration::from_secs(2);
/// Dialogs wait this long for the request to resolve on its own (e.g. an
/// allow-listed tool) before bothering the user.
const PERMISSION_DEBOUNCE: Duration = Duration::from_millis(200);

/// Builds a fresh adapter for a session. Supplied by the embedder since only
/// it knows which agent is focused, what commands it exposes, and so on;
/// the orchestrator only needs to be able to ask for one on demand.
pub type AdapterFactory = Arc<dyn Fn(&SessionId) -> SessionAdapter + Send + Sync>;

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    Engine { session: SessionId, event: EngineEvent },
    AsyncSnapshot(AsyncTask),
    AsyncProgress { session: SessionId, call_id: String, entry: String },
    AsyncTerminal { session: SessionId, call_id: String, result: ToolResult },
    AsyncDeleted { session: SessionId, call_id: String },
    PermissionDialog(PermissionRequest),
    Daemon(DaemonEvent),
}

pub struct Orchestrator {
    engine: Arc<LlmEngine>,
    history: Arc<SessionHistory>,
    tool_store: Arc<ToolCallStore>,
    streaming: Arc<StreamingManager>,
    permission: Arc<PermissionService>,
    tracker: Arc<AsyncTaskTracker>,
    daemon_registry: Arc<DaemonRegistry>,
    adapter_factory: AdapterFactory,
    config: Arc<Config>,
    ui_tx: mpsc::Sender<OrchestratorEvent>,
    /// Cancel token for each session's currently live turn, if any.
    active_cancel: DashMap<SessionId, CancellationToken>,
    /// Sessions with a live engine task (streaming or running tools); used
    /// to decide whether an async terminal update should auto-resume.
    streaming_sessions: DashSet<SessionId>,
    /// Maps an outstanding async task id back to the session/call it
    /// belongs to, learned from its `Snapshot`/`Terminal` updates (the
    /// tracker guarantees a snapshot arrives before any progress update).
    task_index: DashMap<String, (SessionId, String)>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<LlmEngine>,
        history: Arc<SessionHistory>,
        tool_store: Arc<ToolCallStore>,
        streaming: Arc<StreamingManager>,
        permission: Arc<PermissionService>,
        tracker: Arc<AsyncTaskTracker>,
        daemon_registry: Arc<DaemonRegistry>,
        adapter_factory: AdapterFactory,
        config: Arc<Config>,
        ui_tx: mpsc::Sender<OrchestratorEvent>,
    ) -> Self {
        Self {
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
            active_cancel: DashMap::new(),
            streaming_sessions: DashSet::new(),
            task_index: DashMap::new(),
        }
    }

    /// Drives the three event sources that have no single owner: daemon
    /// fan-out, the async task tracker, and permission requests. Each runs
    /// for the orchestrator's lifetime; `submit`/`cancel_key` are called
    /// directly by the embedder per user action.
    pub async fn run(
        self: &Arc<Self>,
        mut tracker_rx: mpsc::Receiver<TrackerUpdate>,
        cancel: CancellationToken,
    ) {
        let watcher = MultiDaemonWatcher::new(self.daemon_registry.clone(), cancel.clone());
        let mut daemon_rx = watcher.start().await;

        let mut requests = self.permission.subscribe_requests();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                update = tracker_rx.recv() => {
                    match update {
                        Some(update) => self.handle_tracker_update(update).await,
                        None => return,
                    }
                }
                event = daemon_rx.recv() => {
                    match event {
                        Some(event) => {
                            let _ = self.ui_tx.send(OrchestratorEvent::Daemon(event)).await;
                        }
                        None => {}
                    }
                }
                req = requests.recv() => {
                    if let Ok(req) = req {
                        self.spawn_permission_debounce(req);
                    }
                }
            }
        }
    }

    /// User submit: record the user turn, then run the engine.
    pub fn submit(self: &Arc<Self>, session: SessionId, text: String) {
        let adapter = (self.adapter_factory)(&session);
        if let Err(e) = adapter.record_user(&text) {
            warn!(session = %session, error = %e, "failed to record user turn");
            return;
        }
        self.spawn_turn(session, adapter);
    }

    fn spawn_turn(self: &Arc<Self>, session: SessionId, adapter: SessionAdapter) {
        let cancel = CancellationToken::new();
        self.active_cancel.insert(session.clone(), cancel.clone());
        self.streaming_sessions.insert(session.clone());

        let (tx, rx) = mpsc::channel(256);
        self.spawn_event_forwarder(session.clone(), rx);

        let engine = self.engine.clone();
        tokio::spawn(async move {
            engine.run_turn(&adapter, cancel, tx).await;
        });
    }

    fn spawn_event_forwarder(self: &Arc<Self>, session: SessionId, mut rx: mpsc::Receiver<EngineEvent>) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let terminal = matches!(
                    event,
                    EngineEvent::Done | EngineEvent::Cancelled | EngineEvent::Error(_) | EngineEvent::Busy
                );
                let _ = this
                    .ui_tx
                    .send(OrchestratorEvent::Engine { session: session.clone(), event })
                    .await;
                if terminal {
                    this.on_turn_ended(&session).await;
                }
            }
        });
    }

    /// Mirrors `complete_response`: tear down live-turn
    /// bookkeeping and, if an async completion raced the stream, resume.
    async fn on_turn_ended(self: &Arc<Self>, session: &SessionId) {
        self.active_cancel.remove(session);
        self.streaming_sessions.remove(session);

        if self.streaming.take_pending_async_resume(session) {
            self.resume(session.clone());
        }
    }

    /// Starts a fresh phase with no new user input, e.g. after an async
    /// tool call completes. A no-op if the session already has a live turn.
    fn resume(self: &Arc<Self>, session: SessionId) {
        if self.streaming_sessions.contains(&session) {
            return;
        }
        let adapter = (self.adapter_factory)(&session);
        self.spawn_turn(session, adapter);
    }

    async fn handle_tracker_update(self: &Arc<Self>, update: TrackerUpdate) {
        match update {
            TrackerUpdate::Snapshot(task) => {
                self.task_index
                    .insert(task.id.clone(), (task.session_id.clone(), task.call_id.clone()));
                let _ = self.ui_tx.send(OrchestratorEvent::AsyncSnapshot(task)).await;
            }
            TrackerUpdate::Progress { task_id, entry } => {
                let Some(entry_ref) = self.task_index.get(&task_id) else {
                    return;
                };
                let (session, call_id) = entry_ref.value().clone();
                drop(entry_ref);
                apply_progress_update(&self.tool_store, &call_id, entry.clone());
                let _ = self
                    .ui_tx
                    .send(OrchestratorEvent::AsyncProgress { session, call_id, entry })
                    .await;
            }
            TrackerUpdate::Terminal { task, result } => {
                self.task_index.remove(&task.id);
                let session = task.session_id.clone();
                let call_id = task.call_id.clone();
                let should_resume = match apply_terminal_update(&self.tool_store, &self.history, &session, &task, result.clone()) {
                    Ok(resume) => resume,
                    Err(e) => {
                        warn!(session = %session, call_id = %call_id, error = %e, "failed to apply async result");
                        false
                    }
                };
                self.streaming.clear_tool_call(&session, &call_id);
                let _ = self
                    .ui_tx
                    .send(OrchestratorEvent::AsyncTerminal { session: session.clone(), call_id, result })
                    .await;
                if should_resume {
                    self.resume(session);
                }
            }
            TrackerUpdate::Deleted { task_id, session_id, call_id } => {
                self.task_index.remove(&task_id);
                self.tool_store.remove(&call_id);
                self.streaming.clear_tool_call(&session_id, &call_id);
                let _ = self
                    .ui_tx
                    .send(OrchestratorEvent::AsyncDeleted { session: session_id, call_id })
                    .await;
            }
        }
    }

    /// Permission request event: wait out the debounce window,
    /// but skip the dialog entirely if the request already resolved (e.g.
    /// it was pre-approved and `request` merely announced the grant).
    fn spawn_permission_debounce(self: &Arc<Self>, req: PermissionRequest) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut notifications = this.permission.subscribe_notifications();
            let id = req.id.clone();
            tokio::select! {
                _ = tokio::time::sleep(PERMISSION_DEBOUNCE) => {
                    let _ = this.ui_tx.send(OrchestratorEvent::PermissionDialog(req)).await;
                }
                _ = wait_for_resolution(&mut notifications, &id) => {}
            }
        });
    }

    /// Cancel key: first press marks canceling and cancels all
    /// pending tool calls; a second press within the grace window
    /// force-cancels the live stream itself.
    pub fn cancel_key(self: &Arc<Self>, session: &SessionId) {
        let already = self.streaming.mark_canceling(session);

        if already {
            if let Some(token) = self.active_cancel.get(session) {
                token.cancel();
            }
            self.tool_store.cancel_all_pending();
            return;
        }

        self.tool_store.cancel_all_pending();

        let streaming = self.streaming.clone();
        let session = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CANCEL_GRACE).await;
            streaming.clear_canceling(&session);
        });
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

async fn wait_for_resolution(rx: &mut tokio::sync::broadcast::Receiver<Notification>, id: &str) {
    loop {
        match rx.recv().await {
            Ok(Notification::Granted { request_id }) if request_id == id => return,
            Ok(Notification::Denied { request_id, .. }) if request_id == id => return,
            Ok(_) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opperator_core::{AsyncTaskStatus, ToolCall};
    use opperator_engine::{CoreAgent, ToolRegistry};
    use opperator_history::store::Store;
    use opperator_llm::AnthropicProvider;

    fn test_orchestrator() -> (Arc<Orchestrator>, mpsc::Receiver<OrchestratorEvent>, tempfile::TempDir) {
        let history = Arc::new(SessionHistory::new(Arc::new(Store::open_in_memory().unwrap())));
        let tool_store = Arc::new(ToolCallStore::new());
        let streaming = Arc::new(StreamingManager::new());
        let permission = Arc::new(PermissionService::new(Vec::new()));
        let (tracker, _tracker_rx) = AsyncTaskTracker::new(16);
        let tracker = Arc::new(tracker);
        let dir = tempfile::tempdir().unwrap();
        let daemon_registry = Arc::new(DaemonRegistry::new(dir.path().join("daemons.json")));
        let config = Arc::new(Config::default());

        let provider: Arc<dyn opperator_llm::LlmProvider> = Arc::new(AnthropicProvider::new("test-key"));
        let tools = Arc::new(ToolRegistry::new());
        let engine = Arc::new(LlmEngine::new(
            provider,
            tools,
            tool_store.clone(),
            streaming.clone(),
            permission.clone(),
            tracker.clone(),
            None,
            config.clone(),
        ));

        let adapter_history = history.clone();
        let adapter_factory: AdapterFactory = Arc::new(move |session: &SessionId| {
            SessionAdapter::new(adapter_history.clone(), session.clone(), CoreAgent::Opperator, "prompt".to_string())
        });

        let (ui_tx, ui_rx) = mpsc::channel(32);
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
        (orchestrator, ui_rx, dir)
    }

    fn task(id: &str, session: &SessionId, call_id: &str, status: AsyncTaskStatus) -> AsyncTask {
        AsyncTask {
            id: id.to_string(),
            session_id: session.clone(),
            call_id: call_id.to_string(),
            tool_name: "agent".to_string(),
            mode: "async".to_string(),
            agent_name: None,
            command_name: None,
            status,
            result: None,
            error: None,
            metadata: "{}".to_string(),
            args: "{}".to_string(),
            created_at: 0,
            updated_at: 0,
            completed_at: None,
            progress: Vec::new(),
        }
    }

    #[tokio::test]
    async fn cancel_key_second_press_force_cancels() {
        let (orchestrator, _ui_rx, _dir) = test_orchestrator();
        let session = SessionId::from("s1");
        let token = CancellationToken::new();
        orchestrator.streaming.begin(&session, token.clone());
        orchestrator.active_cancel.insert(session.clone(), token.clone());

        orchestrator.cancel_key(&session);
        assert!(orchestrator.streaming.is_canceling(&session));
        assert!(!token.is_cancelled(), "first press must not force-cancel");

        orchestrator.cancel_key(&session);
        assert!(token.is_cancelled(), "second press while still canceling must force-cancel");
    }

    #[tokio::test]
    async fn tracker_snapshot_then_terminal_resolves_via_index() {
        let (orchestrator, mut ui_rx, _dir) = test_orchestrator();
        let session = SessionId::from("s1");
        let t = task("task-1", &session, "call-1", AsyncTaskStatus::Loading);

        orchestrator.handle_tracker_update(TrackerUpdate::Snapshot(t.clone())).await;
        assert!(matches!(ui_rx.recv().await, Some(OrchestratorEvent::AsyncSnapshot(_))));
        assert!(orchestrator.task_index.contains_key("task-1"));

        orchestrator.tool_store.ensure_call(ToolCall {
            id: "call-1".to_string(),
            name: "agent".to_string(),
            input: "{}".to_string(),
            finished: true,
            reason: None,
        });
        orchestrator
            .handle_tracker_update(TrackerUpdate::Progress { task_id: "task-1".to_string(), entry: "working".to_string() })
            .await;
        match ui_rx.recv().await {
            Some(OrchestratorEvent::AsyncProgress { session: s, call_id, entry }) => {
                assert_eq!(s, session);
                assert_eq!(call_id, "call-1");
                assert_eq!(entry, "working");
            }
            other => panic!("expected AsyncProgress, got {other:?}"),
        }

        let mut terminal_task = t;
        terminal_task.status = AsyncTaskStatus::Complete;
        let result = ToolResult {
            tool_call_id: "call-1".to_string(),
            name: Some("agent".to_string()),
            content: "done".to_string(),
            metadata: "{}".to_string(),
            is_error: false,
            pending: false,
        };
        orchestrator
            .handle_tracker_update(TrackerUpdate::Terminal { task: terminal_task, result })
            .await;
        assert!(matches!(ui_rx.recv().await, Some(OrchestratorEvent::AsyncTerminal { .. })));
        assert!(!orchestrator.task_index.contains_key("task-1"), "terminal update clears the index");
    }

    #[tokio::test]
    async fn tracker_progress_before_snapshot_is_dropped() {
        let (orchestrator, mut ui_rx, _dir) = test_orchestrator();
        orchestrator
            .handle_tracker_update(TrackerUpdate::Progress { task_id: "unknown".to_string(), entry: "x".to_string() })
            .await;
        assert!(ui_rx.try_recv().is_err(), "an unindexed task must not forward a progress event");
    }
}
