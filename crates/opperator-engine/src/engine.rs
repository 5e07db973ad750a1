//! LLM Engine: drives one LLM turn, possibly expanded into
//! a bounded number of follow-up passes when the model emits tool calls.

use crate::adapter::SessionAdapter;
use crate::tools::{Tool, ToolContext, ToolOutcome, ToolRegistry};
use futures::StreamExt;
use opperator_core::{metadata_as_object, Config, Lifecycle, SessionId, ToolCall, ToolResult};
use opperator_ipc::IpcClient;
use opperator_llm::{AccumulatedToolCall, LlmProvider, LlmRequest, LlmTool, StreamDelta};
use opperator_permission::{PermissionService, RequestOptions};
use opperator_store::{AsyncTaskTracker, StreamingManager, ToolCallStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Text(String),
    Thinking(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, arguments: String },
    ToolExecuting { id: String, name: String },
    ToolResult { id: String, name: String, content: String, is_error: bool },
    /// The phase reached quiescence: no tool calls in the final response.
    Done,
    /// The turn ended cooperatively (cancel, permission denial).
    Cancelled,
    /// A tool call dispatched to a daemon is still running; the turn will
    /// resume once its terminal update lands.
    Busy,
    Error(String),
}

pub struct LlmEngine {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    tool_store: Arc<ToolCallStore>,
    streaming: Arc<StreamingManager>,
    permission: Arc<PermissionService>,
    tracker: Arc<AsyncTaskTracker>,
    ipc_client: Option<Arc<IpcClient>>,
    config: Arc<Config>,
}

impl LlmEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        tool_store: Arc<ToolCallStore>,
        streaming: Arc<StreamingManager>,
        permission: Arc<PermissionService>,
        tracker: Arc<AsyncTaskTracker>,
        ipc_client: Option<Arc<IpcClient>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            provider,
            tools,
            tool_store,
            streaming,
            permission,
            tracker,
            ipc_client,
            config,
        }
    }

    /// Run the turn: one or more phases, each a full stream-to-quiescence
    /// pass, bounded by `max_follow_up_passes`.
    pub async fn run_turn(
        &self,
        adapter: &SessionAdapter,
        cancel: CancellationToken,
        event_tx: mpsc::Sender<EngineEvent>,
    ) {
        let session = adapter.session_id().clone();
        self.streaming.begin(&session, cancel.clone());

        let mut follow_ups: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                self.streaming.clear(&session);
                let _ = event_tx.send(EngineEvent::Cancelled).await;
                return;
            }

            if follow_ups > self.config.max_follow_up_passes {
                self.streaming.clear(&session);
                let _ = event_tx
                    .send(EngineEvent::Error("max follow-up passes reached".to_string()))
                    .await;
                return;
            }

            let has_tool_calls = match self.run_phase(adapter, &session, cancel.clone(), &event_tx).await {
                PhaseOutcome::Quiescent => false,
                PhaseOutcome::HasToolCalls => true,
                PhaseOutcome::Cancelled => {
                    self.streaming.clear(&session);
                    return;
                }
                // Async call outstanding; resume happens when its terminal
                // update lands and the orchestrator re-enters this turn.
                PhaseOutcome::Busy => {
                    let _ = event_tx.send(EngineEvent::Busy).await;
                    return;
                }
                PhaseOutcome::Error => {
                    self.streaming.clear(&session);
                    return;
                }
            };

            if !has_tool_calls {
                self.streaming.clear(&session);
                let _ = event_tx.send(EngineEvent::Done).await;
                return;
            }

            follow_ups += 1;
        }
    }

    async fn run_phase(
        &self,
        adapter: &SessionAdapter,
        session: &SessionId,
        cancel: CancellationToken,
        event_tx: &mpsc::Sender<EngineEvent>,
    ) -> PhaseOutcome {
        let instructions = adapter.build_instructions();
        let conversation = match adapter.build_conversation() {
            Ok(c) => c,
            Err(e) => {
                let _ = event_tx.send(EngineEvent::Error(e.to_string())).await;
                return PhaseOutcome::Error;
            }
        };

        let request = LlmRequest {
            model: self.config.default_model.clone(),
            messages: conversation,
            tools: Some(adapter.tool_specs(self.tools.get_definitions(), self.agent_tool_spec())),
            system: Some(instructions),
            ..Default::default()
        };

        let stream = match self.provider.complete_stream(request).await {
            Ok(s) => s,
            Err(e) => {
                let _ = event_tx.send(EngineEvent::Error(e.to_string())).await;
                return PhaseOutcome::Error;
            }
        };

        let mut stream = stream;

        let mut text_content = String::new();
        let mut tool_calls: Vec<AccumulatedToolCall> = Vec::new();
        let mut current_tool: Option<AccumulatedToolCall> = None;
        let mut saw_any_chunk = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.tool_store.cancel_all_pending();
                    let _ = event_tx.send(EngineEvent::Cancelled).await;
                    return PhaseOutcome::Cancelled;
                }
                delta_opt = stream.next() => {
                    let Some(delta_result) = delta_opt else { break };
                    saw_any_chunk = true;
                    match delta_result {
                        Ok(StreamDelta::Text(text)) => {
                            text_content.push_str(&text);
                            let _ = event_tx.send(EngineEvent::Text(text)).await;
                        }
                        Ok(StreamDelta::Thinking(text)) => {
                            let _ = event_tx.send(EngineEvent::Thinking(text)).await;
                        }
                        Ok(StreamDelta::ToolCallStart { id, name }) => {
                            current_tool = Some(AccumulatedToolCall { id: id.clone(), name: name.clone(), ..Default::default() });
                            self.streaming.track_tool_call(session, &id);
                            self.tool_store.ensure_call(ToolCall {
                                id: id.clone(), name: name.clone(), input: String::new(), finished: false, reason: None,
                            });
                            let _ = event_tx.send(EngineEvent::ToolCallStart { id, name }).await;
                        }
                        Ok(StreamDelta::ToolCallDelta { id, arguments }) => {
                            if let Some(tool) = current_tool.as_mut() {
                                tool.arguments.push_str(&arguments);
                            }
                            self.tool_store.append_input(&id, &arguments);
                            let _ = event_tx.send(EngineEvent::ToolCallDelta { id, arguments }).await;
                        }
                        Ok(StreamDelta::ToolCallEnd { id: _ }) => {
                            if let Some(tool) = current_tool.take() {
                                tool_calls.push(tool);
                            }
                        }
                        Ok(StreamDelta::Done { .. }) => {}
                        Ok(StreamDelta::Error(e)) => {
                            let _ = event_tx.send(EngineEvent::Error(e)).await;
                        }
                        Err(e) => {
                            let _ = event_tx.send(EngineEvent::Error(e.to_string())).await;
                        }
                    }
                }
            }
        }

        if !saw_any_chunk {
            let _ = event_tx
                .send(EngineEvent::Error("empty streaming response".to_string()))
                .await;
            return PhaseOutcome::Error;
        }

        if tool_calls.is_empty() {
            if let Err(e) = adapter.record_assistant_content(&text_content) {
                let _ = event_tx.send(EngineEvent::Error(e.to_string())).await;
                return PhaseOutcome::Error;
            }
            return PhaseOutcome::Quiescent;
        }

        let calls: Vec<ToolCall> = tool_calls
            .iter()
            .map(|tc| ToolCall {
                id: tc.id.clone(),
                name: tc.name.clone(),
                input: tc.arguments.clone(),
                finished: true,
                reason: None,
            })
            .collect();

        let preceding = if text_content.is_empty() { None } else { Some(text_content.as_str()) };
        if let Err(e) = adapter.record_assistant_tool_calls(calls, preceding) {
            let _ = event_tx.send(EngineEvent::Error(e.to_string())).await;
            return PhaseOutcome::Error;
        }

        let mut any_async = false;
        let mut denied = false;
        let mut results = Vec::new();

        for tc in tool_calls {
            if cancel.is_cancelled() {
                self.tool_store.cancel_all_pending();
                let _ = event_tx.send(EngineEvent::Cancelled).await;
                return PhaseOutcome::Cancelled;
            }

            if denied {
                // A prior call in this batch was denied; the turn is already
                // ending, so the rest of the batch is short-circuited rather
                // than attempted.
                let content = "not attempted: turn cancelled".to_string();
                self.tool_store.deny_permission(&tc.id, &content);
                self.streaming.clear_tool_call(session, &tc.id);
                let _ = event_tx
                    .send(EngineEvent::ToolResult { id: tc.id.clone(), name: tc.name.clone(), content: content.clone(), is_error: true })
                    .await;
                results.push(ToolResult {
                    tool_call_id: tc.id,
                    name: Some(tc.name),
                    content,
                    metadata: String::new(),
                    is_error: true,
                    pending: false,
                });
                continue;
            }

            let args = tc.parse_arguments().unwrap_or_default();
            let granted = self.check_permission(session, &tc).await;

            if !granted {
                denied = true;
                let content = "permission denied".to_string();
                self.tool_store.deny_permission(&tc.id, &content);
                self.streaming.clear_tool_call(session, &tc.id);
                let _ = event_tx
                    .send(EngineEvent::ToolResult { id: tc.id.clone(), name: tc.name.clone(), content: content.clone(), is_error: true })
                    .await;
                results.push(ToolResult {
                    tool_call_id: tc.id,
                    name: Some(tc.name),
                    content,
                    metadata: String::new(),
                    is_error: true,
                    pending: false,
                });
                continue;
            }

            let _ = event_tx
                .send(EngineEvent::ToolExecuting { id: tc.id.clone(), name: tc.name.clone() })
                .await;

            let ctx = ToolContext {
                session_id: session.clone(),
                call_id: tc.id.clone(),
                active_agent: None,
                core_agent: "opperator".to_string(),
            };

            let outcome = self
                .tools
                .execute_cancellable(&tc.name, &ctx, args, cancel.clone())
                .await;

            match outcome {
                ToolOutcome::Async { content, metadata } => {
                    any_async = true;
                    let advertised_tool = metadata
                        .get("async_task")
                        .or_else(|| metadata.get("task"))
                        .and_then(|t| t.get("tool"))
                        .and_then(|v| v.as_str())
                        .unwrap_or(tc.name.as_str())
                        .to_string();

                    // The generic "agent" wrapper's displayed name is replaced by
                    // the daemon-advertised tool; a directly-registered command
                    // tool already has a specific name and keeps it.
                    let display_name = if tc.name == "agent" {
                        advertised_tool.clone()
                    } else {
                        tc.name.clone()
                    };

                    let metadata_str = metadata.to_string();
                    self.tool_store.update_metadata(&tc.id, |m| {
                        for (k, v) in metadata_as_object(&metadata_str) {
                            m.insert(k, v);
                        }
                    });
                    let (_, _) = self.tool_store.set_pending_result(
                        &tc.id,
                        ToolResult {
                            tool_call_id: tc.id.clone(),
                            name: Some(display_name.clone()),
                            content: content.clone(),
                            metadata: metadata_str.clone(),
                            is_error: false,
                            pending: true,
                        },
                    );

                    results.push(ToolResult {
                        tool_call_id: tc.id.clone(),
                        name: Some(display_name.clone()),
                        content,
                        metadata: metadata_str.clone(),
                        is_error: false,
                        pending: true,
                    });

                    if let Some(client) = &self.ipc_client {
                        if let Some(task) = parse_async_task(session, &tc.id, &display_name, &metadata) {
                            self.tracker.spawn_watcher(task, client.clone(), 0);
                        }
                    }
                }
                outcome => {
                    let content = outcome.to_content_string();
                    let is_error = outcome.is_error();
                    self.tool_store.complete(
                        &tc.id,
                        ToolResult {
                            tool_call_id: tc.id.clone(),
                            name: Some(tc.name.clone()),
                            content: content.clone(),
                            metadata: String::new(),
                            is_error,
                            pending: false,
                        },
                    );
                    self.streaming.clear_tool_call(session, &tc.id);
                    let _ = event_tx
                        .send(EngineEvent::ToolResult { id: tc.id.clone(), name: tc.name.clone(), content: content.clone(), is_error })
                        .await;
                    results.push(ToolResult {
                        tool_call_id: tc.id,
                        name: Some(tc.name),
                        content,
                        metadata: String::new(),
                        is_error,
                        pending: false,
                    });
                }
            }
        }

        if let Err(e) = adapter.record_tool_results(results) {
            let _ = event_tx.send(EngineEvent::Error(e.to_string())).await;
            return PhaseOutcome::Error;
        }

        if denied {
            // No further tool attempts happen in this turn; the stream is
            // cancelled rather than followed up with another LLM pass.
            let _ = event_tx.send(EngineEvent::Cancelled).await;
            PhaseOutcome::Cancelled
        } else if any_async {
            self.streaming.set_pending_async_resume(session);
            PhaseOutcome::Busy
        } else {
            PhaseOutcome::HasToolCalls
        }
    }

    async fn check_permission(&self, session: &SessionId, tc: &AccumulatedToolCall) -> bool {
        let Some(tool) = self.tools.get(&tc.name) else {
            return true; // unknown tools default to allowed
        };
        let Some((action, description)) = permission_profile(&tc.name) else {
            return true;
        };
        let args = tc.parse_arguments().unwrap_or_default();
        let path = tool.permission_path(&args).map(PathBuf::from);

        self.tool_store.request_permission(&tc.id);
        let granted = self
            .permission
            .request(RequestOptions {
                session_id: session.clone(),
                tool_call_id: tc.id.clone(),
                tool_name: tc.name.clone(),
                action: Some(action.to_string()),
                description: description(&tc.arguments),
                params: args,
                path,
                reason: None,
            })
            .await;

        if granted {
            self.tool_store.grant_permission(&tc.id);
        }
        granted
    }

    fn agent_tool_spec(&self) -> Option<LlmTool> {
        self.tools.get("agent").map(|t| t.to_llm_tool())
    }
}

enum PhaseOutcome {
    Quiescent,
    HasToolCalls,
    Busy,
    Cancelled,
    Error,
}

/// Permission arbitration is tool-specific; only these six
/// named tools gate on a human decision.
fn permission_profile(tool_name: &str) -> Option<(&'static str, fn(&str) -> String)> {
    match tool_name {
        "ls" | "view" => Some(("read", describe_generic)),
        "write" | "edit" | "multi_edit" => Some(("write", describe_generic)),
        "bash" => Some(("execute", describe_bash)),
        _ => None,
    }
}

fn describe_generic(_arguments: &str) -> String {
    String::new()
}

fn describe_bash(arguments: &str) -> String {
    let preview: String = arguments.chars().take(120).collect();
    format!("run: {preview}")
}

fn parse_async_task(
    session: &SessionId,
    call_id: &str,
    tool_name: &str,
    metadata: &serde_json::Value,
) -> Option<opperator_core::AsyncTask> {
    let task_meta = metadata.get("async_task").or_else(|| metadata.get("task"))?;
    let id = task_meta.get("id")?.as_str()?.to_string();
    let now = chrono::Utc::now().timestamp_millis();
    Some(opperator_core::AsyncTask {
        id,
        session_id: session.clone(),
        call_id: call_id.to_string(),
        tool_name: tool_name.to_string(),
        mode: task_meta.get("mode").and_then(|v| v.as_str()).unwrap_or("agent").to_string(),
        agent_name: task_meta.get("agent_name").and_then(|v| v.as_str()).map(String::from),
        command_name: task_meta.get("command_name").and_then(|v| v.as_str()).map(String::from),
        status: opperator_core::AsyncTaskStatus::Loading,
        result: None,
        error: None,
        metadata: metadata.to_string(),
        args: "{}".to_string(),
        created_at: now,
        updated_at: now,
        completed_at: None,
        progress: Vec::new(),
    })
}

/// Applies a terminal tracker update to the Tool-Call Store and History,
/// then reports whether the session should auto-resume.
pub fn apply_terminal_update(
    tool_store: &ToolCallStore,
    history: &opperator_history::SessionHistory,
    session: &SessionId,
    task: &opperator_core::AsyncTask,
    result: ToolResult,
) -> opperator_core::Result<bool> {
    tool_store.complete(&task.call_id, result.clone());
    history.append_tool_results(session, vec![result])?;

    if history.tool_result_handled(session, &task.call_id)? {
        return Ok(false);
    }
    history.mark_tool_result_handled(session, &task.call_id)?;
    Ok(true)
}

/// Applies an in-flight progress update to the Tool-Call Store only
/// (progress lines are not persisted individually).
pub fn apply_progress_update(tool_store: &ToolCallStore, call_id: &str, entry: String) {
    tool_store.append_progress(call_id, entry);
}

pub fn mark_cancelled_if_terminal(tool_store: &ToolCallStore, id: &str) {
    if let Some(exec) = tool_store.get(id) {
        if !exec.lifecycle.is_terminal() {
            tool_store.set_lifecycle(id, Lifecycle::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::CoreAgent;
    use opperator_history::store::Store;
    use opperator_history::SessionHistory;
    use opperator_llm::LlmResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays one scripted `StreamDelta` sequence per call, repeating the
    /// last script forever once the list is exhausted.
    struct FakeProvider {
        scripts: Vec<Vec<StreamDelta>>,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(scripts: Vec<Vec<StreamDelta>>) -> Self {
            Self { scripts, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }
        fn models(&self) -> &[&str] {
            &["fake-model"]
        }
        async fn complete_stream(&self, _request: LlmRequest) -> LlmResult<opperator_llm::LlmStream> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.get(i).or_else(|| self.scripts.last()).cloned().unwrap_or_default();
            let stream = futures::stream::iter(script.into_iter().map(Ok));
            Ok(Box::pin(stream))
        }
    }

    struct FakeTool {
        name: &'static str,
        outcome: ToolOutcome,
    }

    #[async_trait::async_trait]
    impl Tool for FakeTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "fake"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({})
        }
        async fn execute(&self, _ctx: &ToolContext, _args: serde_json::Value) -> ToolOutcome {
            self.outcome.clone()
        }
    }

    fn test_engine(provider: FakeProvider, tools: ToolRegistry, config: Config) -> (LlmEngine, SessionAdapter) {
        let history = Arc::new(SessionHistory::new(Arc::new(Store::open_in_memory().unwrap())));
        let adapter = SessionAdapter::new(history, SessionId::from("s1"), CoreAgent::Opperator, "prompt".to_string());
        let (tracker, _tracker_rx) = AsyncTaskTracker::new(8);
        let engine = LlmEngine::new(
            Arc::new(provider),
            Arc::new(tools),
            Arc::new(ToolCallStore::new()),
            Arc::new(StreamingManager::new()),
            Arc::new(PermissionService::new(Vec::new())),
            Arc::new(tracker),
            None,
            Arc::new(config),
        );
        (engine, adapter)
    }

    #[tokio::test]
    async fn empty_stream_reports_empty_streaming_response() {
        let (engine, adapter) = test_engine(FakeProvider::new(vec![vec![]]), ToolRegistry::new(), Config::default());
        let (tx, mut rx) = mpsc::channel(16);
        engine.run_turn(&adapter, CancellationToken::new(), tx).await;

        match rx.recv().await {
            Some(EngineEvent::Error(msg)) => assert_eq!(msg, "empty streaming response"),
            other => panic!("expected empty-stream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn quiescent_text_only_pass_emits_done_and_records_content() {
        let script = vec![StreamDelta::Text("hello there".to_string()), StreamDelta::Done { stop_reason: None, usage: None }];
        let (engine, adapter) = test_engine(FakeProvider::new(vec![script]), ToolRegistry::new(), Config::default());
        let (tx, mut rx) = mpsc::channel(16);
        engine.run_turn(&adapter, CancellationToken::new(), tx).await;

        let mut saw_done = false;
        while let Some(ev) = rx.recv().await {
            if matches!(ev, EngineEvent::Done) {
                saw_done = true;
            }
        }
        assert!(saw_done, "expected a Done event on a tool-call-free pass");

        let conversation = adapter.build_conversation().unwrap();
        assert!(conversation
            .iter()
            .any(|m| matches!(&m.content, opperator_llm::LlmContent::Text(t) if t == "hello there")));
    }

    #[tokio::test]
    async fn follow_up_bound_of_zero_errors_on_the_first_extra_pass() {
        let tool_call_script = vec![
            StreamDelta::ToolCallStart { id: "t1".to_string(), name: "noop".to_string() },
            StreamDelta::ToolCallDelta { id: "t1".to_string(), arguments: "{}".to_string() },
            StreamDelta::ToolCallEnd { id: "t1".to_string() },
            StreamDelta::Done { stop_reason: None, usage: None },
        ];
        let mut tools = ToolRegistry::new();
        tools.register(FakeTool { name: "noop", outcome: ToolOutcome::text("ok") });

        let mut config = Config::default();
        config.max_follow_up_passes = 0;

        let (engine, adapter) = test_engine(FakeProvider::new(vec![tool_call_script]), tools, config);
        let (tx, mut rx) = mpsc::channel(16);
        engine.run_turn(&adapter, CancellationToken::new(), tx).await;

        let mut saw_bound_error = false;
        while let Some(ev) = rx.recv().await {
            if let EngineEvent::Error(msg) = ev {
                assert_eq!(msg, "max follow-up passes reached");
                saw_bound_error = true;
            }
        }
        assert!(saw_bound_error);
    }

    #[tokio::test]
    async fn denied_gated_tool_cancels_the_turn_without_a_follow_up_phase() {
        let tool_call_script = vec![
            StreamDelta::ToolCallStart { id: "t1".to_string(), name: "bash".to_string() },
            StreamDelta::ToolCallDelta { id: "t1".to_string(), arguments: "{}".to_string() },
            StreamDelta::ToolCallEnd { id: "t1".to_string() },
            StreamDelta::Done { stop_reason: None, usage: None },
        ];
        let mut tools = ToolRegistry::new();
        tools.register(FakeTool { name: "bash", outcome: ToolOutcome::text("should not run") });

        let config = Config::default();

        let history = Arc::new(SessionHistory::new(Arc::new(Store::open_in_memory().unwrap())));
        let adapter = SessionAdapter::new(history, SessionId::from("s1"), CoreAgent::Opperator, "prompt".to_string());
        let permission = Arc::new(PermissionService::new(Vec::new()));
        let provider = Arc::new(FakeProvider::new(vec![tool_call_script]));
        let (tracker, _tracker_rx) = AsyncTaskTracker::new(8);
        let engine = LlmEngine::new(
            provider.clone(),
            Arc::new(tools),
            Arc::new(ToolCallStore::new()),
            Arc::new(StreamingManager::new()),
            permission.clone(),
            Arc::new(tracker),
            None,
            Arc::new(config),
        );

        let mut requests = permission.subscribe_requests();
        let denier = tokio::spawn(async move {
            let req = requests.recv().await.unwrap();
            permission.deny(&req.id, Some("no".to_string()));
        });

        let (tx, mut rx) = mpsc::channel(16);
        engine.run_turn(&adapter, CancellationToken::new(), tx).await;
        denier.await.unwrap();

        let mut saw_denied_result = false;
        let mut saw_cancelled = false;
        let mut tool_call_starts = 0;
        while let Some(ev) = rx.recv().await {
            match ev {
                EngineEvent::ToolResult { id, name, content, is_error } => {
                    assert_eq!(id, "t1");
                    assert_eq!(name, "bash");
                    assert_eq!(content, "permission denied");
                    assert!(is_error);
                    saw_denied_result = true;
                }
                EngineEvent::ToolCallStart { .. } => tool_call_starts += 1,
                EngineEvent::Cancelled => saw_cancelled = true,
                EngineEvent::Done | EngineEvent::Error(_) => {
                    panic!("denial must end the turn via Cancelled, not {ev:?}")
                }
                _ => {}
            }
        }
        assert!(saw_denied_result);
        assert!(saw_cancelled, "expected the turn to end with Cancelled");
        assert_eq!(tool_call_starts, 1, "a denial must not start a second follow-up phase");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1, "the provider must be invoked exactly once");

        // The tool_call_batch must be persisted before the tool_result_batch
        // that answers it, regardless of whether the answer was a denial.
        let conversation = adapter.build_conversation().unwrap();
        let call_index = conversation
            .iter()
            .position(|m| matches!(&m.content, opperator_llm::LlmContent::Blocks(b) if b.iter().any(|c| matches!(c, opperator_llm::ContentBlock::ToolUse { .. }))))
            .expect("tool_call_batch missing from conversation");
        let result_index = conversation
            .iter()
            .position(|m| matches!(&m.content, opperator_llm::LlmContent::Blocks(b) if b.iter().any(|c| matches!(c, opperator_llm::ContentBlock::ToolResult { .. }))))
            .expect("tool_result_batch missing from conversation");
        assert!(call_index < result_index);
    }

    #[tokio::test]
    async fn a_denial_short_circuits_the_rest_of_its_own_batch() {
        let tool_call_script = vec![
            StreamDelta::ToolCallStart { id: "t1".to_string(), name: "bash".to_string() },
            StreamDelta::ToolCallDelta { id: "t1".to_string(), arguments: "{}".to_string() },
            StreamDelta::ToolCallEnd { id: "t1".to_string() },
            StreamDelta::ToolCallStart { id: "t2".to_string(), name: "write".to_string() },
            StreamDelta::ToolCallDelta { id: "t2".to_string(), arguments: "{}".to_string() },
            StreamDelta::ToolCallEnd { id: "t2".to_string() },
            StreamDelta::Done { stop_reason: None, usage: None },
        ];
        let mut tools = ToolRegistry::new();
        tools.register(FakeTool { name: "bash", outcome: ToolOutcome::text("should not run") });
        tools.register(FakeTool { name: "write", outcome: ToolOutcome::text("should not run either") });

        let history = Arc::new(SessionHistory::new(Arc::new(Store::open_in_memory().unwrap())));
        let adapter = SessionAdapter::new(history, SessionId::from("s1"), CoreAgent::Opperator, "prompt".to_string());
        let permission = Arc::new(PermissionService::new(Vec::new()));
        let (tracker, _tracker_rx) = AsyncTaskTracker::new(8);
        let engine = LlmEngine::new(
            Arc::new(FakeProvider::new(vec![tool_call_script])),
            Arc::new(tools),
            Arc::new(ToolCallStore::new()),
            Arc::new(StreamingManager::new()),
            permission.clone(),
            Arc::new(tracker),
            None,
            Arc::new(Config::default()),
        );

        let mut requests = permission.subscribe_requests();
        let denier = tokio::spawn(async move {
            // Only the first call (t1) is ever offered to the permission
            // gate; t2 is short-circuited without being checked.
            let req = requests.recv().await.unwrap();
            assert_eq!(req.tool_call_id, "t1");
            permission.deny(&req.id, Some("no".to_string()));
        });

        let (tx, mut rx) = mpsc::channel(16);
        engine.run_turn(&adapter, CancellationToken::new(), tx).await;
        denier.await.unwrap();

        let mut results = Vec::new();
        while let Some(ev) = rx.recv().await {
            if let EngineEvent::ToolResult { id, content, is_error, .. } = ev {
                results.push((id, content, is_error));
            }
        }

        assert_eq!(results.len(), 2);
        assert_eq!(results[0], ("t1".to_string(), "permission denied".to_string(), true));
        assert_eq!(results[1], ("t2".to_string(), "not attempted: turn cancelled".to_string(), true));
    }
}
