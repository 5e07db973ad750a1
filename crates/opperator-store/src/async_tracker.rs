//! Async Task Tracker: one watcher per outstanding task,
//! streaming progress from the owning daemon with a polling fallback, and
//! able to restore its watch set across a restart.

use opperator_core::{AsyncTask, AsyncTaskStatus, SessionId, ToolResult};
use opperator_ipc::{IpcClient, Request};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_RETRY_INTERVAL: Duration = Duration::from_secs(3);
const TASK_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum TrackerUpdate {
    Snapshot(AsyncTask),
    Progress { task_id: String, entry: String },
    /// Terminal: a synthesized final `ToolResult` plus the task's last
    /// known shape, merging task metadata and the progress log.
    Terminal { task: AsyncTask, result: ToolResult },
    Deleted { task_id: String, session_id: SessionId, call_id: String },
}

pub struct AsyncTaskTracker {
    tx: mpsc::Sender<TrackerUpdate>,
}

impl AsyncTaskTracker {
    /// Bounded channel with non-blocking sends: the orchestrator drains it
    /// on its main loop, and a full channel means updates are dropped
    /// rather than backpressuring the watcher.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TrackerUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn spawn_watcher(&self, task: AsyncTask, client: Arc<IpcClient>, seen: usize) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            watch_task(task, client, seen, tx).await;
        });
    }

    /// Restore outstanding tasks at startup: any task not already in a
    /// terminal state gets a watcher whose `seen` counter equals its
    /// persisted progress length, so existing progress is not replayed.
    pub fn restore(&self, tasks: Vec<AsyncTask>, client: Arc<IpcClient>) {
        for task in tasks {
            if task.status.is_terminal() {
                continue;
            }
            let seen = task.progress.len();
            self.spawn_watcher(task, client.clone(), seen);
        }
    }
}

async fn watch_task(task: AsyncTask, client: Arc<IpcClient>, seen: usize, tx: mpsc::Sender<TrackerUpdate>) {
    let req = Request::with_extra(
        "tool_watch",
        serde_json::json!({ "task_id": task.id, "session_id": task.session_id.as_str() }),
    );

    match client.subscribe(&req, TASK_REQUEST_TIMEOUT).await {
        Ok(mut sub) => {
            while let Some(event) = sub.events.recv().await {
                match event {
                    Ok(raw) => {
                        if let Some(terminal) = handle_stream_event(&task, &raw, &tx).await {
                            if terminal {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(task = %task.id, error = %e, "task stream error, falling back to poll");
                        break;
                    }
                }
            }
            // Stream closed without a terminal event: fall through to poll.
        }
        Err(_) => {
            debug!(task = %task.id, "task stream unavailable, polling");
        }
    }

    poll_task(task, client, seen, tx).await;
}

/// Returns `Some(true)` if the event was terminal (caller should stop),
/// `Some(false)` if handled and non-terminal, `None` if unrecognized.
async fn handle_stream_event(task: &AsyncTask, raw: &Value, tx: &mpsc::Sender<TrackerUpdate>) -> Option<bool> {
    let kind = raw.get("type").and_then(|v| v.as_str())?;
    match kind {
        "snapshot" => {
            let _ = tx.try_send(TrackerUpdate::Snapshot(task.clone()));
            Some(false)
        }
        "progress" => {
            let entry = raw.get("entry")?.as_str()?.to_string();
            let _ = tx.try_send(TrackerUpdate::Progress {
                task_id: task.id.clone(),
                entry,
            });
            Some(false)
        }
        "completed" | "failed" => {
            let is_failed = kind == "failed";
            let result = synthesize_result(task, raw, is_failed);
            let _ = tx.try_send(TrackerUpdate::Terminal { task: task.clone(), result });
            Some(true)
        }
        "deleted" => {
            let _ = tx.try_send(TrackerUpdate::Deleted {
                task_id: task.id.clone(),
                session_id: task.session_id.clone(),
                call_id: task.call_id.clone(),
            });
            Some(true)
        }
        _ => None,
    }
}

fn synthesize_result(task: &AsyncTask, raw: &Value, is_failed: bool) -> ToolResult {
    let content = raw
        .get("result")
        .and_then(|v| v.as_str())
        .or_else(|| raw.get("error").and_then(|v| v.as_str()))
        .unwrap_or(if is_failed { "async task failed" } else { "" })
        .to_string();

    let mut metadata = opperator_core::metadata_as_object(&task.metadata);
    metadata.insert("progress".to_string(), Value::from(task.progress.clone()));

    ToolResult {
        tool_call_id: task.call_id.clone(),
        name: Some(task.tool_name.clone()),
        content,
        metadata: Value::Object(metadata).to_string(),
        is_error: is_failed,
        pending: false,
    }
}

async fn poll_task(mut task: AsyncTask, client: Arc<IpcClient>, mut seen: usize, tx: mpsc::Sender<TrackerUpdate>) {
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        let req = Request::with_extra("tool_get", serde_json::json!({ "task_id": task.id }));
        let resp = match client.request(&req, TASK_REQUEST_TIMEOUT).await {
            Ok(v) => v,
            Err(e) => {
                if e.to_string().contains("not found") {
                    let _ = tx.try_send(TrackerUpdate::Terminal {
                        task: task.clone(),
                        result: ToolResult {
                            tool_call_id: task.call_id.clone(),
                            name: Some(task.tool_name.clone()),
                            content: "async task not found".to_string(),
                            metadata: String::new(),
                            is_error: true,
                            pending: false,
                        },
                    });
                    return;
                }
                tokio::time::sleep(POLL_RETRY_INTERVAL).await;
                continue;
            }
        };

        let Some(fetched) = resp.get("task").and_then(|t| parse_task(t, &task)) else {
            continue;
        };
        task = fetched;

        if task.progress.len() > seen {
            for entry in &task.progress[seen..] {
                let _ = tx.try_send(TrackerUpdate::Progress {
                    task_id: task.id.clone(),
                    entry: entry.clone(),
                });
            }
            seen = task.progress.len();
        }

        if task.status.is_terminal() {
            let is_failed = task.status == AsyncTaskStatus::Failed;
            let result = ToolResult {
                tool_call_id: task.call_id.clone(),
                name: Some(task.tool_name.clone()),
                content: task
                    .result
                    .clone()
                    .or_else(|| task.error.clone())
                    .unwrap_or_else(|| if is_failed { "async task failed".to_string() } else { String::new() }),
                metadata: task.metadata.clone(),
                is_error: is_failed,
                pending: false,
            };
            let _ = tx.try_send(TrackerUpdate::Terminal { task, result });
            return;
        }
    }
}

fn parse_task(raw: &Value, prior: &AsyncTask) -> Option<AsyncTask> {
    serde_json::from_value::<AsyncTask>(raw.clone())
        .ok()
        .or_else(|| Some(prior.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> AsyncTask {
        AsyncTask {
            id: "task-1".to_string(),
            session_id: SessionId::from("s1"),
            call_id: "call-1".to_string(),
            tool_name: "agent".to_string(),
            mode: "async".to_string(),
            agent_name: None,
            command_name: None,
            status: AsyncTaskStatus::Loading,
            result: None,
            error: None,
            metadata: "{}".to_string(),
            args: "{}".to_string(),
            created_at: 0,
            updated_at: 0,
            completed_at: None,
            progress: vec!["step 1".to_string()],
        }
    }

    #[test]
    fn synthesize_result_prefers_result_field_over_error() {
        let raw = serde_json::json!({"result": "done", "error": "unused"});
        let result = synthesize_result(&task(), &raw, false);
        assert_eq!(result.content, "done");
        assert!(!result.is_error);
        assert_eq!(result.tool_call_id, "call-1");
    }

    #[test]
    fn synthesize_result_falls_back_to_generic_message_when_failed_and_silent() {
        let raw = serde_json::json!({});
        let result = synthesize_result(&task(), &raw, true);
        assert_eq!(result.content, "async task failed");
        assert!(result.is_error);
    }

    #[test]
    fn synthesize_result_carries_progress_into_metadata() {
        let raw = serde_json::json!({"result": "ok"});
        let result = synthesize_result(&task(), &raw, false);
        let metadata: Value = serde_json::from_str(&result.metadata).unwrap();
        assert_eq!(metadata["progress"], serde_json::json!(["step 1"]));
    }

    #[test]
    fn parse_task_falls_back_to_prior_on_malformed_json() {
        let prior = task();
        let raw = serde_json::json!({"not": "a task"});
        let parsed = parse_task(&raw, &prior).unwrap();
        assert_eq!(parsed.id, prior.id);
    }

    #[test]
    fn parse_task_accepts_a_well_formed_task() {
        let prior = task();
        let mut updated = prior.clone();
        updated.status = AsyncTaskStatus::Complete;
        let raw = serde_json::to_value(&updated).unwrap();
        let parsed = parse_task(&raw, &prior).unwrap();
        assert_eq!(parsed.status, AsyncTaskStatus::Complete);
    }

    #[tokio::test]
    async fn restore_skips_terminal_tasks() {
        let (tracker, mut rx) = AsyncTaskTracker::new(8);
        let mut done = task();
        done.status = AsyncTaskStatus::Complete;
        let client = Arc::new(IpcClient::new("local", "tcp://127.0.0.1:1", None).unwrap());
        tracker.restore(vec![done], client);

        // No watcher was spawned for the terminal task, so nothing ever
        // reaches the update channel.
        let outcome = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(outcome.is_err(), "terminal task must not spawn a watcher");
    }
}
