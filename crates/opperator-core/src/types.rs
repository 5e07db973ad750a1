//! Shared data model: sessions, messages, tool calls/results, executions,
//! async tasks, daemons and permission requests. These are the types that
//! cross crate boundaries; crate-local detail lives closer to its owner.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque session identifier. Cheap to clone; used as a map key everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

/// Store roles, enumerated per the persistence contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolCall,
    ToolCallResponse,
    System,
}

/// Reserved name used when a tool's real name cannot yet be derived
/// (streaming has not produced one, and no async marker names it either).
pub const ASYNC_PLACEHOLDER_NAME: &str = "async_placeholder";

/// One recorded invocation the model asked for.
///
/// Once persisted, `id`/`name`/`input` are immutable; `finished` is
/// monotonic (false -> true only) and `reason` may be set once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Arguments, as a JSON-encoded string (not parsed — the store is
    /// agnostic to the tool's schema).
    pub input: String,
    pub finished: bool,
    pub reason: Option<String>,
}

impl ToolCall {
    pub fn is_async(&self) -> bool {
        self.id.starts_with("async_")
    }
}

/// One tool result. At most one *completed* (`pending = false`) result may
/// exist per `tool_call_id`; pending results may be superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: Option<String>,
    pub content: String,
    /// JSON-encoded metadata object (async task markers, progress logs…).
    pub metadata: String,
    pub is_error: bool,
    pub pending: bool,
}

/// A turn summary, attached in-memory to the preceding assistant message;
/// on reload it is re-attached by scanning for the nearest assistant part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnSummary {
    pub agent_id: String,
    pub agent_name: String,
    pub agent_color: String,
    pub duration_ms: u64,
}

/// Polymorphic message content. A `Message` carries a `Vec<ContentPart>` so
/// that, e.g., assistant text and a following tool-call batch can coexist on
/// one logical turn entry when the adapter needs that shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ToolCallBatch { calls: Vec<ToolCall> },
    ToolResultBatch { results: Vec<ToolResult> },
    TurnSummary(TurnSummary),
    SystemMarker { marker_kind: String, payload: String },
}

/// One row of the append-only conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: SessionId,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    pub created_at: i64,
}

/// Permission state of an execution as tracked by the tool-call store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Unknown,
    Requested,
    Granted,
    Denied,
}

/// Execution lifecycle. When not explicitly set, it is derived: a completed
/// call with `is_error` is `Failed`; otherwise `Completed`; progress present
/// and not finished is `Running`; else `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Unknown,
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Deleted,
}

impl Lifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Lifecycle::Completed | Lifecycle::Failed | Lifecycle::Cancelled | Lifecycle::Deleted
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFlags {
    pub is_async: bool,
    pub persistent: bool,
    pub needs_resume: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Display {
    pub label: String,
    pub summary: String,
    pub body: Vec<String>,
}

/// In-memory record of a tool call's full lifecycle; not persisted
/// verbatim — the persisted shape is `ToolCall`/`ToolResult` pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub call: Option<ToolCall>,
    pub result: Option<ToolResult>,
    pub permission: Permission,
    pub lifecycle: Lifecycle,
    pub flags: ExecutionFlags,
    pub progress: Vec<String>,
    pub display: Display,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

impl Execution {
    pub fn new(id: impl Into<String>, now: i64) -> Self {
        Self {
            id: id.into(),
            call: None,
            result: None,
            permission: Permission::Unknown,
            lifecycle: Lifecycle::Unknown,
            flags: ExecutionFlags::default(),
            progress: Vec::new(),
            display: Display::default(),
            started_at: now,
            completed_at: None,
        }
    }

    /// Recompute `lifecycle` when it has not been explicitly pinned by a
    /// completion/denial path, per the derivation rule in the data model.
    pub fn derive_lifecycle(&mut self) {
        if self.lifecycle.is_terminal() {
            return;
        }
        self.lifecycle = match &self.result {
            Some(r) if !r.pending => {
                if r.is_error {
                    Lifecycle::Failed
                } else {
                    Lifecycle::Completed
                }
            }
            _ => {
                if !self.progress.is_empty() && !self.finished() {
                    Lifecycle::Running
                } else {
                    Lifecycle::Pending
                }
            }
        };
    }

    pub fn finished(&self) -> bool {
        self.call.as_ref().map(|c| c.finished).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncTaskStatus {
    Pending,
    Loading,
    Complete,
    Failed,
}

impl AsyncTaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AsyncTaskStatus::Complete | AsyncTaskStatus::Failed)
    }
}

/// A long-running task owned by a daemon, mirrored locally by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncTask {
    pub id: String,
    pub session_id: SessionId,
    pub call_id: String,
    pub tool_name: String,
    pub mode: String,
    pub agent_name: Option<String>,
    pub command_name: Option<String>,
    pub status: AsyncTaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    /// JSON-encoded.
    pub metadata: String,
    /// JSON-encoded.
    pub args: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub progress: Vec<String>,
}

/// A registered daemon endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Daemon {
    pub name: String,
    pub address: String,
    pub auth_token: Option<String>,
    pub enabled: bool,
}

impl Daemon {
    pub fn is_local(&self) -> bool {
        self.name == "local"
    }
}

/// A request the permission service is arbitrating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: SessionId,
    pub tool_call_id: String,
    pub tool_name: String,
    pub action: String,
    pub description: String,
    pub params: serde_json::Value,
    pub path: Option<String>,
    pub reason: Option<String>,
}

/// Decode `metadata` as a JSON object, tolerating empty/invalid input by
/// treating it as an empty object — used by `update_metadata` and the
/// async-marker checks.
pub fn metadata_as_object(metadata: &str) -> serde_json::Map<String, serde_json::Value> {
    if metadata.trim().is_empty() {
        return serde_json::Map::new();
    }
    match serde_json::from_str::<serde_json::Value>(metadata) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

/// Canonical name derivation: prefer the first non-empty,
/// non-placeholder candidate; if every candidate is empty or the
/// placeholder, and an async marker is present, return the placeholder;
/// otherwise fall back to the first non-empty candidate (which may still
/// be the placeholder if that's all there is).
pub fn canonical_tool_name(id: &str, candidates: &[&str], metadata: &str) -> String {
    let first_real = candidates
        .iter()
        .find(|c| !c.is_empty() && **c != ASYNC_PLACEHOLDER_NAME);
    if let Some(name) = first_real {
        return name.to_string();
    }

    let meta = metadata_as_object(metadata);
    let has_async_marker = id.starts_with("async_")
        || meta.contains_key("async_task")
        || meta
            .get("tool")
            .and_then(|v| v.as_str())
            .map(|s| s.contains("async task"))
            .unwrap_or(false);

    if has_async_marker {
        return ASYNC_PLACEHOLDER_NAME.to_string();
    }

    candidates
        .iter()
        .find(|c| !c.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| ASYNC_PLACEHOLDER_NAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_prefers_first_real_candidate() {
        let name = canonical_tool_name("c1", &["", "ls", "list_files"], "");
        assert_eq!(name, "ls");
    }

    #[test]
    fn canonical_name_falls_back_to_placeholder_with_async_marker() {
        let name = canonical_tool_name("async_7", &["", ASYNC_PLACEHOLDER_NAME], "");
        assert_eq!(name, ASYNC_PLACEHOLDER_NAME);
    }

    #[test]
    fn canonical_name_is_idempotent() {
        let first = canonical_tool_name("c1", &["", "bash"], "");
        let second = canonical_tool_name("c1", &[first.as_str()], "");
        assert_eq!(first, second);
    }

    #[test]
    fn metadata_as_object_tolerates_garbage() {
        assert!(metadata_as_object("not json").is_empty());
        assert!(metadata_as_object("").is_empty());
        assert!(metadata_as_object("[1,2]").is_empty());
    }
}
