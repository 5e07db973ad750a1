//! Tool-Call State Store: a concurrency-safe map of
//! `Execution` records, the single source of truth for what the UI shows
//! per tool call. All mutations are atomic under one internal lock and
//! return `(Execution, changed)` so a redraw can be skipped on no-ops.

use opperator_core::{
    canonical_tool_name, metadata_as_object, Display, Execution, Lifecycle, Permission, ToolCall,
    ToolResult,
};
use std::collections::HashMap;
use std::sync::Mutex;

pub struct ToolCallStore {
    inner: Mutex<HashMap<String, Execution>>,
}

impl Default for ToolCallStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl ToolCallStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Execution> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Execution> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    /// Insert if absent, merging fields when present: the latest non-empty
    /// name/input/reason wins; `finished` is monotonic (never flips back).
    pub fn ensure_call(&self, call: ToolCall) -> (Execution, bool) {
        let mut map = self.inner.lock().unwrap();
        let mut changed = false;
        let entry = map
            .entry(call.id.clone())
            .or_insert_with(|| Execution::new(call.id.clone(), now()));

        match &mut entry.call {
            None => {
                entry.call = Some(call);
                changed = true;
            }
            Some(existing) => {
                if !call.name.is_empty() && call.name != existing.name {
                    existing.name = call.name.clone();
                    changed = true;
                }
                if !call.input.is_empty() && call.input != existing.input {
                    existing.input = call.input.clone();
                    changed = true;
                }
                if call.reason.is_some() && existing.reason.is_none() {
                    existing.reason = call.reason.clone();
                    changed = true;
                }
                if call.finished && !existing.finished {
                    existing.finished = true;
                    changed = true;
                }
            }
        }
        entry.derive_lifecycle();
        (entry.clone(), changed)
    }

    pub fn append_input(&self, id: &str, delta: &str) -> Option<(Execution, bool)> {
        let mut map = self.inner.lock().unwrap();
        let entry = map.get_mut(id)?;
        if delta.is_empty() {
            return Some((entry.clone(), false));
        }
        if let Some(call) = entry.call.as_mut() {
            call.input.push_str(delta);
        }
        Some((entry.clone(), true))
    }

    pub fn set_reason(&self, id: &str, reason: impl Into<String>) -> Option<(Execution, bool)> {
        let mut map = self.inner.lock().unwrap();
        let entry = map.get_mut(id)?;
        let reason = reason.into();
        if let Some(call) = entry.call.as_mut() {
            if call.reason.is_some() {
                return Some((entry.clone(), false));
            }
            call.reason = Some(reason);
            return Some((entry.clone(), true));
        }
        Some((entry.clone(), false))
    }

    pub fn set_pending_result(&self, id: &str, result: ToolResult) -> (Execution, bool) {
        let mut map = self.inner.lock().unwrap();
        let entry = map
            .entry(id.to_string())
            .or_insert_with(|| Execution::new(id.to_string(), now()));
        entry.result = Some(result);
        entry.derive_lifecycle();
        (entry.clone(), true)
    }

    /// Overwrite the result and finalize lifecycle from `is_error`.
    pub fn complete(&self, id: &str, mut result: ToolResult) -> (Execution, bool) {
        result.pending = false;
        let mut map = self.inner.lock().unwrap();
        let entry = map
            .entry(id.to_string())
            .or_insert_with(|| Execution::new(id.to_string(), now()));
        entry.lifecycle = if result.is_error {
            Lifecycle::Failed
        } else {
            Lifecycle::Completed
        };
        entry.result = Some(result);
        if let Some(call) = entry.call.as_mut() {
            call.finished = true;
        }
        entry.completed_at = Some(now());
        (entry.clone(), true)
    }

    pub fn update_metadata<F>(&self, id: &str, f: F) -> Option<(Execution, bool)>
    where
        F: FnOnce(&mut serde_json::Map<String, serde_json::Value>),
    {
        let mut map = self.inner.lock().unwrap();
        let entry = map.get_mut(id)?;
        let result = entry.result.get_or_insert_with(|| ToolResult {
            tool_call_id: id.to_string(),
            name: None,
            content: String::new(),
            metadata: String::new(),
            is_error: false,
            pending: true,
        });
        let mut obj = metadata_as_object(&result.metadata);
        f(&mut obj);
        result.metadata = serde_json::Value::Object(obj).to_string();
        Some((entry.clone(), true))
    }

    pub fn request_permission(&self, id: &str) -> Option<(Execution, bool)> {
        let mut map = self.inner.lock().unwrap();
        let entry = map.get_mut(id)?;
        if entry.permission == Permission::Requested {
            return Some((entry.clone(), false));
        }
        entry.permission = Permission::Requested;
        Some((entry.clone(), true))
    }

    pub fn grant_permission(&self, id: &str) -> Option<(Execution, bool)> {
        let mut map = self.inner.lock().unwrap();
        let entry = map.get_mut(id)?;
        entry.permission = Permission::Granted;
        Some((entry.clone(), true))
    }

    /// Deny also marks finished, failed, and back-fills error content if
    /// the result has none yet.
    pub fn deny_permission(&self, id: &str, fallback_content: &str) -> Option<(Execution, bool)> {
        let mut map = self.inner.lock().unwrap();
        let entry = map.get_mut(id)?;
        entry.permission = Permission::Denied;
        entry.lifecycle = Lifecycle::Failed;
        if let Some(call) = entry.call.as_mut() {
            call.finished = true;
        }
        let content = entry
            .result
            .as_ref()
            .map(|r| r.content.clone())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| fallback_content.to_string());
        entry.result = Some(ToolResult {
            tool_call_id: id.to_string(),
            name: entry.call.as_ref().map(|c| c.name.clone()),
            content,
            metadata: entry
                .result
                .as_ref()
                .map(|r| r.metadata.clone())
                .unwrap_or_default(),
            is_error: true,
            pending: false,
        });
        entry.completed_at = Some(now());
        Some((entry.clone(), true))
    }

    pub fn set_lifecycle(&self, id: &str, lifecycle: Lifecycle) -> Option<(Execution, bool)> {
        let mut map = self.inner.lock().unwrap();
        let entry = map.get_mut(id)?;
        if entry.lifecycle == lifecycle {
            return Some((entry.clone(), false));
        }
        entry.lifecycle = lifecycle;
        Some((entry.clone(), true))
    }

    pub fn set_display(&self, id: &str, display: Display) -> Option<(Execution, bool)> {
        let mut map = self.inner.lock().unwrap();
        let entry = map.get_mut(id)?;
        entry.display = display;
        Some((entry.clone(), true))
    }

    pub fn set_progress(&self, id: &str, progress: Vec<String>) -> Option<(Execution, bool)> {
        let mut map = self.inner.lock().unwrap();
        let entry = map.get_mut(id)?;
        entry.progress = progress;
        entry.derive_lifecycle();
        Some((entry.clone(), true))
    }

    /// Appending progress while in a terminal lifecycle is ignored.
    pub fn append_progress(&self, id: &str, entry_text: String) -> Option<(Execution, bool)> {
        let mut map = self.inner.lock().unwrap();
        let entry = map.get_mut(id)?;
        if entry.lifecycle.is_terminal() {
            return Some((entry.clone(), false));
        }
        entry.progress.push(entry_text);
        entry.derive_lifecycle();
        Some((entry.clone(), true))
    }

    /// Mark every non-terminal execution in the store as cancelled; calling
    /// this again on an already-cancelled store is a no-op.
    pub fn cancel_all_pending(&self) -> Vec<Execution> {
        let mut map = self.inner.lock().unwrap();
        let mut changed = Vec::new();
        for entry in map.values_mut() {
            if !entry.lifecycle.is_terminal() {
                entry.lifecycle = Lifecycle::Cancelled;
                changed.push(entry.clone());
            }
        }
        changed
    }

    pub fn remove(&self, id: &str) {
        self.inner.lock().unwrap().remove(id);
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    /// Derive the stable display name for a call despite names streaming
    /// in pieces.
    pub fn canonical_name(&self, id: &str) -> String {
        let map = self.inner.lock().unwrap();
        let Some(entry) = map.get(id) else {
            return canonical_tool_name(id, &[], "");
        };
        let call_name = entry.call.as_ref().map(|c| c.name.as_str()).unwrap_or("");
        let result_name = entry
            .result
            .as_ref()
            .and_then(|r| r.name.as_deref())
            .unwrap_or("");
        let metadata = entry.result.as_ref().map(|r| r.metadata.as_str()).unwrap_or("");
        canonical_tool_name(id, &[call_name, result_name], metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input: String::new(),
            finished: false,
            reason: None,
        }
    }

    #[test]
    fn ensure_call_inserts_once() {
        let store = ToolCallStore::new();
        let (_, changed1) = store.ensure_call(call("c1", "ls"));
        assert!(changed1);
        let (_, changed2) = store.ensure_call(call("c1", "ls"));
        assert!(!changed2);
    }

    #[test]
    fn finished_is_monotonic() {
        let store = ToolCallStore::new();
        let mut c = call("c1", "ls");
        c.finished = true;
        store.ensure_call(c);
        let mut c2 = call("c1", "ls");
        c2.finished = false;
        let (exec, _) = store.ensure_call(c2);
        assert!(exec.call.unwrap().finished);
    }

    #[test]
    fn complete_sets_lifecycle_from_is_error() {
        let store = ToolCallStore::new();
        store.ensure_call(call("c1", "bash"));
        let (exec, _) = store.complete(
            "c1",
            ToolResult {
                tool_call_id: "c1".to_string(),
                name: Some("bash".to_string()),
                content: "boom".to_string(),
                metadata: String::new(),
                is_error: true,
                pending: false,
            },
        );
        assert_eq!(exec.lifecycle, Lifecycle::Failed);
        assert!(exec.call.unwrap().finished);
    }

    #[test]
    fn deny_backfills_error_content() {
        let store = ToolCallStore::new();
        store.ensure_call(call("c1", "edit"));
        let (exec, _) = store.deny_permission("c1", "permission denied").unwrap();
        assert_eq!(exec.result.unwrap().content, "permission denied");
        assert_eq!(exec.permission, Permission::Denied);
    }

    #[test]
    fn append_progress_ignored_in_terminal_state() {
        let store = ToolCallStore::new();
        store.ensure_call(call("c1", "bash"));
        store.set_lifecycle("c1", Lifecycle::Completed);
        let (_, changed) = store.append_progress("c1", "line".to_string()).unwrap();
        assert!(!changed);
    }

    #[test]
    fn cancel_all_pending_is_idempotent() {
        let store = ToolCallStore::new();
        store.ensure_call(call("c1", "bash"));
        let first = store.cancel_all_pending();
        assert_eq!(first.len(), 1);
        let second = store.cancel_all_pending();
        assert!(second.is_empty());
    }
}
