//! Streaming Manager: per-session ephemeral stream state,
//! never persisted. One phase's cancel hook, inbound chunk channel, the
//! canceling flag, pending tool calls (with insertion order preserved for
//! display), a pending assistant buffer, and the `pending_async_resume`
//! flag that `complete_response` consumes exactly once.

use opperator_core::SessionId;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct PendingAssistant {
    pub content: String,
    pub waiting: bool,
}

#[derive(Debug, Default)]
pub struct StreamState {
    pub cancel: Option<CancellationToken>,
    pub canceling: bool,
    pub waiting: bool,
    /// Keyed by call id; `order` preserves insertion order for display.
    pending_calls: HashMap<String, Option<String>>,
    order: Vec<String>,
    pub pending_assistant: PendingAssistant,
    /// Owned by the completion flow: `clear` leaves this flag untouched.
    pub pending_async_resume: bool,
}

#[derive(Default)]
pub struct StreamingManager {
    sessions: Mutex<HashMap<SessionId, StreamState>>,
}

impl StreamingManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, session: &SessionId, cancel: CancellationToken) {
        let mut map = self.sessions.lock().unwrap();
        let state = map.entry(session.clone()).or_default();
        state.cancel = Some(cancel);
        state.canceling = false;
        state.waiting = true;
    }

    pub fn mark_canceling(&self, session: &SessionId) -> bool {
        let mut map = self.sessions.lock().unwrap();
        let Some(state) = map.get_mut(session) else {
            return false;
        };
        let already = state.canceling;
        state.canceling = true;
        already
    }

    pub fn is_canceling(&self, session: &SessionId) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(session)
            .map(|s| s.canceling)
            .unwrap_or(false)
    }

    /// Expires the canceling flag after the 2 s grace window,
    /// independent of whether the stream itself has torn down yet.
    pub fn clear_canceling(&self, session: &SessionId) {
        if let Some(state) = self.sessions.lock().unwrap().get_mut(session) {
            state.canceling = false;
        }
    }

    pub fn track_tool_call(&self, session: &SessionId, call_id: &str) {
        let mut map = self.sessions.lock().unwrap();
        let state = map.entry(session.clone()).or_default();
        if !state.pending_calls.contains_key(call_id) {
            state.order.push(call_id.to_string());
        }
        state.pending_calls.insert(call_id.to_string(), None);
    }

    pub fn set_tool_reason(&self, session: &SessionId, call_id: &str, reason: impl Into<String>) {
        let mut map = self.sessions.lock().unwrap();
        if let Some(state) = map.get_mut(session) {
            if let Some(slot) = state.pending_calls.get_mut(call_id) {
                *slot = Some(reason.into());
            }
        }
    }

    pub fn clear_tool_call(&self, session: &SessionId, call_id: &str) {
        let mut map = self.sessions.lock().unwrap();
        if let Some(state) = map.get_mut(session) {
            state.pending_calls.remove(call_id);
            state.order.retain(|id| id != call_id);
        }
    }

    pub fn clear_tool_tracking(&self, session: &SessionId) {
        let mut map = self.sessions.lock().unwrap();
        if let Some(state) = map.get_mut(session) {
            state.pending_calls.clear();
            state.order.clear();
        }
    }

    /// Remove `call_id` from whichever session is tracking it, without
    /// knowing the session up front.
    pub fn clear_tool_call_by_id(&self, call_id: &str) {
        let mut map = self.sessions.lock().unwrap();
        for state in map.values_mut() {
            if state.pending_calls.remove(call_id).is_some() {
                state.order.retain(|id| id != call_id);
            }
        }
    }

    pub fn pending_tool_calls(&self, session: &SessionId) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap()
            .get(session)
            .map(|s| s.order.clone())
            .unwrap_or_default()
    }

    pub fn begin_pending_assistant(&self, session: &SessionId) {
        let mut map = self.sessions.lock().unwrap();
        let state = map.entry(session.clone()).or_default();
        state.pending_assistant = PendingAssistant {
            content: String::new(),
            waiting: true,
        };
    }

    pub fn record_pending_assistant(&self, session: &SessionId, delta: &str) {
        let mut map = self.sessions.lock().unwrap();
        if let Some(state) = map.get_mut(session) {
            state.pending_assistant.content.push_str(delta);
        }
    }

    pub fn mark_pending_assistant_done(&self, session: &SessionId) -> Option<String> {
        let mut map = self.sessions.lock().unwrap();
        let state = map.get_mut(session)?;
        state.pending_assistant.waiting = false;
        Some(state.pending_assistant.content.clone())
    }

    pub fn set_pending_async_resume(&self, session: &SessionId) {
        let mut map = self.sessions.lock().unwrap();
        map.entry(session.clone()).or_default().pending_async_resume = true;
    }

    /// Reads and clears the flag in one step, since the completion flow
    /// consumes it exactly once.
    pub fn take_pending_async_resume(&self, session: &SessionId) -> bool {
        let mut map = self.sessions.lock().unwrap();
        let Some(state) = map.get_mut(session) else {
            return false;
        };
        std::mem::take(&mut state.pending_async_resume)
    }

    /// Removes all ephemeral state for `session` except
    /// `pending_async_resume`, which the completion flow owns.
    pub fn clear(&self, session: &SessionId) {
        let mut map = self.sessions.lock().unwrap();
        if let Some(state) = map.get_mut(session) {
            let resume = state.pending_async_resume;
            *state = StreamState {
                pending_async_resume: resume,
                ..Default::default()
            };
        }
    }

    pub fn remove_session(&self, session: &SessionId) {
        self.sessions.lock().unwrap().remove(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_preserves_pending_async_resume() {
        let mgr = StreamingManager::new();
        let session = SessionId::from("s1");
        mgr.begin(&session, CancellationToken::new());
        mgr.track_tool_call(&session, "c1");
        mgr.set_pending_async_resume(&session);

        mgr.clear(&session);

        assert!(mgr.pending_tool_calls(&session).is_empty());
        assert!(mgr.take_pending_async_resume(&session));
    }

    #[test]
    fn take_pending_async_resume_consumes_once() {
        let mgr = StreamingManager::new();
        let session = SessionId::from("s1");
        mgr.set_pending_async_resume(&session);
        assert!(mgr.take_pending_async_resume(&session));
        assert!(!mgr.take_pending_async_resume(&session));
    }

    #[test]
    fn tool_call_order_is_insertion_order() {
        let mgr = StreamingManager::new();
        let session = SessionId::from("s1");
        mgr.track_tool_call(&session, "c1");
        mgr.track_tool_call(&session, "c2");
        assert_eq!(mgr.pending_tool_calls(&session), vec!["c1", "c2"]);
    }

    #[test]
    fn mark_canceling_reports_prior_state() {
        let mgr = StreamingManager::new();
        let session = SessionId::from("s1");
        mgr.begin(&session, CancellationToken::new());
        assert!(!mgr.mark_canceling(&session));
        assert!(mgr.mark_canceling(&session));
    }
}
