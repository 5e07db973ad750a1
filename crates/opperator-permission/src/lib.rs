//! Permission Service: arbitrates whether a tool
//! invocation may proceed. Grounded on the allow-list half of a glob-tier
//! policy model — only binary grant/deny through an allow-list plus
//! human-in-the-loop, since deny/ask tiers belong to an external
//! policy-proxy this core does not own.

use dashmap::{DashMap, DashSet};
use opperator_core::{PermissionRequest, SessionId};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::info;

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub session_id: SessionId,
    pub tool_call_id: String,
    pub tool_name: String,
    pub action: Option<String>,
    pub description: String,
    pub params: serde_json::Value,
    pub path: Option<PathBuf>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Grant,
    GrantPersistent,
    Deny,
}

#[derive(Debug, Clone)]
pub enum Notification {
    Granted { request_id: String },
    Denied { request_id: String, reason: Option<String> },
}

struct PendingRequest {
    respond: oneshot::Sender<(Decision, Option<String>)>,
}

pub struct PermissionService {
    persistent_grants: DashSet<(SessionId, String)>,
    auto_approve_sessions: DashSet<SessionId>,
    skip_all: AtomicBool,
    allow_list: DashSet<String>,
    pending: DashMap<String, PendingRequest>,
    request_tx: broadcast::Sender<PermissionRequest>,
    notification_tx: broadcast::Sender<Notification>,
    /// Serializes the active-request slot so the UI only ever sees one
    /// pending dialog at a time, even if `request` is called concurrently.
    active_slot: Arc<Mutex<()>>,
}

impl PermissionService {
    pub fn new(allow_list: Vec<String>) -> Self {
        let (request_tx, _) = broadcast::channel(64);
        let (notification_tx, _) = broadcast::channel(64);
        Self {
            persistent_grants: DashSet::new(),
            auto_approve_sessions: DashSet::new(),
            skip_all: AtomicBool::new(false),
            allow_list: allow_list.into_iter().collect(),
            pending: DashMap::new(),
            request_tx,
            notification_tx,
            active_slot: Arc::new(Mutex::new(())),
        }
    }

    pub fn subscribe_requests(&self) -> broadcast::Receiver<PermissionRequest> {
        self.request_tx.subscribe()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notification_tx.subscribe()
    }

    pub fn set_skip_all(&self, skip: bool) {
        self.skip_all.store(skip, Ordering::SeqCst);
    }

    pub fn set_auto_approve(&self, session: SessionId) {
        self.auto_approve_sessions.insert(session);
    }

    fn is_pre_approved(&self, session: &SessionId, tool_name: &str, action: Option<&str>) -> bool {
        if self.skip_all.load(Ordering::SeqCst) {
            return true;
        }
        if self.allow_list.contains(tool_name) {
            return true;
        }
        if let Some(action) = action {
            if self.allow_list.contains(&format!("{tool_name}:{action}")) {
                return true;
            }
        }
        if self.auto_approve_sessions.contains(session) {
            return true;
        }
        self.persistent_grants
            .contains(&(session.clone(), tool_name.to_string()))
    }

    /// Returns `true` if the invocation may proceed. Blocks on the
    /// response channel when a human decision is required.
    pub async fn request(&self, opts: RequestOptions) -> bool {
        if self.is_pre_approved(&opts.session_id, &opts.tool_name, opts.action.as_deref()) {
            let _ = self.notification_tx.send(Notification::Granted {
                request_id: String::new(),
            });
            return true;
        }

        let _guard = self.active_slot.lock().await;

        let id = uuid::Uuid::new_v4().to_string();
        let path = opts.path.map(|p| {
            if p.is_absolute() {
                p
            } else {
                std::env::current_dir().unwrap_or_default().join(p)
            }
        });

        let req = PermissionRequest {
            id: id.clone(),
            session_id: opts.session_id.clone(),
            tool_call_id: opts.tool_call_id,
            tool_name: opts.tool_name.clone(),
            action: opts.action.unwrap_or_default(),
            description: opts.description,
            params: opts.params,
            path: path.map(|p| p.to_string_lossy().to_string()),
            reason: opts.reason,
        };

        let (respond, recv) = oneshot::channel();
        self.pending.insert(id.clone(), PendingRequest { respond });

        if self.request_tx.send(req).is_err() {
            info!("no subscribers for permission request {id}");
        }

        let (decision, reason) = recv.await.unwrap_or((Decision::Deny, None));

        match decision {
            Decision::Grant => {
                let _ = self.notification_tx.send(Notification::Granted { request_id: id });
                true
            }
            Decision::GrantPersistent => {
                self.persistent_grants
                    .insert((opts.session_id, opts.tool_name));
                let _ = self.notification_tx.send(Notification::Granted { request_id: id });
                true
            }
            Decision::Deny => {
                let _ = self
                    .notification_tx
                    .send(Notification::Denied { request_id: id, reason });
                false
            }
        }
    }

    pub fn grant(&self, request_id: &str) {
        self.resolve(request_id, Decision::Grant, None);
    }

    pub fn grant_persistent(&self, request_id: &str) {
        self.resolve(request_id, Decision::GrantPersistent, None);
    }

    pub fn deny(&self, request_id: &str, reason: Option<String>) {
        self.resolve(request_id, Decision::Deny, reason);
    }

    fn resolve(&self, request_id: &str, decision: Decision, reason: Option<String>) {
        if let Some((_, pending)) = self.pending.remove(request_id) {
            let _ = pending.respond.send((decision, reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(session: &str, tool: &str) -> RequestOptions {
        RequestOptions {
            session_id: SessionId::from(session),
            tool_call_id: "c1".to_string(),
            tool_name: tool.to_string(),
            action: None,
            description: "desc".to_string(),
            params: serde_json::json!({}),
            path: None,
            reason: None,
        }
    }

    #[tokio::test]
    async fn allow_list_bypasses_dialog() {
        let svc = PermissionService::new(vec!["ls".to_string()]);
        assert!(svc.request(opts("s1", "ls")).await);
    }

    #[tokio::test]
    async fn grant_persistent_is_remembered() {
        let svc = Arc::new(PermissionService::new(vec![]));
        let mut requests = svc.subscribe_requests();

        let svc2 = svc.clone();
        let handle = tokio::spawn(async move { svc2.request(opts("s1", "bash")).await });

        let req = requests.recv().await.unwrap();
        svc.grant_persistent(&req.id);
        assert!(handle.await.unwrap());

        // Second request for the same (session, tool) should not block.
        assert!(svc.request(opts("s1", "bash")).await);
    }

    #[tokio::test]
    async fn deny_returns_false() {
        let svc = Arc::new(PermissionService::new(vec![]));
        let mut requests = svc.subscribe_requests();

        let svc2 = svc.clone();
        let handle = tokio::spawn(async move { svc2.request(opts("s1", "edit")).await });

        let req = requests.recv().await.unwrap();
        svc.deny(&req.id, Some("path outside workspace".to_string()));
        assert!(!handle.await.unwrap());
    }
}
