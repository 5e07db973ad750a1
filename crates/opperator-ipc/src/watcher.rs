//! Multi-daemon fan-out watcher: one subscription per
//! enabled daemon, merged into a single ordered channel tagged by daemon
//! name. Unreachable non-local daemons are auto-disabled at startup; live
//! subscriptions that drop are retried with a 2 s backoff.

use crate::client::{IpcClient, Request};
use crate::registry::DaemonRegistry;
use opperator_core::Daemon;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PROBE_DEADLINE: Duration = Duration::from_secs(2);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum DaemonEventKind {
    Status(Value),
    Metadata(Value),
    LogsBulk(Vec<Value>),
    LogAppend(Value),
    Sections(Value),
    Commands(Value),
    /// Synthetic: a daemon's health changed (probe failure, reconnect loss).
    Health { status: String },
}

#[derive(Debug, Clone)]
pub struct DaemonEvent {
    pub daemon: String,
    pub kind: DaemonEventKind,
}

/// Parse a raw event object into a recognized kind. Unknown or malformed
/// shapes return `None` and are dropped silently by the caller.
fn parse_event(raw: &Value) -> Option<DaemonEventKind> {
    let kind = raw.get("type").and_then(|v| v.as_str())?;
    match kind {
        "status" => Some(DaemonEventKind::Status(raw.get("data")?.clone())),
        "metadata" => Some(DaemonEventKind::Metadata(raw.get("data")?.clone())),
        "logs" => {
            if let Some(arr) = raw.get("entries").and_then(|v| v.as_array()) {
                Some(DaemonEventKind::LogsBulk(arr.clone()))
            } else {
                Some(DaemonEventKind::LogAppend(raw.get("entry")?.clone()))
            }
        }
        "sections" => Some(DaemonEventKind::Sections(raw.get("data")?.clone())),
        "commands" => Some(DaemonEventKind::Commands(raw.get("data")?.clone())),
        _ => None,
    }
}

pub struct MultiDaemonWatcher {
    registry: Arc<DaemonRegistry>,
    cancel: CancellationToken,
}

impl MultiDaemonWatcher {
    pub fn new(registry: Arc<DaemonRegistry>, cancel: CancellationToken) -> Self {
        Self { registry, cancel }
    }

    /// Starts watching every enabled daemon; returns the merged event
    /// receiver. Each daemon's reader runs as its own task.
    pub async fn start(&self) -> mpsc::Receiver<DaemonEvent> {
        let (tx, rx) = mpsc::channel(1024);
        let daemons = self.registry.load().unwrap_or_default();

        for daemon in daemons {
            if !daemon.enabled {
                continue;
            }
            let tx = tx.clone();
            let registry = self.registry.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                watch_daemon(daemon, registry, tx, cancel).await;
            });
        }

        rx
    }
}

async fn watch_daemon(
    daemon: Daemon,
    registry: Arc<DaemonRegistry>,
    tx: mpsc::Sender<DaemonEvent>,
    cancel: CancellationToken,
) {
    let name = daemon.name.clone();

    if !daemon.is_local() {
        let client = match IpcClient::new(name.as_str(), &daemon.address, daemon.auth_token.clone()) {
            Ok(c) => c,
            Err(e) => {
                warn!(daemon = %name, error = %e, "invalid daemon address");
                disable_and_emit(&name, &registry, &tx).await;
                return;
            }
        };
        let probe = client
            .subscribe(&Request::new("watch_agent_state"), PROBE_DEADLINE)
            .await;
        if probe.is_err() {
            warn!(daemon = %name, "health probe failed, disabling daemon");
            disable_and_emit(&name, &registry, &tx).await;
            return;
        }
        // Probe succeeded; the probe connection is dropped here and a
        // fresh one opens the real subscription below.
    }

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let client = match IpcClient::new(name.as_str(), &daemon.address, daemon.auth_token.clone()) {
            Ok(c) => c,
            Err(_) => return,
        };
        match client
            .subscribe(&Request::new("watch_agent_state"), PROBE_DEADLINE)
            .await
        {
            Ok(mut sub) => {
                info!(daemon = %name, "subscription established");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            sub.close();
                            return;
                        }
                        event = sub.events.recv() => {
                            match event {
                                Some(Ok(raw)) => {
                                    if let Some(kind) = parse_event(&raw) {
                                        if tx.send(DaemonEvent { daemon: name.clone(), kind }).await.is_err() {
                                            return;
                                        }
                                    } else {
                                        debug!(daemon = %name, "dropped unrecognized event");
                                    }
                                }
                                Some(Err(e)) => {
                                    warn!(daemon = %name, error = %e, "stream error, reconnecting");
                                    let _ = tx.send(DaemonEvent {
                                        daemon: name.clone(),
                                        kind: DaemonEventKind::Health { status: "reconnecting".to_string() },
                                    }).await;
                                    break;
                                }
                                None => {
                                    warn!(daemon = %name, "stream closed, reconnecting");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(_) => {
                let _ = tx.send(DaemonEvent {
                    daemon: name.clone(),
                    kind: DaemonEventKind::Health { status: "reconnecting".to_string() },
                }).await;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
        }
    }
}

async fn disable_and_emit(name: &str, registry: &DaemonRegistry, tx: &mpsc::Sender<DaemonEvent>) {
    let _ = registry.set_enabled(name, false).await;
    let _ = tx
        .send(DaemonEvent {
            daemon: name.to_string(),
            kind: DaemonEventKind::Health {
                status: "disabled".to_string(),
            },
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_event() {
        let raw = serde_json::json!({"type": "status", "data": {"running": true}});
        assert!(matches!(parse_event(&raw), Some(DaemonEventKind::Status(_))));
    }

    #[test]
    fn parses_bulk_vs_single_logs() {
        let bulk = serde_json::json!({"type": "logs", "entries": [{"line": "a"}]});
        assert!(matches!(parse_event(&bulk), Some(DaemonEventKind::LogsBulk(_))));

        let single = serde_json::json!({"type": "logs", "entry": {"line": "a"}});
        assert!(matches!(parse_event(&single), Some(DaemonEventKind::LogAppend(_))));
    }

    #[test]
    fn unrecognized_kind_is_dropped() {
        assert!(parse_event(&serde_json::json!({"type": "unknown"})).is_none());
    }

    #[tokio::test]
    async fn failed_health_probe_disables_a_non_local_daemon_without_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemons.json");
        std::fs::write(
            &path,
            serde_json::to_string(&[Daemon {
                name: "remote".to_string(),
                address: "tcp://127.0.0.1:1".to_string(),
                auth_token: None,
                enabled: true,
            }])
            .unwrap(),
        )
        .unwrap();
        let registry = Arc::new(DaemonRegistry::new(&path));

        let daemon = registry
            .load()
            .unwrap()
            .into_iter()
            .find(|d| d.name == "remote")
            .unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            watch_daemon(daemon, registry.clone(), tx, cancel),
        )
        .await;
        assert!(outcome.is_ok(), "a failed probe must return promptly, not fall into the reconnect loop");

        match rx.recv().await {
            Some(DaemonEvent { daemon, kind: DaemonEventKind::Health { status } }) => {
                assert_eq!(daemon, "remote");
                assert_eq!(status, "disabled");
            }
            other => panic!("expected a disabled health event, got {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "no reconnect attempt should follow a probe failure");

        let daemons = registry.load().unwrap();
        assert!(!daemons.iter().find(|d| d.name == "remote").unwrap().enabled);
    }
}
