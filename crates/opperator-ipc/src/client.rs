//! One connection per daemon: framed JSON request/response plus
//! authenticated streaming subscriptions.

use crate::conn::{connect, Address, Conn};
use opperator_core::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Per-call timeout policy. The default covers ordinary requests; callers
/// override it for the heavier operations (bootstrap, package transfer,
/// stop, delete).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(60);
pub const PACKAGE_TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);
pub const STOP_TIMEOUT: Duration = Duration::from_secs(15);
pub const DELETE_TIMEOUT: Duration = Duration::from_secs(30);

/// Accept up to 1 MiB per line to tolerate large log payloads.
const MAX_LINE_BYTES: usize = 1024 * 1024;

pub struct IpcClient {
    daemon_name: String,
    address: Address,
    auth_token: Option<String>,
}

/// A request envelope; `extra` carries the request-type-specific fields
/// (`agent_name`, `command`, `args`, `tool_name`, …).
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub request_type: String,
    #[serde(flatten)]
    pub extra: Value,
}

impl Request {
    pub fn new(request_type: impl Into<String>) -> Self {
        Self {
            request_type: request_type.into(),
            extra: Value::Object(Default::default()),
        }
    }

    pub fn with_extra(request_type: impl Into<String>, extra: Value) -> Self {
        Self {
            request_type: request_type.into(),
            extra,
        }
    }
}

/// Cleanup hook releasing the underlying subscription connection.
pub struct Subscription {
    pub events: mpsc::Receiver<Result<Value>>,
    close_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Subscription {
    pub fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl IpcClient {
    pub fn new(daemon_name: impl Into<String>, address: &str, auth_token: Option<String>) -> Result<Self> {
        Ok(Self {
            daemon_name: daemon_name.into(),
            address: Address::parse(address)?,
            auth_token,
        })
    }

    pub fn daemon_name(&self) -> &str {
        &self.daemon_name
    }

    /// Encode, write with a write deadline, read one line with a read
    /// deadline, decode as the response.
    pub async fn request(&self, req: &Request, deadline: Duration) -> Result<Value> {
        let conn = connect(&self.address, self.auth_token.as_deref()).await?;
        let mut reader = BufReader::new(conn);

        let line = serde_json::to_string(req)? + "\n";
        timeout(deadline, reader.get_mut().write_all(line.as_bytes()))
            .await
            .map_err(|_| Error::WriteTimeout(deadline))?
            .map_err(Error::Io)?;

        let raw = timeout(deadline, read_bounded_line(&mut reader))
            .await
            .map_err(|_| Error::ReadTimeout(deadline))??;

        let value: Value = serde_json::from_str(&raw)?;
        check_success(&value)?;
        Ok(value)
    }

    /// Open a stream subscription: send the request, read the ack line,
    /// then spawn a reader task forwarding subsequent lines as events until
    /// the server closes or the caller drops/closes the subscription.
    pub async fn subscribe(&self, req: &Request, ack_deadline: Duration) -> Result<Subscription> {
        let conn = connect(&self.address, self.auth_token.as_deref()).await?;
        let mut reader = BufReader::new(conn);

        let line = serde_json::to_string(req)? + "\n";
        timeout(ack_deadline, reader.get_mut().write_all(line.as_bytes()))
            .await
            .map_err(|_| Error::WriteTimeout(ack_deadline))?
            .map_err(Error::Io)?;

        let ack_raw = timeout(ack_deadline, read_bounded_line(&mut reader))
            .await
            .map_err(|_| Error::ReadTimeout(ack_deadline))??;
        let ack: Value = serde_json::from_str(&ack_raw)?;
        check_success(&ack)?;

        let (tx, rx) = mpsc::channel(256);
        let (close_tx, mut close_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut close_rx => break,
                    line = read_bounded_line(&mut reader) => {
                        match line {
                            Ok(raw) => {
                                match serde_json::from_str::<Value>(&raw) {
                                    Ok(v) => {
                                        if tx.send(Ok(v)).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => continue, // malformed lines dropped silently
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Subscription {
            events: rx,
            close_tx: Some(close_tx),
        })
    }
}

fn check_success(v: &Value) -> Result<()> {
    if let Some(success) = v.get("success").and_then(|s| s.as_bool()) {
        if !success {
            let msg = v
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown protocol error")
                .to_string();
            return Err(Error::protocol(msg));
        }
    }
    Ok(())
}

async fn read_bounded_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await.map_err(Error::Io)?;
        if n == 0 {
            if buf.is_empty() {
                return Err(Error::ConnectFailed("connection closed".to_string()));
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > MAX_LINE_BYTES {
            return Err(Error::MalformedFrame("line exceeds 1 MiB".to_string()));
        }
    }
    String::from_utf8(buf).map_err(|e| Error::MalformedFrame(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_success_passes_through_true() {
        assert!(check_success(&serde_json::json!({"success": true})).is_ok());
    }

    #[test]
    fn check_success_surfaces_error_text_verbatim() {
        let err = check_success(&serde_json::json!({"success": false, "error": "boom"}))
            .unwrap_err();
        assert_eq!(err.to_string(), "daemon reported failure: boom");
    }

    #[test]
    fn check_success_tolerates_missing_field() {
        assert!(check_success(&serde_json::json!({"ok": true})).is_ok());
    }
}
