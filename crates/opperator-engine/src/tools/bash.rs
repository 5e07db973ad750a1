//! Execute shell commands with timeout, output capture, and cancellation.

use super::{Tool, ToolContext, ToolOutcome};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct BashTool {
    workspace_root: PathBuf,
    default_timeout_secs: u64,
}

impl BashTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
            default_timeout_secs: 120,
        }
    }
}

#[async_trait::async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a bash command in the workspace. Captures stdout and stderr. \
         Set timeout in seconds (default 120, max 600)."
    }

    fn prompt(&self) -> &str {
        "Quote paths with spaces. Prefer view/ls/edit/write over bash equivalents."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The bash command to execute" },
                "timeout": { "type": "integer", "description": "Timeout in seconds (default 120, max 600)" },
                "description": { "type": "string", "description": "Short description of what this command does" }
            },
            "required": ["command"]
        })
    }

    fn permission_path(&self, _args: &Value) -> Option<String> {
        Some(self.workspace_root.to_string_lossy().to_string())
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolOutcome {
        self.execute_cancellable(ctx, args, CancellationToken::new()).await
    }

    async fn execute_cancellable(
        &self,
        _ctx: &ToolContext,
        args: Value,
        cancel: CancellationToken,
    ) -> ToolOutcome {
        let command = match args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c,
            None => return ToolOutcome::error("Missing required parameter: command"),
        };
        let timeout_secs = args
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.default_timeout_secs)
            .min(600);

        if let Some(desc) = args.get("description").and_then(|v| v.as_str()) {
            debug!("bash [{}]: {}", desc, command);
        } else {
            debug!("bash: {}", &command[..command.len().min(80)]);
        }

        let mut child = match Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace_root)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return ToolOutcome::error(format!("Failed to spawn: {e}")),
        };

        let timeout_duration = std::time::Duration::from_secs(timeout_secs);

        tokio::select! {
            result = tokio::time::timeout(timeout_duration, child.wait()) => {
                match result {
                    Ok(Ok(status)) => {
                        let stdout = read_pipe(child.stdout.take()).await;
                        let stderr = read_pipe(child.stderr.take()).await;
                        format_output(status, &stdout, &stderr)
                    }
                    Ok(Err(e)) => ToolOutcome::error(format!("Failed to wait: {e}")),
                    Err(_) => {
                        let _ = child.kill().await;
                        ToolOutcome::error(format!("Command timed out after {timeout_secs}s"))
                    }
                }
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                ToolOutcome::text("[process killed by interrupt]")
            }
        }
    }
}

async fn read_pipe(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    use tokio::io::AsyncReadExt;
    match pipe {
        Some(mut p) => {
            let mut buf = Vec::new();
            let _ = p.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).to_string()
        }
        None => String::new(),
    }
}

fn format_output(status: std::process::ExitStatus, stdout: &str, stderr: &str) -> ToolOutcome {
    let stdout = stdout.trim();
    let stderr = stderr.trim();

    let result = if status.success() {
        if stderr.is_empty() {
            stdout.to_string()
        } else {
            format!("{stdout}\n{stderr}")
        }
    } else {
        format!("Exit code: {}\n{stdout}\n{stderr}", status.code().unwrap_or(-1))
    };

    if result.is_empty() {
        ToolOutcome::text("(no output)")
    } else if result.len() > 30000 {
        ToolOutcome::text(format!("{}\n... [truncated, {} total chars]", &result[..30000], result.len()))
    } else {
        ToolOutcome::text(result)
    }
}
