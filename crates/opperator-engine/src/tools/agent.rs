//! Spawn or address a managed sub-agent on a daemon. Issues a `command`
//! IPC request; a response carrying `{async_task: {...}}` metadata
//! is forwarded as-is so the engine's async-detection path can pick it up.

use super::{Tool, ToolContext, ToolOutcome};
use opperator_ipc::{IpcClient, Request};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const AGENT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AgentTool {
    client: Arc<IpcClient>,
    available_agents: Vec<String>,
}

impl AgentTool {
    pub fn new(client: Arc<IpcClient>, available_agents: Vec<String>) -> Self {
        Self { client, available_agents }
    }
}

#[async_trait::async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        "agent"
    }

    fn description(&self) -> &str {
        "Address a managed sub-agent: send it a command, which may run \
         synchronously or return an async task that completes later."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_name": {
                    "type": "string",
                    "description": "Name of the managed sub-agent",
                    "enum": self.available_agents
                },
                "command": { "type": "string", "description": "Command name to invoke" },
                "args": { "type": "object", "description": "Command arguments" }
            },
            "required": ["agent_name", "command"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolOutcome {
        let agent_name = match args.get("agent_name").and_then(|v| v.as_str()) {
            Some(a) => a,
            None => return ToolOutcome::error("Missing required parameter: agent_name"),
        };
        let command = match args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c,
            None => return ToolOutcome::error("Missing required parameter: command"),
        };
        let command_args = args.get("args").cloned().unwrap_or_else(|| json!({}));

        let request = Request::with_extra(
            "command",
            json!({
                "agent_name": agent_name,
                "command": command,
                "args": command_args,
                "session_id": ctx.session_id.as_str(),
                "call_id": ctx.call_id,
            }),
        );

        match self.client.request(&request, AGENT_COMMAND_TIMEOUT).await {
            Ok(response) => {
                if let Some(async_task) = response.get("async_task").or_else(|| response.get("task")) {
                    return ToolOutcome::Async {
                        content: response
                            .get("result")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        metadata: json!({ "async_task": async_task }),
                    };
                }
                let result = response
                    .get("result")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| response.to_string());
                ToolOutcome::text(result)
            }
            Err(e) => ToolOutcome::error(format!("agent command failed: {e}")),
        }
    }
}
