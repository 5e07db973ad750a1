//! Built-in tool trait and registry. Each tool is a self-contained unit;
//! agent-command tools exposed by a focused managed agent are registered
//! dynamically by the adapter and are not part of this module.

pub mod agent;
pub mod bash;
pub mod edit;
pub mod ls;
pub mod multi_edit;
pub mod view;
pub mod write;

use opperator_llm::LlmTool;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The raw outcome of running a tool, before it is turned into a
/// `ToolResult` and metadata is inspected for an async marker.
#[derive(Clone, Debug)]
pub enum ToolOutcome {
    Text(String),
    Json(Value),
    Error(String),
    /// The tool submitted work to a daemon and returned tracking metadata
    /// instead of a final result.
    Async { content: String, metadata: Value },
}

impl ToolOutcome {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Self::Error(s.into())
    }

    pub fn to_content_string(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Json(v) => serde_json::to_string_pretty(v).unwrap_or_default(),
            Self::Error(e) => e.clone(),
            Self::Async { content, .. } => content.clone(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn metadata(&self) -> Option<&Value> {
        match self {
            Self::Async { metadata, .. } => Some(metadata),
            _ => None,
        }
    }
}

/// Context threaded through tool execution: which session/call this run
/// belongs to, and who is driving it.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub session_id: opperator_core::SessionId,
    pub call_id: String,
    pub active_agent: Option<String>,
    pub core_agent: String,
}

#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn prompt(&self) -> &str {
        ""
    }
    fn input_schema(&self) -> Value;
    fn is_read_only(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolOutcome;

    /// Execute with cancellation support. Default: race `execute` against
    /// cancellation. Tools owning a child process override this to kill it.
    async fn execute_cancellable(
        &self,
        ctx: &ToolContext,
        args: Value,
        cancel: CancellationToken,
    ) -> ToolOutcome {
        tokio::select! {
            result = self.execute(ctx, args) => result,
            _ = cancel.cancelled() => ToolOutcome::text("[cancelled]"),
        }
    }

    /// The path this invocation would touch, if any — used by permission
    /// arbitration to derive the request path.
    fn permission_path(&self, _args: &Value) -> Option<String> {
        None
    }

    fn to_llm_tool(&self) -> LlmTool {
        LlmTool {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    /// Register an externally-sourced tool (agent-command exposure).
    pub fn register_dynamic(&mut self, name: String, tool: Arc<dyn Tool>) {
        self.tools.insert(name, tool);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub async fn execute_cancellable(
        &self,
        name: &str,
        ctx: &ToolContext,
        args: Value,
        cancel: CancellationToken,
    ) -> ToolOutcome {
        match self.tools.get(name) {
            Some(tool) => tool.execute_cancellable(ctx, args, cancel).await,
            None => ToolOutcome::Error(format!("unknown tool: {name}")),
        }
    }

    /// Excludes "agent": the adapter folds its spec back in only for the
    /// core agent that is allowed to address other agents.
    pub fn get_definitions(&self) -> Vec<LlmTool> {
        self.tools
            .values()
            .filter(|t| t.name() != "agent")
            .map(|t| t.to_llm_tool())
            .collect()
    }

    pub fn combined_prompts(&self) -> String {
        self.tools
            .values()
            .map(|t| t.prompt())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}
