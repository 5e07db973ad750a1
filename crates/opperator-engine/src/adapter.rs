//! Session Adapter: bridges Session History and
//! active-agent context into the exact request shape the LLM Engine needs,
//! and records the engine's output back through History and the Tool-Call
//! Store. Owns the session id so the engine never touches the UI layer
//! directly.

use opperator_core::{ContentPart, Result, Role, SessionId};
use opperator_history::SessionHistory;
use opperator_llm::{ContentBlock, LlmContent, LlmMessage, LlmTool};
use std::sync::Arc;

/// Which core assistant is driving this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreAgent {
    Opperator,
    Builder,
}

/// A managed sub-agent's context as seen by the adapter. `running = false`
/// with `spec`/`todo` present models a stopped agent Builder is focused on.
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    pub name: String,
    pub system_prompt: String,
    /// If true, this prompt replaces the base core prompt rather than
    /// appending to it.
    pub prompt_replace: bool,
    pub running: bool,
    pub spec: Option<String>,
    pub todo: Option<String>,
    pub runtime_tools: Vec<LlmTool>,
    pub commands: Vec<LlmTool>,
}

pub struct SessionAdapter {
    history: Arc<SessionHistory>,
    session: SessionId,
    core: CoreAgent,
    core_prompt: String,
    available_agents: Vec<String>,
    focused: Option<AgentContext>,
}

impl SessionAdapter {
    pub fn new(history: Arc<SessionHistory>, session: SessionId, core: CoreAgent, core_prompt: String) -> Self {
        Self {
            history,
            session,
            core,
            core_prompt,
            available_agents: Vec::new(),
            focused: None,
        }
    }

    pub fn set_available_agents(&mut self, agents: Vec<String>) {
        self.available_agents = agents;
    }

    pub fn set_focused(&mut self, agent: Option<AgentContext>) {
        self.focused = agent;
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    /// Base core prompt + managed sub-agent prompt (append or replace) +
    /// sub-agent enumeration (Opperator only) + focused-agent tools/spec +
    /// a Builder-mode response-format reminder.
    pub fn build_instructions(&self) -> String {
        let mut sections = Vec::new();

        match (&self.focused, self.core) {
            (Some(agent), _) if agent.prompt_replace => {
                sections.push(agent.system_prompt.clone());
            }
            (Some(agent), _) => {
                sections.push(self.core_prompt.clone());
                sections.push(agent.system_prompt.clone());
            }
            (None, _) => sections.push(self.core_prompt.clone()),
        }

        if self.core == CoreAgent::Opperator && !self.available_agents.is_empty() {
            sections.push(format!(
                "Available sub-agents: {}",
                self.available_agents.join(", ")
            ));
        }

        if self.core == CoreAgent::Builder {
            if let Some(agent) = &self.focused {
                if !agent.running {
                    if let Some(spec) = &agent.spec {
                        sections.push(format!("Agent specification:\n{spec}"));
                    }
                    if let Some(todo) = &agent.todo {
                        sections.push(format!("Outstanding todo:\n{todo}"));
                    }
                }
            }
            sections.push(
                "Respond with plain text for conversation; use tool calls for actions."
                    .to_string(),
            );
        }

        sections.join("\n\n")
    }

    /// Map persisted Messages to the wire format the provider expects.
    pub fn build_conversation(&self) -> Result<Vec<LlmMessage>> {
        let messages = self.history.load(&self.session)?;
        let mut wire = Vec::new();

        for message in messages {
            for part in message.parts {
                match part {
                    ContentPart::Text { text } => {
                        wire.push(LlmMessage {
                            role: role_wire(message.role),
                            content: LlmContent::Text(text),
                        });
                    }
                    ContentPart::ToolCallBatch { calls } => {
                        let blocks: Vec<ContentBlock> = calls
                            .into_iter()
                            .map(|c| ContentBlock::ToolUse {
                                id: c.id,
                                name: c.name,
                                input: serde_json::from_str(&c.input).unwrap_or_default(),
                            })
                            .collect();
                        wire.push(LlmMessage {
                            role: "assistant".to_string(),
                            content: LlmContent::Blocks(blocks),
                        });
                    }
                    ContentPart::ToolResultBatch { results } => {
                        let blocks: Vec<ContentBlock> = results
                            .into_iter()
                            .map(|r| ContentBlock::ToolResult {
                                tool_use_id: r.tool_call_id,
                                content: r.content,
                                is_error: Some(r.is_error),
                            })
                            .collect();
                        wire.push(LlmMessage {
                            role: "user".to_string(),
                            content: LlmContent::Blocks(blocks),
                        });
                    }
                    ContentPart::TurnSummary(_) | ContentPart::SystemMarker { .. } => {}
                }
            }
        }

        Ok(wire)
    }

    /// Base tool specs + focused-agent command extras + an "agent" spec
    /// enumerating alternative sub-agents (Opperator only).
    pub fn tool_specs(&self, base: Vec<LlmTool>, agent_tool: Option<LlmTool>) -> Vec<LlmTool> {
        let mut specs = base;
        if let Some(agent) = &self.focused {
            specs.extend(agent.commands.clone());
            if agent.running {
                specs.extend(agent.runtime_tools.clone());
            }
        }
        if self.core == CoreAgent::Opperator {
            if let Some(tool) = agent_tool {
                specs.push(tool);
            }
        }
        specs
    }

    pub fn record_user(&self, text: &str) -> Result<()> {
        self.history.append_user(&self.session, text)
    }

    pub fn record_assistant_tool_calls(
        &self,
        calls: Vec<opperator_core::ToolCall>,
        preceding_content: Option<&str>,
    ) -> Result<()> {
        self.history
            .append_assistant_tool_calls(&self.session, calls, preceding_content)
    }

    pub fn record_assistant_content(&self, text: &str) -> Result<()> {
        self.history.append_assistant_content(&self.session, text)
    }

    pub fn record_tool_results(&self, results: Vec<opperator_core::ToolResult>) -> Result<()> {
        self.history.append_tool_results(&self.session, results)
    }

    pub fn record_turn_summary(&self, agent_id: &str, agent_name: &str, color: &str, duration_ms: u64) -> Result<()> {
        self.history
            .append_turn_summary(&self.session, agent_id, agent_name, color, duration_ms)
    }
}

fn role_wire(role: Role) -> String {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::ToolCall => "assistant",
        Role::ToolCallResponse => "user",
        Role::System => "system",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opperator_history::store::Store;

    fn adapter(core: CoreAgent) -> SessionAdapter {
        let history = Arc::new(SessionHistory::new(Arc::new(Store::open_in_memory().unwrap())));
        SessionAdapter::new(history, SessionId::from("s1"), core, "base prompt".to_string())
    }

    fn llm_tool(name: &str) -> LlmTool {
        LlmTool {
            name: name.to_string(),
            description: String::new(),
            input_schema: serde_json::json!({}),
        }
    }

    fn agent_context(running: bool) -> AgentContext {
        AgentContext {
            name: "builder-agent".to_string(),
            system_prompt: "agent prompt".to_string(),
            prompt_replace: false,
            running,
            spec: Some("do the thing".to_string()),
            todo: Some("step 1".to_string()),
            runtime_tools: vec![llm_tool("runtime_only")],
            commands: vec![llm_tool("command_extra")],
        }
    }

    #[test]
    fn opperator_lists_available_sub_agents() {
        let mut adapter = adapter(CoreAgent::Opperator);
        adapter.set_available_agents(vec!["researcher".to_string(), "writer".to_string()]);
        let instructions = adapter.build_instructions();
        assert!(instructions.contains("base prompt"));
        assert!(instructions.contains("researcher, writer"));
    }

    #[test]
    fn builder_appends_focused_agent_prompt_by_default() {
        let mut adapter = adapter(CoreAgent::Builder);
        adapter.set_focused(Some(agent_context(true)));
        let instructions = adapter.build_instructions();
        assert!(instructions.contains("base prompt"));
        assert!(instructions.contains("agent prompt"));
    }

    #[test]
    fn prompt_replace_drops_the_base_core_prompt() {
        let mut adapter = adapter(CoreAgent::Builder);
        let mut ctx = agent_context(true);
        ctx.prompt_replace = true;
        adapter.set_focused(Some(ctx));
        let instructions = adapter.build_instructions();
        assert!(!instructions.contains("base prompt"));
        assert!(instructions.contains("agent prompt"));
    }

    #[test]
    fn builder_injects_spec_and_todo_only_while_stopped() {
        let mut stopped = adapter(CoreAgent::Builder);
        stopped.set_focused(Some(agent_context(false)));
        let instructions = stopped.build_instructions();
        assert!(instructions.contains("do the thing"));
        assert!(instructions.contains("step 1"));

        let mut running = adapter(CoreAgent::Builder);
        running.set_focused(Some(agent_context(true)));
        let running_instructions = running.build_instructions();
        assert!(!running_instructions.contains("do the thing"));
    }

    #[test]
    fn tool_specs_add_runtime_tools_only_while_running() {
        let mut stopped = adapter(CoreAgent::Builder);
        stopped.set_focused(Some(agent_context(false)));
        let stopped_names: Vec<String> = stopped
            .tool_specs(Vec::new(), None)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert!(stopped_names.contains(&"command_extra".to_string()));
        assert!(!stopped_names.contains(&"runtime_only".to_string()));

        let mut running = adapter(CoreAgent::Builder);
        running.set_focused(Some(agent_context(true)));
        let running_names: Vec<String> = running
            .tool_specs(Vec::new(), None)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert!(running_names.contains(&"runtime_only".to_string()));
    }

    #[test]
    fn only_opperator_gets_the_agent_tool_spec() {
        let opperator = adapter(CoreAgent::Opperator);
        let specs = opperator.tool_specs(Vec::new(), Some(llm_tool("agent")));
        assert!(specs.iter().any(|t| t.name == "agent"));

        let builder = adapter(CoreAgent::Builder);
        let specs = builder.tool_specs(Vec::new(), Some(llm_tool("agent")));
        assert!(!specs.iter().any(|t| t.name == "agent"));
    }

    #[test]
    fn record_user_then_build_conversation_round_trips() {
        let adapter = adapter(CoreAgent::Opperator);
        adapter.record_user("hello").unwrap();
        let conversation = adapter.build_conversation().unwrap();
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation[0].role, "user");
    }
}
