//! Wire-neutral request/response shapes the engine drives a provider with.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<LlmMessage>,
    pub tools: Option<Vec<LlmTool>>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub system: Option<String>,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            model: "claude-3-7-sonnet-20250219".to_string(),
            messages: Vec::new(),
            tools: None,
            max_tokens: Some(8192),
            temperature: None,
            system: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: LlmContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LlmContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl From<String> for LlmContent {
    fn from(s: String) -> Self {
        LlmContent::Text(s)
    }
}

impl From<&str> for LlmContent {
    fn from(s: &str) -> Self {
        LlmContent::Text(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// One chunk of an in-flight phase. Text streams straight to the renderer;
/// tool-call chunks accumulate into `AccumulatedToolCall`s until `Done`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamDelta {
    Text(String),
    Thinking(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, arguments: String },
    ToolCallEnd { id: String },
    Done { stop_reason: Option<String>, usage: Option<Usage> },
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccumulatedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
    pub reason: Option<String>,
}

impl AccumulatedToolCall {
    pub fn parse_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        serde_json::from_str(&self.arguments)
    }
}

/// Heals orphaned `tool_use` blocks that have no matching `tool_result`
/// in the following message — Anthropic rejects such histories outright,
/// and a crash mid-turn can leave one behind.
pub fn validate_and_heal_messages(messages: &[LlmMessage]) -> Vec<LlmMessage> {
    let mut healed = Vec::with_capacity(messages.len());
    for (i, msg) in messages.iter().enumerate() {
        healed.push(msg.clone());
        if msg.role != "assistant" {
            continue;
        }
        let LlmContent::Blocks(blocks) = &msg.content else {
            continue;
        };
        let pending_ids: Vec<&str> = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        if pending_ids.is_empty() {
            continue;
        }
        let answered = messages
            .get(i + 1)
            .map(|next| match &next.content {
                LlmContent::Blocks(next_blocks) => next_blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
                _ => Vec::new(),
            })
            .unwrap_or_default();

        let orphaned: Vec<ContentBlock> = pending_ids
            .iter()
            .filter(|id| !answered.contains(id))
            .map(|id| ContentBlock::ToolResult {
                tool_use_id: id.to_string(),
                content: "[interrupted]".to_string(),
                is_error: Some(true),
            })
            .collect();

        if !orphaned.is_empty() {
            healed.push(LlmMessage {
                role: "user".to_string(),
                content: LlmContent::Blocks(orphaned),
            });
        }
    }
    healed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heals_orphaned_tool_use_with_no_following_result() {
        let messages = vec![LlmMessage {
            role: "assistant".to_string(),
            content: LlmContent::Blocks(vec![ContentBlock::ToolUse {
                id: "t1".to_string(),
                name: "ls".to_string(),
                input: serde_json::json!({}),
            }]),
        }];
        let healed = validate_and_heal_messages(&messages);
        assert_eq!(healed.len(), 2);
    }

    #[test]
    fn leaves_answered_tool_use_alone() {
        let messages = vec![
            LlmMessage {
                role: "assistant".to_string(),
                content: LlmContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "ls".to_string(),
                    input: serde_json::json!({}),
                }]),
            },
            LlmMessage {
                role: "user".to_string(),
                content: LlmContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "t1".to_string(),
                    content: "ok".to_string(),
                    is_error: None,
                }]),
            },
        ];
        assert_eq!(validate_and_heal_messages(&messages).len(), 2);
    }
}
