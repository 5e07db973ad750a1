pub mod anthropic;
pub mod json_path;
pub mod provider;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use json_path::{JsonPathAggregator, ToolArgCollector, ToolArgEvent};
pub use provider::{LlmError, LlmProvider, LlmResult, LlmStream};
pub use types::*;
