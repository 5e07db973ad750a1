pub mod adapter;
pub mod engine;
pub mod tools;

pub use adapter::{AgentContext, CoreAgent, SessionAdapter};
pub use engine::{apply_progress_update, apply_terminal_update, mark_cancelled_if_terminal, EngineEvent, LlmEngine};
pub use tools::{Tool, ToolContext, ToolOutcome, ToolRegistry};
