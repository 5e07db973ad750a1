pub mod async_tracker;
pub mod streaming;
pub mod tool_store;

pub use async_tracker::{AsyncTaskTracker, TrackerUpdate};
pub use streaming::StreamingManager;
pub use tool_store::ToolCallStore;
