//! Read a file's contents, optionally windowed by line range.

use super::{Tool, ToolContext, ToolOutcome};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::fs;

pub struct ViewTool {
    workspace_root: PathBuf,
}

impl ViewTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.workspace_root.join(path)
        }
    }
}

#[async_trait::async_trait]
impl Tool for ViewTool {
    fn name(&self) -> &str {
        "view"
    }

    fn description(&self) -> &str {
        "Read a file's contents. Optionally restrict to a line range via \
         offset and limit."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string", "description": "Path to the file to read" },
                "offset": { "type": "integer", "description": "1-indexed line to start from" },
                "limit": { "type": "integer", "description": "Maximum number of lines to return" }
            },
            "required": ["file_path"]
        })
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn permission_path(&self, args: &Value) -> Option<String> {
        args.get("file_path").and_then(|v| v.as_str()).map(String::from)
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> ToolOutcome {
        let path = match args.get("file_path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return ToolOutcome::error("Missing required parameter: file_path"),
        };

        let contents = match fs::read_to_string(self.resolve(path)).await {
            Ok(c) => c,
            Err(e) => return ToolOutcome::error(format!("Failed to read {path}: {e}")),
        };

        let offset = args.get("offset").and_then(|v| v.as_u64()).unwrap_or(1).max(1) as usize;
        let limit = args.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);

        let lines: Vec<&str> = contents.lines().collect();
        let start = offset.saturating_sub(1).min(lines.len());
        let end = match limit {
            Some(n) => (start + n).min(lines.len()),
            None => lines.len(),
        };

        let windowed: String = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>6}\t{}", start + i + 1, line))
            .collect::<Vec<_>>()
            .join("\n");

        ToolOutcome::text(windowed)
    }
}
