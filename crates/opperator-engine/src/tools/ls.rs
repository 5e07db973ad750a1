//! List directory contents, one entry per line.

use super::{Tool, ToolContext, ToolOutcome};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

pub struct LsTool {
    workspace_root: PathBuf,
}

impl LsTool {
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
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List files and directories at a path. Returns one entry per line, \
         directories suffixed with /."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default: workspace root)" }
            }
        })
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn permission_path(&self, args: &Value) -> Option<String> {
        args.get("path").and_then(|v| v.as_str()).map(String::from)
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> ToolOutcome {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let full_path = self.resolve(path);

        let mut entries = match tokio::fs::read_dir(&full_path).await {
            Ok(rd) => rd,
            Err(e) => return ToolOutcome::error(format!("Failed to list {path}: {e}")),
        };

        let mut names = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                    let name = entry.file_name().to_string_lossy().to_string();
                    names.push(if is_dir { format!("{name}/") } else { name });
                }
                Ok(None) => break,
                Err(e) => return ToolOutcome::error(format!("Failed to read entry: {e}")),
            }
        }

        names.sort();
        if names.is_empty() {
            ToolOutcome::text("(empty directory)")
        } else {
            ToolOutcome::text(names.join("\n"))
        }
    }
}
