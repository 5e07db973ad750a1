//! Find-and-replace exact string matches in a file.

use super::{Tool, ToolContext, ToolOutcome};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::fs;

pub struct EditTool {
    workspace_root: PathBuf,
}

impl EditTool {
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
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing an exact string match. old_string must \
         appear exactly once unless replace_all is set."
    }

    fn prompt(&self) -> &str {
        "Always view a file before editing it. old_string must match exactly, \
         including whitespace and indentation."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string" },
                "old_string": { "type": "string" },
                "new_string": { "type": "string" },
                "replace_all": { "type": "boolean", "description": "default: false" }
            },
            "required": ["file_path", "old_string", "new_string"]
        })
    }

    fn permission_path(&self, args: &Value) -> Option<String> {
        args.get("file_path").and_then(|v| v.as_str()).map(String::from)
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> ToolOutcome {
        let path = match args.get("file_path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return ToolOutcome::error("Missing required parameter: file_path"),
        };
        let old_string = match args.get("old_string").and_then(|v| v.as_str()) {
            Some(s) => s,
            None => return ToolOutcome::error("Missing required parameter: old_string"),
        };
        let new_string = args.get("new_string").and_then(|v| v.as_str()).unwrap_or("");
        let replace_all = args.get("replace_all").and_then(|v| v.as_bool()).unwrap_or(false);

        let full_path = self.resolve(path);
        let contents = match fs::read_to_string(&full_path).await {
            Ok(c) => c,
            Err(e) => return ToolOutcome::error(format!("Failed to read {path}: {e}")),
        };

        let occurrences = contents.matches(old_string).count();
        if occurrences == 0 {
            return ToolOutcome::error(format!("old_string not found in {path}"));
        }
        if occurrences > 1 && !replace_all {
            return ToolOutcome::error(format!(
                "old_string matches {occurrences} times in {path}; set replace_all or narrow the match"
            ));
        }

        let updated = if replace_all {
            contents.replace(old_string, new_string)
        } else {
            contents.replacen(old_string, new_string, 1)
        };

        match fs::write(&full_path, &updated).await {
            Ok(()) => ToolOutcome::text(format!("Replaced {occurrences} occurrence(s) in {path}")),
            Err(e) => ToolOutcome::error(format!("Failed to write {path}: {e}")),
        }
    }
}
