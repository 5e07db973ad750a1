//! Apply a sequence of exact string edits to a file atomically — all edits
//! are validated against an in-memory copy before anything is written.

use super::{Tool, ToolContext, ToolOutcome};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::fs;

pub struct MultiEditTool {
    workspace_root: PathBuf,
}

impl MultiEditTool {
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

struct Edit {
    old_string: String,
    new_string: String,
    replace_all: bool,
}

#[async_trait::async_trait]
impl Tool for MultiEditTool {
    fn name(&self) -> &str {
        "multi_edit"
    }

    fn description(&self) -> &str {
        "Apply multiple find-and-replace edits to one file in sequence. \
         All edits must succeed or none are applied."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string" },
                "edits": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "old_string": { "type": "string" },
                            "new_string": { "type": "string" },
                            "replace_all": { "type": "boolean" }
                        },
                        "required": ["old_string", "new_string"]
                    }
                }
            },
            "required": ["file_path", "edits"]
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
        let edits_value = match args.get("edits").and_then(|v| v.as_array()) {
            Some(e) if !e.is_empty() => e,
            _ => return ToolOutcome::error("Missing or empty required parameter: edits"),
        };

        let edits: Vec<Edit> = match edits_value
            .iter()
            .map(|e| {
                let old_string = e.get("old_string").and_then(|v| v.as_str())?.to_string();
                let new_string = e.get("new_string").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let replace_all = e.get("replace_all").and_then(|v| v.as_bool()).unwrap_or(false);
                Some(Edit { old_string, new_string, replace_all })
            })
            .collect::<Option<Vec<_>>>()
        {
            Some(edits) => edits,
            None => return ToolOutcome::error("Each edit requires old_string"),
        };

        let full_path = self.resolve(path);
        let mut contents = match fs::read_to_string(&full_path).await {
            Ok(c) => c,
            Err(e) => return ToolOutcome::error(format!("Failed to read {path}: {e}")),
        };

        for (i, edit) in edits.iter().enumerate() {
            let occurrences = contents.matches(edit.old_string.as_str()).count();
            if occurrences == 0 {
                return ToolOutcome::error(format!("edit {i}: old_string not found"));
            }
            if occurrences > 1 && !edit.replace_all {
                return ToolOutcome::error(format!(
                    "edit {i}: old_string matches {occurrences} times; set replace_all or narrow the match"
                ));
            }
            contents = if edit.replace_all {
                contents.replace(&edit.old_string, &edit.new_string)
            } else {
                contents.replacen(&edit.old_string, &edit.new_string, 1)
            };
        }

        match fs::write(&full_path, &contents).await {
            Ok(()) => ToolOutcome::text(format!("Applied {} edit(s) to {path}", edits.len())),
            Err(e) => ToolOutcome::error(format!("Failed to write {path}: {e}")),
        }
    }
}
