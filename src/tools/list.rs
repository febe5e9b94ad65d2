//! Directory listing within the workspace.

use super::{validate_required, Tool, ToolContext, ToolError};
use crate::path_guard::PathGuard;
use async_trait::async_trait;
use std::sync::Arc;

/// Per-request hard cap on listed entries; the result carries a truncation
/// marker when hit.
const MAX_ENTRIES: usize = 1000;

pub struct ListDirectoryTool {
    path_guard: Arc<PathGuard>,
}

impl ListDirectoryTool {
    pub fn new(path_guard: Arc<PathGuard>) -> Self {
        Self { path_guard }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List the contents of a workspace directory. Entries are sorted, directories first."
    }

    fn category(&self) -> &str {
        "file"
    }

    fn tags(&self) -> Vec<String> {
        vec!["filesystem".into()]
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Workspace-relative directory path ('.' for the root)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        validate_required(&self.parameters_schema(), &arguments)?;
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("'path' must be a string".into()))?;

        let resolved = self.path_guard.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|e| ToolError::Execution(format!("cannot list {path}: {e}")))?;

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        let mut truncated = false;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?
        {
            if dirs.len() + files.len() >= MAX_ENTRIES {
                truncated = true;
                break;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| ToolError::Execution(e.to_string()))?;
            if file_type.is_dir() {
                dirs.push(name);
            } else {
                files.push(name);
            }
        }
        dirs.sort();
        files.sort();

        let entries: Vec<serde_json::Value> = dirs
            .into_iter()
            .map(|name| serde_json::json!({"name": name, "type": "directory"}))
            .chain(
                files
                    .into_iter()
                    .map(|name| serde_json::json!({"name": name, "type": "file"})),
            )
            .collect();

        Ok(serde_json::json!({
            "path": self.path_guard.to_workspace_relative(path)?,
            "entries": entries,
            "truncated": truncated,
        }))
    }
}
