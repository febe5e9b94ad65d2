//! File tools — read and write workspace files with safety limits.

use super::{validate_required, Tool, ToolContext, ToolError};
use crate::path_guard::PathGuard;
use async_trait::async_trait;
use std::sync::Arc;

/// Read a file's contents. Supports line ranges for large files.
pub struct ReadFileTool {
    path_guard: Arc<PathGuard>,
    /// Max file size to read.
    pub max_bytes: u64,
}

impl ReadFileTool {
    pub fn new(path_guard: Arc<PathGuard>) -> Self {
        Self {
            path_guard,
            max_bytes: 1024 * 1024,
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file's contents. Optionally specify offset (1-indexed line) and limit (number of lines) for large files."
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
                    "description": "Workspace-relative file path to read"
                },
                "offset": {
                    "type": "integer",
                    "description": "Starting line number (1-indexed, optional)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (optional)"
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
        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| ToolError::Execution(format!("cannot access {path}: {e}")))?;
        if metadata.len() > self.max_bytes {
            return Err(ToolError::Execution(format!(
                "file too large ({} bytes, max {}); use offset/limit for partial reads",
                metadata.len(),
                self.max_bytes
            )));
        }

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| ToolError::Execution(format!("cannot read {path}: {e}")))?;

        let offset = arguments["offset"].as_u64().map(|v| v.max(1) as usize);
        let limit = arguments["limit"].as_u64().map(|v| v as usize);

        let (text, lines_total) = match (offset, limit) {
            (None, None) => {
                let total = content.lines().count();
                (content, total)
            }
            (offset, limit) => {
                let lines: Vec<&str> = content.lines().collect();
                let start = offset.map(|o| o - 1).unwrap_or(0).min(lines.len());
                let end = limit
                    .map(|l| (start + l).min(lines.len()))
                    .unwrap_or(lines.len());
                (lines[start..end].join("\n"), lines.len())
            }
        };

        Ok(serde_json::json!({
            "path": self.path_guard.to_workspace_relative(path)?,
            "content": text,
            "lines_total": lines_total,
        }))
    }
}

// ---------------------------------------------------------------------------

/// Write content to a workspace file, creating parent directories as needed.
pub struct WriteFileTool {
    path_guard: Arc<PathGuard>,
}

impl WriteFileTool {
    pub fn new(path_guard: Arc<PathGuard>) -> Self {
        Self { path_guard }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file if it doesn't exist, overwrites if it does. Creates parent directories automatically."
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
                    "description": "Workspace-relative file path to write"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            },
            "required": ["path", "content"]
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
        let content = arguments["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("'content' must be a string".into()))?;

        let resolved = self.path_guard.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Execution(format!("cannot create directory: {e}")))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| ToolError::Execution(format!("cannot write {path}: {e}")))?;

        Ok(serde_json::json!({
            "path": self.path_guard.to_workspace_relative(path)?,
            "bytes_written": content.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Arc<PathGuard>) {
        let dir = tempfile::tempdir().unwrap();
        let guard = Arc::new(PathGuard::new(dir.path()).unwrap());
        (dir, guard)
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let (_dir, guard) = setup();
        let write = WriteFileTool::new(guard.clone());
        let read = ReadFileTool::new(guard);
        let ctx = ToolContext::for_agent("tester");

        let result = write
            .execute(
                serde_json::json!({"path": "notes/hello.txt", "content": "hi there"}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(result["bytes_written"], 8);
        assert_eq!(result["path"], "notes/hello.txt");

        let result = read
            .execute(serde_json::json!({"path": "notes/hello.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result["content"], "hi there");
    }

    #[tokio::test]
    async fn read_line_range() {
        let (_dir, guard) = setup();
        std::fs::write(
            guard.workspace_root().join("lines.txt"),
            "one\ntwo\nthree\nfour\n",
        )
        .unwrap();
        let read = ReadFileTool::new(guard);
        let result = read
            .execute(
                serde_json::json!({"path": "lines.txt", "offset": 2, "limit": 2}),
                &ToolContext::for_agent("t"),
            )
            .await
            .unwrap();
        assert_eq!(result["content"], "two\nthree");
        assert_eq!(result["lines_total"], 4);
    }

    #[tokio::test]
    async fn escape_is_rejected_as_path_escape() {
        let (_dir, guard) = setup();
        let read = ReadFileTool::new(guard);
        let err = read
            .execute(
                serde_json::json!({"path": "../../etc/passwd"}),
                &ToolContext::for_agent("t"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "path-escape");
    }

    #[tokio::test]
    async fn missing_required_parameter_is_invalid_arguments() {
        let (_dir, guard) = setup();
        let write = WriteFileTool::new(guard);
        let err = write
            .execute(serde_json::json!({"path": "x.txt"}), &ToolContext::for_agent("t"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid-arguments");
    }
}
