//! Workspace discovery.
//!
//! A workspace is the parent directory of a `.WHISPER` folder, found by
//! walking upward from a starting path. Symlinks are followed with cycle
//! protection. An optional `.WHISPER/project.json` supplies project
//! metadata.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("no .WHISPER folder found in current or parent directories")]
    NotFound,
    #[error("invalid project.json: {0}")]
    InvalidProjectFile(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProjectInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Walk from `start` (or the current directory) up to the filesystem root
/// looking for a `.WHISPER` directory; return its parent.
pub fn find_workspace(start: Option<&Path>) -> Result<PathBuf, WorkspaceError> {
    let mut current = match start {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir()?,
    };
    let mut visited: HashSet<PathBuf> = HashSet::new();

    loop {
        match current.canonicalize() {
            Ok(real) => {
                if !visited.insert(real.clone()) {
                    // Symlink cycle; nothing further up will be new.
                    break;
                }
                if real.join(".WHISPER").is_dir() {
                    return Ok(real);
                }
            }
            Err(err) => {
                warn!(path = %current.display(), error = %err, "skipping unreadable directory during workspace search");
            }
        }
        match current.parent() {
            Some(parent) if parent != current => current = parent.to_path_buf(),
            _ => break,
        }
    }
    Err(WorkspaceError::NotFound)
}

/// Parse `.WHISPER/project.json` when present. Returns `None` if the file
/// does not exist; invalid JSON is an error.
pub fn load_project_info(workspace_root: &Path) -> Result<Option<ProjectInfo>, WorkspaceError> {
    let project_file = workspace_root.join(".WHISPER").join("project.json");
    if !project_file.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&project_file)?;
    Ok(Some(serde_json::from_str(&raw)?))
}
