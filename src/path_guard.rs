//! Workspace-scoped path resolution.
//!
//! Every tool that touches the filesystem routes through here. A path is
//! rejected if, after symlink resolution, it is not a descendant of the
//! configured workspace root. Output paths are returned workspace-relative
//! with forward slashes so results are stable across platforms.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathGuardError {
    #[error("path escapes the workspace: {0}")]
    Escape(String),
    #[error("cannot resolve {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct PathGuard {
    workspace_root: PathBuf,
}

impl PathGuard {
    /// The root is canonicalized once at construction; it must exist.
    pub fn new(workspace_root: impl AsRef<Path>) -> Result<Self, PathGuardError> {
        let root = workspace_root.as_ref();
        let workspace_root = root.canonicalize().map_err(|source| PathGuardError::Io {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { workspace_root })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Resolve a workspace-relative or absolute path to an absolute path
    /// inside the workspace. Symlinks in existing ancestors are followed;
    /// the leaf may not exist yet.
    pub fn resolve(&self, input: impl AsRef<Path>) -> Result<PathBuf, PathGuardError> {
        let input = input.as_ref();
        let joined = if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.workspace_root.join(input)
        };

        let resolved = resolve_lexical_then_symlinks(&joined)?;
        if !resolved.starts_with(&self.workspace_root) {
            return Err(PathGuardError::Escape(input.display().to_string()));
        }
        Ok(resolved)
    }

    /// True when `path` resolves inside the workspace.
    pub fn is_within_workspace(&self, path: impl AsRef<Path>) -> bool {
        self.resolve(path).is_ok()
    }

    /// Workspace-relative form with forward slashes.
    pub fn to_workspace_relative(&self, path: impl AsRef<Path>) -> Result<String, PathGuardError> {
        let resolved = self.resolve(path)?;
        let relative = resolved
            .strip_prefix(&self.workspace_root)
            .expect("resolved path is under the workspace root");
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Ok(parts.join("/"))
    }
}

/// Normalize `.`/`..` lexically, then canonicalize the deepest existing
/// ancestor so symlinks cannot smuggle a path out of the workspace.
fn resolve_lexical_then_symlinks(path: &Path) -> Result<PathBuf, PathGuardError> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    // Split into the existing prefix (canonicalized) and the trailing
    // not-yet-created components (appended verbatim).
    let mut existing = normalized.clone();
    let mut trailing: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => {
                trailing.push(name.to_os_string());
                existing.pop();
            }
            None => break,
        }
    }

    let mut resolved = if existing.as_os_str().is_empty() {
        normalized
    } else {
        let canonical = existing.canonicalize().map_err(|source| PathGuardError::Io {
            path: existing.display().to_string(),
            source,
        })?;
        let mut canonical = canonical;
        for name in trailing.iter().rev() {
            canonical.push(name);
        }
        canonical
    };

    // A symlinked leaf that exists is already canonical at this point; a
    // dangling ".." in trailing components was removed lexically above.
    if resolved.as_os_str().is_empty() {
        resolved = PathBuf::from("/");
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> (tempfile::TempDir, PathGuard) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        let guard = PathGuard::new(dir.path()).unwrap();
        (dir, guard)
    }

    #[test]
    fn relative_paths_resolve_under_root() {
        let (_dir, guard) = guard();
        let resolved = guard.resolve("src/lib.rs").unwrap();
        assert!(resolved.starts_with(guard.workspace_root()));
        assert!(guard.is_within_workspace("src/lib.rs"));
    }

    #[test]
    fn nonexistent_leaf_is_allowed() {
        let (_dir, guard) = guard();
        let resolved = guard.resolve("src/new_file.rs").unwrap();
        assert!(resolved.starts_with(guard.workspace_root()));
    }

    #[test]
    fn dotdot_escape_is_rejected() {
        let (_dir, guard) = guard();
        let err = guard.resolve("../outside.txt").unwrap_err();
        assert!(matches!(err, PathGuardError::Escape(_)));
        assert!(!guard.is_within_workspace("src/../../etc/passwd"));
    }

    #[test]
    fn absolute_path_outside_root_is_rejected() {
        let (_dir, guard) = guard();
        assert!(!guard.is_within_workspace("/etc/passwd"));
    }

    #[test]
    fn dotdot_inside_workspace_is_fine() {
        let (_dir, guard) = guard();
        let resolved = guard.resolve("src/../src/lib.rs").unwrap();
        assert!(resolved.ends_with("src/lib.rs"));
    }

    #[test]
    fn workspace_relative_uses_forward_slashes() {
        let (_dir, guard) = guard();
        let rel = guard.to_workspace_relative("src/lib.rs").unwrap();
        assert_eq!(rel, "src/lib.rs");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let (dir, guard) = guard();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("sneaky")).unwrap();
        let err = guard.resolve("sneaky/data.txt").unwrap_err();
        assert!(matches!(err, PathGuardError::Escape(_)));
    }
}
