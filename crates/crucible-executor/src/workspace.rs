//! Per-build workspaces.
//!
//! Each build owns `<workspace_root>/<build_id>`, created empty and deleted
//! on completion. Every path taken from a pipeline definition is resolved
//! against the workspace and rejected if it escapes it.

use std::path::{Component, Path, PathBuf};

use crucible_core::{Error, ResourceId, Result};

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the build's workspace, guaranteed to exist and be empty.
    pub fn allocate(&self, build_id: ResourceId) -> Result<PathBuf> {
        let path = self.root.join(build_id.to_string());
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .map_err(|e| Error::Internal(format!("clear workspace {}: {e}", path.display())))?;
        }
        std::fs::create_dir_all(&path)
            .map_err(|e| Error::Internal(format!("create workspace {}: {e}", path.display())))?;
        Ok(path)
    }

    /// Delete the build's workspace. Missing directories are fine.
    pub fn cleanup(&self, build_id: ResourceId) -> Result<()> {
        let path = self.root.join(build_id.to_string());
        match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Internal(format!("remove workspace {}: {e}", path.display()))),
        }
    }
}

/// Resolve a pipeline-supplied relative path against a workspace, rejecting
/// absolute paths and anything containing `..` after normalization.
pub fn confine(workspace: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(Error::InvalidInput(format!("absolute path not allowed: {relative}")));
    }
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(Error::InvalidInput(format!("path escapes workspace: {relative}")));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidInput(format!("absolute path not allowed: {relative}")));
            }
        }
    }
    Ok(workspace.join(normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_creates_empty_directory() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let id = ResourceId::new();

        let ws = manager.allocate(id).unwrap();
        assert!(ws.is_dir());
        std::fs::write(ws.join("leftover"), "x").unwrap();

        // Re-allocation clears previous contents.
        let ws = manager.allocate(id).unwrap();
        assert!(std::fs::read_dir(&ws).unwrap().next().is_none());

        manager.cleanup(id).unwrap();
        assert!(!ws.exists());
        // Cleaning twice is fine.
        manager.cleanup(id).unwrap();
    }

    #[test]
    fn confine_rejects_escapes() {
        let ws = Path::new("/work/b1");
        assert!(confine(ws, "src/main.rs").is_ok());
        assert!(confine(ws, "./target/out").is_ok());
        assert!(confine(ws, "../other").is_err());
        assert!(confine(ws, "a/../../b").is_err());
        assert!(confine(ws, "/etc/passwd").is_err());
    }

    #[test]
    fn confine_joins_under_workspace() {
        let ws = Path::new("/work/b1");
        assert_eq!(confine(ws, "a/./b").unwrap(), Path::new("/work/b1/a/b"));
    }
}
