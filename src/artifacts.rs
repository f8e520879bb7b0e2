//! Persistence collaborator for generated artifacts.

use anyhow::{Context, Result, bail};
use std::path::{Component, Path, PathBuf};

/// Reads and writes generated files relative to a project root.
pub trait ArtifactStore: Send + Sync {
    fn write(&self, relative: &str, content: &[u8]) -> Result<()>;

    fn read(&self, relative: &str) -> Result<Vec<u8>>;

    fn exists(&self, relative: &str) -> bool;

    /// Absolute location of an artifact.
    fn resolve(&self, relative: &str) -> Result<PathBuf>;
}

/// Filesystem-backed artifact store rooted at the project directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Reject absolute paths and anything that climbs out of the root.
fn check_relative(relative: &str) -> Result<&Path> {
    let path = Path::new(relative);
    if relative.trim().is_empty() {
        bail!("Artifact path is empty");
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => bail!("Artifact path '{}' must stay inside the project", relative),
        }
    }
    Ok(path)
}

impl ArtifactStore for FsArtifactStore {
    fn write(&self, relative: &str, content: &[u8]) -> Result<()> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write artifact {}", path.display()))
    }

    fn read(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.resolve(relative)?;
        std::fs::read(&path).with_context(|| format!("Failed to read artifact {}", path.display()))
    }

    fn exists(&self, relative: &str) -> bool {
        self.resolve(relative).map(|p| p.is_file()).unwrap_or(false)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        Ok(self.root.join(check_relative(relative)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        store.write("src/deep/mod.rs", b"pub fn f() {}\n").unwrap();

        assert!(store.exists("src/deep/mod.rs"));
        assert_eq!(store.read("src/deep/mod.rs").unwrap(), b"pub fn f() {}\n");
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        assert!(store.write("../outside.txt", b"x").is_err());
        assert!(store.write("/etc/passwd", b"x").is_err());
        assert!(store.write("", b"x").is_err());
        assert!(!store.exists("../outside.txt"));
    }

    #[test]
    fn test_read_missing_reports_error() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let err = store.read("missing.rs").unwrap_err();
        assert!(err.to_string().contains("Failed to read artifact"));
    }
}
