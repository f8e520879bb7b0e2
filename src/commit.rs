//! Finalizing a session's produced files.

use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::{Repository, Signature};
use std::path::{Path, PathBuf};

/// Commit collaborator for the commit phase.
#[async_trait]
pub trait Committer: Send + Sync {
    fn name(&self) -> &str;

    /// Commit `files` (paths relative to the project root) and return an
    /// identifier for the commit.
    async fn commit(&self, message: &str, files: &[String]) -> Result<String>;
}

/// Commits through libgit2 in the project repository.
#[derive(Debug, Clone)]
pub struct GitCommitter {
    project_dir: PathBuf,
    author_name: String,
    author_email: String,
}

impl GitCommitter {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            author_name: "conductor".to_string(),
            author_email: "conductor@localhost".to_string(),
        }
    }

    pub fn with_author(mut self, name: Option<&str>, email: Option<&str>) -> Self {
        if let Some(name) = name {
            self.author_name = name.to_string();
        }
        if let Some(email) = email {
            self.author_email = email.to_string();
        }
        self
    }

    /// Whether `project_dir` is inside a git repository.
    pub fn is_repository(project_dir: &Path) -> bool {
        Repository::discover(project_dir).is_ok()
    }

    fn commit_blocking(&self, message: &str, files: &[String]) -> Result<String> {
        let repo = Repository::discover(&self.project_dir)
            .context("Failed to open git repository")?;
        let workdir = repo
            .workdir()
            .context("Repository has no working directory")?;
        let workdir = workdir.canonicalize().unwrap_or_else(|_| workdir.to_path_buf());
        let base = self
            .project_dir
            .canonicalize()
            .unwrap_or_else(|_| self.project_dir.clone());

        let mut index = repo.index()?;
        for file in files {
            let absolute = base.join(file);
            let relative = absolute
                .strip_prefix(&workdir)
                .with_context(|| format!("{} is outside the repository", absolute.display()))?;
            if absolute.exists() {
                index
                    .add_path(relative)
                    .with_context(|| format!("Failed to stage {}", file))?;
            } else {
                index.remove_path(relative).ok();
            }
        }
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now(&self.author_name, &self.author_email)?;

        // Unborn branch: first commit has no parents
        let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;

        Ok(oid.to_string())
    }
}

#[async_trait]
impl Committer for GitCommitter {
    fn name(&self) -> &str {
        "git"
    }

    async fn commit(&self, message: &str, files: &[String]) -> Result<String> {
        let committer = self.clone();
        let message = message.to_string();
        let files = files.to_vec();
        tokio::task::spawn_blocking(move || committer.commit_blocking(&message, &files))
            .await
            .context("Commit task panicked")?
    }
}

/// Used when commits are disabled or there is no repository.
#[derive(Debug, Default)]
pub struct NoopCommitter;

#[async_trait]
impl Committer for NoopCommitter {
    fn name(&self) -> &str {
        "none"
    }

    async fn commit(&self, _message: &str, files: &[String]) -> Result<String> {
        tracing::debug!(files = files.len(), "Commit skipped");
        Ok("uncommitted".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_git_committer_creates_initial_and_followup_commits() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        assert!(GitCommitter::is_repository(dir.path()));

        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let committer = GitCommitter::new(dir.path()).with_author(Some("Test"), Some("t@example.com"));
        let first = committer.commit("first", &["a.txt".into()]).await.unwrap();

        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/b.txt"), "two").unwrap();
        let second = committer.commit("second", &["src/b.txt".into()]).await.unwrap();
        assert_ne!(first, second);

        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.id().to_string(), second);
        assert_eq!(head.message(), Some("second"));
        assert_eq!(head.author().name(), Some("Test"));
        assert_eq!(head.parent_count(), 1);
        assert!(head.tree().unwrap().get_path(Path::new("src/b.txt")).is_ok());
    }

    #[tokio::test]
    async fn test_git_committer_outside_repository_fails() {
        let dir = tempdir().unwrap();
        let committer = GitCommitter::new(dir.path());
        // tempdirs normally live outside any repository
        if !GitCommitter::is_repository(dir.path()) {
            assert!(committer.commit("msg", &[]).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_noop_committer() {
        let id = NoopCommitter.commit("msg", &["a".into()]).await.unwrap();
        assert_eq!(id, "uncommitted");
    }
}
