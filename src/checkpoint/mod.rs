//! Crash recovery: recovery points, their store, and the recovery manager.
//!
//! A [`RecoveryPoint`] is a whole snapshot of one session. It is replaced
//! wholesale on every write and never updated field by field, so a reader
//! sees either the previous snapshot or the new one.

pub mod recovery;
pub mod store;

pub use recovery::{FailedFile, RecoveryManager, RecoveryReport};
pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::ArtifactStore;
use crate::session::{PhaseName, Session};
use crate::util::sha256_hex;

/// Bumped when the recovery point layout changes incompatibly.
pub const RECOVERY_POINT_VERSION: u32 = 1;

/// Content checkpoint for one produced file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileCheckpoint {
    pub path: String,
    pub sha256: String,
    pub size: u64,
    /// Full UTF-8 content, present when backups are enabled and the file is small enough
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
}

impl FileCheckpoint {
    pub fn capture(path: &str, content: &[u8], policy: &BackupPolicy) -> Self {
        let size = content.len() as u64;
        let backup = if policy.enabled && size <= policy.max_bytes {
            std::str::from_utf8(content).ok().map(str::to_string)
        } else {
            None
        };
        Self {
            path: path.to_string(),
            sha256: sha256_hex(content),
            size,
            backup,
        }
    }

    pub fn matches(&self, content: &[u8]) -> bool {
        self.sha256 == sha256_hex(content)
    }
}

/// Whether and how much file content is copied into recovery points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupPolicy {
    pub enabled: bool,
    pub max_bytes: u64,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 256 * 1024,
        }
    }
}

/// Durable snapshot of a session at a phase boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryPoint {
    #[serde(default = "default_version")]
    pub version: u32,
    pub session_id: String,
    #[serde(default)]
    pub phase: Option<PhaseName>,
    pub written_at: DateTime<Utc>,
    pub session: Session,
    #[serde(default)]
    pub produced_files: Vec<String>,
    #[serde(default)]
    pub file_checkpoints: Vec<FileCheckpoint>,
}

fn default_version() -> u32 {
    RECOVERY_POINT_VERSION
}

impl RecoveryPoint {
    /// Snapshot `session` and hash every produced file that can be read.
    pub fn capture(session: &Session, artifacts: &dyn ArtifactStore, policy: &BackupPolicy) -> Self {
        let mut file_checkpoints = Vec::with_capacity(session.produced_files.len());
        for path in &session.produced_files {
            match artifacts.read(path) {
                Ok(content) => file_checkpoints.push(FileCheckpoint::capture(path, &content, policy)),
                Err(e) => {
                    tracing::warn!(session_id = %session.id, file = %path, error = %e, "Produced file unreadable at checkpoint");
                }
            }
        }

        Self {
            version: RECOVERY_POINT_VERSION,
            session_id: session.id.clone(),
            phase: session.current_phase,
            written_at: Utc::now(),
            session: session.clone(),
            produced_files: session.produced_files.clone(),
            file_checkpoints,
        }
    }

    pub fn file_checkpoint(&self, path: &str) -> Option<&FileCheckpoint> {
        self.file_checkpoints.iter().find(|f| f.path == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::FsArtifactStore;
    use tempfile::tempdir;

    #[test]
    fn test_file_checkpoint_backup_respects_policy() {
        let content = b"fn main() {}\n";
        let with_backup = FileCheckpoint::capture("main.rs", content, &BackupPolicy::default());
        assert_eq!(with_backup.backup.as_deref(), Some("fn main() {}\n"));
        assert_eq!(with_backup.size, content.len() as u64);
        assert!(with_backup.matches(content));
        assert!(!with_backup.matches(b"changed"));

        let small = BackupPolicy {
            enabled: true,
            max_bytes: 4,
        };
        assert!(FileCheckpoint::capture("main.rs", content, &small).backup.is_none());

        let disabled = BackupPolicy {
            enabled: false,
            max_bytes: u64::MAX,
        };
        assert!(FileCheckpoint::capture("main.rs", content, &disabled).backup.is_none());
    }

    #[test]
    fn test_binary_content_is_hashed_but_not_backed_up() {
        let cp = FileCheckpoint::capture("logo.png", &[0xff, 0xfe, 0x00], &BackupPolicy::default());
        assert!(cp.backup.is_none());
        assert_eq!(cp.sha256.len(), 64);
    }

    #[test]
    fn test_capture_skips_unreadable_files() {
        let dir = tempdir().unwrap();
        let artifacts = FsArtifactStore::new(dir.path());
        artifacts.write("a.txt", b"a").unwrap();

        let mut session = Session::new("task");
        session.current_phase = Some(PhaseName::Execute);
        session.add_produced_file("a.txt");
        session.add_produced_file("gone.txt");

        let point = RecoveryPoint::capture(&session, &artifacts, &BackupPolicy::default());
        assert_eq!(point.session_id, session.id);
        assert_eq!(point.phase, Some(PhaseName::Execute));
        assert_eq!(point.produced_files.len(), 2);
        assert_eq!(point.file_checkpoints.len(), 1);
        assert!(point.file_checkpoint("a.txt").is_some());
        assert!(point.file_checkpoint("gone.txt").is_none());
    }
}
