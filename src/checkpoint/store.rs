//! Recovery point storage.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

use super::RecoveryPoint;
use crate::errors::CheckpointError;

/// Keyed storage of at most one recovery point per session.
pub trait CheckpointStore: Send + Sync {
    /// Replace the session's recovery point with `point`.
    fn save(&self, point: &RecoveryPoint) -> Result<(), CheckpointError>;

    fn load(&self, session_id: &str) -> Result<Option<RecoveryPoint>, CheckpointError>;

    /// Remove the session's recovery point. Removing a missing point is not an error.
    fn delete(&self, session_id: &str) -> Result<(), CheckpointError>;

    fn list_ids(&self) -> Result<Vec<String>, CheckpointError>;
}

fn validate_session_id(session_id: &str) -> Result<(), CheckpointError> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidSessionId(session_id.to_string()))
    }
}

/// One JSON file per session under a directory, replaced atomically.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{}.json", session_id)))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, point: &RecoveryPoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&point.session_id)?;
        let write_err = |source| CheckpointError::Write {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(&self.dir).map_err(write_err)?;
        let json = serde_json::to_vec_pretty(point).map_err(CheckpointError::Serialize)?;

        // Temp file in the same directory so the rename stays on one filesystem
        let mut temp = NamedTempFile::new_in(&self.dir).map_err(write_err)?;
        temp.write_all(&json).map_err(write_err)?;
        temp.as_file().sync_all().map_err(write_err)?;
        temp.persist(&path).map_err(|e| write_err(e.error))?;

        tracing::debug!(session_id = %point.session_id, path = %path.display(), "Recovery point written");
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<RecoveryPoint>, CheckpointError> {
        let path = self.path_for(session_id)?;
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CheckpointError::Read { path, source }),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupt {
                path,
                message: e.to_string(),
            })
    }

    fn delete(&self, session_id: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(session_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Write { path, source }),
        }
    }

    fn list_ids(&self) -> Result<Vec<String>, CheckpointError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CheckpointError::Read {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().to_string()))
            .filter(|id| validate_session_id(id).is_ok())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// In-process store, used when nothing needs to survive the process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    points: Mutex<HashMap<String, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn points(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.points.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, point: &RecoveryPoint) -> Result<(), CheckpointError> {
        validate_session_id(&point.session_id)?;
        let json = serde_json::to_string(point).map_err(CheckpointError::Serialize)?;
        self.points().insert(point.session_id.clone(), json);
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<RecoveryPoint>, CheckpointError> {
        validate_session_id(session_id)?;
        match self.points().get(session_id) {
            Some(json) => serde_json::from_str(json)
                .map(Some)
                .map_err(|e| CheckpointError::Corrupt {
                    path: PathBuf::from(session_id),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn delete(&self, session_id: &str) -> Result<(), CheckpointError> {
        validate_session_id(session_id)?;
        self.points().remove(session_id);
        Ok(())
    }

    fn list_ids(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids: Vec<String> = self.points().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
