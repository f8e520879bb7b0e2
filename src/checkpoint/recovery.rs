//! Recovery manager: writes recovery points at phase boundaries and restores
//! interrupted sessions at startup.

use serde::Serialize;
use std::sync::Arc;

use super::{BackupPolicy, CheckpointStore, RecoveryPoint};
use crate::artifacts::ArtifactStore;
use crate::errors::CheckpointError;
use crate::session::{PhaseName, Session};

/// A produced file that could not be restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub path: String,
    pub reason: String,
}

/// Outcome of recovering one session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub session_id: String,
    /// False when there was nothing to recover
    pub recovered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseName>,
    #[serde(skip)]
    pub session: Option<Session>,
    /// Files present with their checkpointed content, including rewritten ones
    pub restored: Vec<String>,
    /// Subset of `restored` that had to be rewritten from a backup
    pub rewritten: Vec<String>,
    /// Files present but changed since the checkpoint
    pub drifted: Vec<String>,
    pub failed: Vec<FailedFile>,
}

impl RecoveryReport {
    fn nothing(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            ..Default::default()
        }
    }
}

/// Checkpoints sessions and recovers interrupted ones.
pub struct RecoveryManager {
    store: Arc<dyn CheckpointStore>,
    artifacts: Arc<dyn ArtifactStore>,
    backup: BackupPolicy,
}

impl RecoveryManager {
    pub fn new(store: Arc<dyn CheckpointStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            artifacts,
            backup: BackupPolicy::default(),
        }
    }

    pub fn with_backup_policy(mut self, backup: BackupPolicy) -> Self {
        self.backup = backup;
        self
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Write the session's recovery point, replacing any previous one.
    pub fn checkpoint(&self, session: &Session) -> Result<RecoveryPoint, CheckpointError> {
        let point = RecoveryPoint::capture(session, self.artifacts.as_ref(), &self.backup);
        self.store.save(&point)?;
        Ok(point)
    }

    /// Remove the recovery point of a session that completed.
    pub fn complete(&self, session_id: &str) -> Result<(), CheckpointError> {
        self.store.delete(session_id)
    }

    /// Recovery points whose session never reached a terminal status.
    ///
    /// Corrupt points are logged and skipped.
    pub fn find_interrupted(&self) -> Result<Vec<RecoveryPoint>, CheckpointError> {
        let mut interrupted = Vec::new();
        for id in self.store.list_ids()? {
            match self.store.load(&id) {
                Ok(Some(point)) if !point.session.is_terminal() => interrupted.push(point),
                Ok(_) => {}
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Skipping unreadable recovery point"),
            }
        }
        interrupted.sort_by_key(|p| p.written_at);
        Ok(interrupted)
    }

    /// Every stored point, interrupted or terminal.
    pub fn list(&self) -> Result<Vec<RecoveryPoint>, CheckpointError> {
        let mut points = Vec::new();
        for id in self.store.list_ids()? {
            match self.store.load(&id) {
                Ok(Some(point)) => points.push(point),
                Ok(None) => {}
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Skipping unreadable recovery point"),
            }
        }
        points.sort_by_key(|p| p.written_at);
        Ok(points)
    }

    /// Restore an interrupted session and re-verify its produced files.
    ///
    /// A missing point or a point for a finished session yields an empty
    /// report. The point itself is left in place, so repeated calls return
    /// the same file lists.
    pub fn recover(&self, session_id: &str) -> Result<RecoveryReport, CheckpointError> {
        let Some(point) = self.store.load(session_id)? else {
            return Ok(RecoveryReport::nothing(session_id));
        };
        if point.session.is_terminal() {
            return Ok(RecoveryReport::nothing(session_id));
        }

        let mut report = RecoveryReport {
            session_id: session_id.to_string(),
            recovered: true,
            phase: point.phase,
            ..Default::default()
        };

        for path in &point.produced_files {
            let checkpoint = point.file_checkpoint(path);
            match (self.artifacts.read(path), checkpoint) {
                (Ok(content), Some(cp)) if !cp.matches(&content) => {
                    report.drifted.push(path.clone());
                }
                (Ok(_), _) => report.restored.push(path.clone()),
                (Err(_), Some(cp)) => match &cp.backup {
                    Some(backup) => match self.artifacts.write(path, backup.as_bytes()) {
                        Ok(()) => {
                            report.restored.push(path.clone());
                            report.rewritten.push(path.clone());
                        }
                        Err(e) => report.failed.push(FailedFile {
                            path: path.clone(),
                            reason: format!("rewrite from backup failed: {:#}", e),
                        }),
                    },
                    None => report.failed.push(FailedFile {
                        path: path.clone(),
                        reason: "missing and no backup available".to_string(),
                    }),
                },
                (Err(_), None) => report.failed.push(FailedFile {
                    path: path.clone(),
                    reason: "missing and never checkpointed".to_string(),
                }),
            }
        }

        tracing::info!(
            session_id = %session_id,
            restored = report.restored.len(),
            rewritten = report.rewritten.len(),
            drifted = report.drifted.len(),
            failed = report.failed.len(),
            "Recovered session"
        );

        let mut session = point.session;
        // Failed files are regenerated on resume
        session
            .produced_files
            .retain(|p| !report.failed.iter().any(|f| &f.path == p));
        report.session = Some(session);
        Ok(report)
    }

    /// Recover every interrupted session.
    pub fn recover_all(&self) -> Result<Vec<RecoveryReport>, CheckpointError> {
        let mut reports = Vec::new();
        for point in self.find_interrupted()? {
            reports.push(self.recover(&point.session_id)?);
        }
        Ok(reports)
    }
}
