//! Typed error hierarchy for the conductor engine.
//!
//! Four top-level enums cover the subsystems:
//! - `InvocationError` - failures of external processes (LLM CLI, capture, vision)
//! - `PluginError` - manifest validation and dependency resolution failures
//! - `CheckpointError` - recovery point persistence failures
//! - `OrchestratorError` - session-level failures surfaced to callers

use crate::plugins::ManifestIssue;
use std::time::Duration;
use thiserror::Error;

/// Errors from invoking an external tool.
#[derive(Debug, Clone, Error)]
pub enum InvocationError {
    #[error("Invocation of {target} timed out after {}s", after.as_secs())]
    Timeout { target: String, after: Duration },

    #[error("Process exited with non-zero code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Tool requested human input: {message}")]
    NeedsHumanInput { message: String },

    #[error("Failed to spawn {command}: {message}")]
    Spawn { command: String, message: String },

    #[error("Invocation aborted: {0}")]
    Aborted(String),
}

impl InvocationError {
    /// Timeouts, non-zero exits and human-input requests are worth another attempt.
    /// Spawn failures and explicit aborts are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InvocationError::Timeout { .. }
                | InvocationError::NonZeroExit { .. }
                | InvocationError::NeedsHumanInput { .. }
        )
    }
}

/// Errors from the plugin host.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin manifest {source_name} is invalid ({} issue(s))", issues.len())]
    InvalidManifest {
        source_name: String,
        issues: Vec<ManifestIssue>,
    },

    #[error("Plugin {plugin} has unresolved dependencies: {}", missing.join(", "))]
    UnresolvedDependencies { plugin: String, missing: Vec<String> },

    #[error("Plugin {0} is already loaded")]
    AlreadyLoaded(String),

    #[error("Failed to read plugin manifest at {path}: {source}")]
    ManifestRead {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Invalid session id '{0}' for checkpoint storage")]
    InvalidSessionId(String),

    #[error("Failed to write recovery point at {path}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read recovery point at {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Recovery point at {path} is corrupt: {message}")]
    Corrupt {
        path: std::path::PathBuf,
        message: String,
    },

    #[error("Failed to serialize recovery point: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Session-level failures surfaced to callers of the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Phase {phase} exhausted its retry budget after {attempts} attempt(s)")]
    RetriesExhausted { phase: String, attempts: u32 },

    #[error("Phase {phase} failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error("Checkpoint writes failed {failures} time(s) in a row")]
    PersistenceExhausted { failures: u32 },

    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Nothing to resume for session {0}")]
    NothingToResume(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
