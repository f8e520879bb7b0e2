//! Session and phase record types.
//!
//! A `Session` is one end-to-end orchestration run. It is owned by the
//! orchestrator for its lifetime; everything else (plugins, the control plane,
//! the checkpoint store) only sees clones of it.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The fixed set of pipeline phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Plan,
    Execute,
    Observe,
    Audit,
    Commit,
}

impl PhaseName {
    /// Returns all phases in pipeline order.
    pub fn all() -> &'static [PhaseName] {
        &[
            PhaseName::Plan,
            PhaseName::Execute,
            PhaseName::Observe,
            PhaseName::Audit,
            PhaseName::Commit,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Plan => "plan",
            PhaseName::Execute => "execute",
            PhaseName::Observe => "observe",
            PhaseName::Audit => "audit",
            PhaseName::Commit => "commit",
        }
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PhaseName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plan" => Ok(PhaseName::Plan),
            "execute" => Ok(PhaseName::Execute),
            "observe" => Ok(PhaseName::Observe),
            "audit" => Ok(PhaseName::Audit),
            "commit" => Ok(PhaseName::Commit),
            _ => anyhow::bail!(
                "Invalid phase '{}'. Valid values: plan, execute, observe, audit, commit",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a single phase attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseOutcome {
    Success,
    Failure,
    NeedsRetry,
}

impl std::fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseOutcome::Success => write!(f, "success"),
            PhaseOutcome::Failure => write!(f, "failure"),
            PhaseOutcome::NeedsRetry => write!(f, "needs-retry"),
        }
    }
}

/// One attempt at one phase.
///
/// Records are opened when the attempt begins and closed exactly once via
/// [`PhaseRecord::close`], which consumes the open record. Only closed records
/// are stored on the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseRecord {
    pub phase: PhaseName,
    /// 1-based attempt number across all visits to this phase
    pub attempt: u32,
    /// Agent or tool that carried out the attempt
    pub agent: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outcome: Option<PhaseOutcome>,
    #[serde(default)]
    pub result: serde_json::Value,
}

impl PhaseRecord {
    pub fn open(phase: PhaseName, attempt: u32, agent: impl Into<String>) -> Self {
        Self {
            phase,
            attempt,
            agent: agent.into(),
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            result: serde_json::Value::Null,
        }
    }

    pub fn close(mut self, outcome: PhaseOutcome, result: serde_json::Value) -> Self {
        self.ended_at = Some(Utc::now());
        self.outcome = Some(outcome);
        self.result = result;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == Some(PhaseOutcome::Success)
    }
}

/// Entry in the session's transition log. `to: None` marks the terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseTransition {
    pub from: Option<PhaseName>,
    pub to: Option<PhaseName>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Classification of errors absorbed into the session error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeout or non-zero exit from an external tool
    Tool,
    /// Output that failed a structural check
    Validation,
    /// A plugin handler failed
    Plugin,
    /// Checkpoint write failed
    Persistence,
    /// Terminated the session
    Unrecoverable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionError {
    pub kind: ErrorKind,
    #[serde(default)]
    pub phase: Option<PhaseName>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// One end-to-end orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub task: String,
    #[serde(default)]
    pub current_phase: Option<PhaseName>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transitions: Vec<PhaseTransition>,
    #[serde(default)]
    pub records: Vec<PhaseRecord>,
    /// Artifact paths produced so far, relative to the project root
    #[serde(default)]
    pub produced_files: Vec<String>,
    #[serde(default)]
    pub errors: Vec<SessionError>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Session {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task: task.into(),
            current_phase: None,
            status: SessionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            transitions: Vec::new(),
            records: Vec::new(),
            produced_files: Vec::new(),
            errors: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Move to `to`, appending to the transition log.
    pub fn transition(&mut self, to: Option<PhaseName>, reason: impl Into<String>) {
        self.transitions.push(PhaseTransition {
            from: self.current_phase,
            to,
            reason: reason.into(),
            at: Utc::now(),
        });
        if to.is_some() {
            self.current_phase = to;
        }
    }

    /// Append a closed record. Open records are rejected.
    pub fn push_record(&mut self, record: PhaseRecord) -> Result<()> {
        if !record.is_closed() {
            anyhow::bail!(
                "Refusing to store open record for phase {} attempt {}",
                record.phase,
                record.attempt
            );
        }
        self.records.push(record);
        Ok(())
    }

    pub fn record_error(
        &mut self,
        kind: ErrorKind,
        phase: Option<PhaseName>,
        message: impl Into<String>,
    ) {
        self.errors.push(SessionError {
            kind,
            phase,
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn add_produced_file(&mut self, path: &str) {
        if !self.produced_files.iter().any(|p| p == path) {
            self.produced_files.push(path.to_string());
        }
    }

    pub fn records_for(&self, phase: PhaseName) -> impl Iterator<Item = &PhaseRecord> {
        self.records.iter().filter(move |r| r.phase == phase)
    }

    /// Phase of the most recent successful record.
    pub fn last_successful_phase(&self) -> Option<PhaseName> {
        self.records.iter().rev().find(|r| r.succeeded()).map(|r| r.phase)
    }

    /// Sequence of phases in record order, one entry per attempt.
    pub fn phase_history(&self) -> Vec<PhaseName> {
        self.records.iter().map(|r| r.phase).collect()
    }

    pub fn finish(&mut self, status: SessionStatus, reason: impl Into<String>) {
        self.status = status;
        self.ended_at = Some(Utc::now());
        self.transition(None, reason);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
