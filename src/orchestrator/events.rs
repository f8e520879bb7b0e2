use serde::{Deserialize, Serialize};

use crate::session::{ErrorKind, PhaseName, PhaseOutcome, SessionStatus};
use crate::tasks::TaskState;

/// Events published on a session's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The run began.
    SessionStarted { session_id: String, task: String },
    /// The phase machine moved between phases. `to` is `None` for the final move.
    Transition {
        session_id: String,
        from: Option<PhaseName>,
        to: Option<PhaseName>,
        reason: String,
    },
    /// A phase attempt opened.
    PhaseStarted {
        session_id: String,
        phase: PhaseName,
        attempt: u32,
    },
    /// A phase attempt closed.
    PhaseCompleted {
        session_id: String,
        phase: PhaseName,
        attempt: u32,
        outcome: PhaseOutcome,
    },
    /// A generation task changed state during execute.
    TaskUpdated {
        session_id: String,
        task_id: String,
        target: String,
        state: TaskState,
    },
    /// An error was absorbed into the session error log.
    Error {
        session_id: String,
        kind: ErrorKind,
        phase: Option<PhaseName>,
        message: String,
    },
    /// The session reached a terminal status.
    SessionFinished {
        session_id: String,
        status: SessionStatus,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::SessionStarted { session_id, .. }
            | SessionEvent::Transition { session_id, .. }
            | SessionEvent::PhaseStarted { session_id, .. }
            | SessionEvent::PhaseCompleted { session_id, .. }
            | SessionEvent::TaskUpdated { session_id, .. }
            | SessionEvent::Error { session_id, .. }
            | SessionEvent::SessionFinished { session_id, .. } => session_id,
        }
    }

    /// Whether this is the last event of a session.
    pub fn is_final(&self) -> bool {
        matches!(self, SessionEvent::SessionFinished { .. })
    }
}
