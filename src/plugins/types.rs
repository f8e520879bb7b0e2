//! Hook events, contexts and results.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::session::{PhaseName, PhaseOutcome, Session};

/// Extension points exposed at phase boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    /// Once, before the first phase
    SessionStart,
    /// Before every phase attempt
    BeforePhase,
    /// After every phase attempt, whatever its outcome
    AfterPhase,
    /// A phase attempt ended in needs-retry and will run again
    PhaseRetry,
    /// A phase failed and the session is about to fail
    PhaseFailed,
    /// Once, after the session reached a terminal status
    SessionEnd,
}

impl HookEvent {
    /// Returns all possible hook events.
    pub fn all() -> &'static [HookEvent] {
        &[
            HookEvent::SessionStart,
            HookEvent::BeforePhase,
            HookEvent::AfterPhase,
            HookEvent::PhaseRetry,
            HookEvent::PhaseFailed,
            HookEvent::SessionEnd,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::SessionStart => "session_start",
            HookEvent::BeforePhase => "before_phase",
            HookEvent::AfterPhase => "after_phase",
            HookEvent::PhaseRetry => "phase_retry",
            HookEvent::PhaseFailed => "phase_failed",
            HookEvent::SessionEnd => "session_end",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for HookEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "session_start" | "sessionstart" => Ok(HookEvent::SessionStart),
            "before_phase" | "beforephase" => Ok(HookEvent::BeforePhase),
            "after_phase" | "afterphase" => Ok(HookEvent::AfterPhase),
            "phase_retry" | "phaseretry" => Ok(HookEvent::PhaseRetry),
            "phase_failed" | "phasefailed" => Ok(HookEvent::PhaseFailed),
            "session_end" | "sessionend" => Ok(HookEvent::SessionEnd),
            _ => anyhow::bail!(
                "Invalid hook event '{}'. Valid values: session_start, before_phase, after_phase, phase_retry, phase_failed, session_end",
                s
            ),
        }
    }
}

/// Context passed to every handler of one hook invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookContext {
    pub event: HookEvent,
    pub session_id: String,
    pub task: String,
    #[serde(default)]
    pub phase: Option<PhaseName>,
    #[serde(default)]
    pub attempt: Option<u32>,
    #[serde(default)]
    pub outcome: Option<PhaseOutcome>,
    /// Effective configuration, as JSON
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl HookContext {
    pub fn new(event: HookEvent, session: &Session) -> Self {
        Self {
            event,
            session_id: session.id.clone(),
            task: session.task.clone(),
            phase: session.current_phase,
            attempt: None,
            outcome: None,
            config: serde_json::Value::Null,
            metadata: session.metadata.clone(),
        }
    }

    pub fn with_phase(mut self, phase: PhaseName, attempt: u32) -> Self {
        self.phase = Some(phase);
        self.attempt = Some(attempt);
        self
    }

    pub fn with_outcome(mut self, outcome: PhaseOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

fn default_true() -> bool {
    true
}

/// What a single handler returns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HookResult {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Skip the remaining handlers for this invocation
    #[serde(default, alias = "stopPropagation")]
    pub stop_propagation: bool,
}

impl Default for HookResult {
    fn default() -> Self {
        Self::ok()
    }
}

impl HookResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            stop_propagation: false,
        }
    }

    pub fn with_data(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Self::ok()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::ok()
        }
    }

    pub fn stop(mut self) -> Self {
        self.stop_propagation = true;
        self
    }
}

/// A handler's result tagged with where it came from.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HandlerResult {
    pub plugin: String,
    pub handler: String,
    pub result: HookResult,
    pub duration_ms: u64,
}

/// Everything collected from one hook invocation.
#[derive(Debug, Clone, Serialize)]
pub struct HookOutcome {
    pub event: HookEvent,
    pub results: Vec<HandlerResult>,
    /// Plugin whose handler requested early termination
    pub stopped_by: Option<String>,
    /// Handlers not run because of early termination
    pub skipped: usize,
}

impl HookOutcome {
    pub fn empty(event: HookEvent) -> Self {
        Self {
            event,
            results: Vec::new(),
            stopped_by: None,
            skipped: 0,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &HandlerResult> {
        self.results.iter().filter(|r| !r.result.success)
    }

    pub fn data(&self) -> impl Iterator<Item = &serde_json::Value> {
        self.results
            .iter()
            .filter(|r| r.result.success)
            .filter_map(|r| r.result.data.as_ref())
    }

    /// Text handlers asked to add to the next prompt, via `{"inject": "..."}` data.
    pub fn injections(&self) -> Vec<String> {
        self.data()
            .filter_map(|d| d.get("inject").and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect()
    }
}
