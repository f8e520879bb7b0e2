//! Retry, timeout and iteration decisions for the phase machine.

use crate::config::PhaseLimits;
use crate::errors::InvocationError;
use crate::session::{ErrorKind, PhaseName, PhaseOutcome};

/// What the machine does after a closed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Advance,
    Retry,
    /// Retry budget spent on `needs-retry` outcomes
    Exhausted,
    Fail,
}

/// Decide the next step for attempt number `attempt` (1-based) of a phase.
pub fn decide(outcome: PhaseOutcome, attempt: u32, limits: &PhaseLimits) -> Decision {
    match outcome {
        PhaseOutcome::Success => Decision::Advance,
        PhaseOutcome::Failure => Decision::Fail,
        PhaseOutcome::NeedsRetry if attempt < limits.max_attempts() => Decision::Retry,
        PhaseOutcome::NeedsRetry => Decision::Exhausted,
    }
}

/// Outcome for a phase attempt that hit the phase timeout.
///
/// The first timeout within a phase is retried; a repeat fails the phase.
pub fn timeout_outcome(timeouts_so_far: u32) -> PhaseOutcome {
    if timeouts_so_far <= 1 {
        PhaseOutcome::NeedsRetry
    } else {
        PhaseOutcome::Failure
    }
}

/// Map a tool error onto a phase outcome.
///
/// Transient errors (timeouts, non-zero exits, human-input requests) are
/// retried; spawn failures and aborts end the session.
pub fn invocation_outcome(err: &InvocationError) -> (PhaseOutcome, ErrorKind) {
    if err.is_transient() {
        (PhaseOutcome::NeedsRetry, ErrorKind::Tool)
    } else {
        (PhaseOutcome::Failure, ErrorKind::Unrecoverable)
    }
}

/// Note appended to the next prompt after a tool asked for human input.
pub fn human_input_note(err: &InvocationError) -> Option<String> {
    match err {
        InvocationError::NeedsHumanInput { message } => Some(format!(
            "No human is available to answer \"{}\". Make a reasonable assumption, state it, and continue.",
            message.trim()
        )),
        _ => None,
    }
}

/// Where the observe loop goes after a completed iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveStep {
    /// Every route approved
    Approved,
    /// Loop back to execute with fix notes
    FixPass,
    /// Iteration budget spent; proceed to audit regardless
    ForceAudit,
}

pub fn observe_step(all_approved: bool, iterations: u32, max_iterations: u32) -> ObserveStep {
    if all_approved {
        ObserveStep::Approved
    } else if iterations < max_iterations {
        ObserveStep::FixPass
    } else {
        ObserveStep::ForceAudit
    }
}

/// Phase after `phase` in the fixed topology, ignoring the observe loop.
pub fn next_in_line(phase: PhaseName, visual_enabled: bool) -> Option<PhaseName> {
    match phase {
        PhaseName::Plan => Some(PhaseName::Execute),
        PhaseName::Execute if visual_enabled => Some(PhaseName::Observe),
        PhaseName::Execute | PhaseName::Observe => Some(PhaseName::Audit),
        PhaseName::Audit => Some(PhaseName::Commit),
        PhaseName::Commit => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits(max_retries: u32) -> PhaseLimits {
        PhaseLimits {
            max_retries,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_decide_respects_budget() {
        let l = limits(2);
        assert_eq!(decide(PhaseOutcome::Success, 1, &l), Decision::Advance);
        assert_eq!(decide(PhaseOutcome::NeedsRetry, 1, &l), Decision::Retry);
        assert_eq!(decide(PhaseOutcome::NeedsRetry, 2, &l), Decision::Retry);
        assert_eq!(decide(PhaseOutcome::NeedsRetry, 3, &l), Decision::Exhausted);
        assert_eq!(decide(PhaseOutcome::Failure, 1, &l), Decision::Fail);
        assert_eq!(decide(PhaseOutcome::NeedsRetry, 1, &limits(0)), Decision::Exhausted);
    }

    #[test]
    fn test_timeout_counts_once() {
        assert_eq!(timeout_outcome(1), PhaseOutcome::NeedsRetry);
        assert_eq!(timeout_outcome(2), PhaseOutcome::Failure);
    }

    #[test]
    fn test_invocation_outcome() {
        let (outcome, kind) = invocation_outcome(&InvocationError::NonZeroExit {
            code: 1,
            stderr: String::new(),
        });
        assert_eq!(outcome, PhaseOutcome::NeedsRetry);
        assert_eq!(kind, ErrorKind::Tool);

        let (outcome, _) = invocation_outcome(&InvocationError::Spawn {
            command: "x".into(),
            message: "not found".into(),
        });
        assert_eq!(outcome, PhaseOutcome::Failure);
    }

    #[test]
    fn test_human_input_note() {
        let note = human_input_note(&InvocationError::NeedsHumanInput {
            message: "which db?".into(),
        });
        assert!(note.unwrap().contains("which db?"));
        assert!(human_input_note(&InvocationError::Aborted("x".into())).is_none());
    }

    #[test]
    fn test_observe_step_bounded() {
        assert_eq!(observe_step(true, 1, 3), ObserveStep::Approved);
        assert_eq!(observe_step(false, 1, 3), ObserveStep::FixPass);
        assert_eq!(observe_step(false, 2, 3), ObserveStep::FixPass);
        assert_eq!(observe_step(false, 3, 3), ObserveStep::ForceAudit);
    }

    #[test]
    fn test_next_in_line() {
        assert_eq!(next_in_line(PhaseName::Execute, true), Some(PhaseName::Observe));
        assert_eq!(next_in_line(PhaseName::Execute, false), Some(PhaseName::Audit));
        assert_eq!(next_in_line(PhaseName::Commit, false), None);
    }
}
