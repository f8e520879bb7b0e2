//! Session orchestration.
//!
//! The [`Orchestrator`] walks a session through a fixed topology:
//!
//! ```text
//! plan -> execute -> (observe -> execute)* -> audit -> commit
//! ```
//!
//! Observe runs only when a [`VisualValidator`](crate::vision::VisualValidator)
//! is attached, and loops back to execute at most `max_visual_iterations`
//! times. Every attempt becomes a closed [`PhaseRecord`](crate::session::PhaseRecord);
//! plugin hooks run around every attempt and a recovery point is written after
//! each one.
//!
//! [`SessionRegistry`] exposes the same engine as a background control plane
//! with status snapshots, cancellation and per-session event streams.

pub mod control;
pub mod engine;
pub mod events;
pub mod phases;
pub mod policy;

pub use control::{CancelFlag, RunControl, SessionRegistry};
pub use engine::{Orchestrator, RunResult};
pub use events::SessionEvent;
pub use phases::{AuditFinding, AuditReport, AuditVerdict, Plan, PlannedFile};
