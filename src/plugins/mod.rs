//! Plugin system for extending the orchestration pipeline.
//!
//! Plugins observe and influence the pipeline through hooks invoked at every
//! phase boundary. A plugin declares its hooks in a manifest; the host
//! validates it, resolves its dependencies and registers its handlers.
//!
//! # Hook Events
//!
//! - `session_start` / `session_end` - once per session
//! - `before_phase` / `after_phase` - around every phase attempt
//! - `phase_retry` - an attempt ended in needs-retry
//! - `phase_failed` - a phase failed and the session is failing
//!
//! # Handlers
//!
//! - **In-process**: anything implementing [`HookHandler`].
//! - **Command**: a shell command receiving the JSON [`HookContext`] on stdin.
//!   JSON stdout is read as a [`HookResult`]; otherwise exit 0 succeeds,
//!   exit 2 succeeds and stops propagation, and anything else fails.
//!
//! # Isolation
//!
//! A handler that errors, panics or times out produces a failed
//! [`HandlerResult`] and the next handler still runs.
//!
//! # Usage
//!
//! ```ignore
//! use conductor::plugins::{HookContext, HookEvent, PluginHost};
//!
//! let mut host = PluginHost::new(hook_timeout);
//! let report = host.discover(&plugins_dir, &disabled);
//!
//! let outcome = host.execute(&HookContext::new(HookEvent::BeforePhase, &session)).await;
//! for extra in outcome.injections() {
//!     // Append to the next prompt
//! }
//! ```

pub mod handler;
pub mod host;
pub mod manifest;
pub mod types;

pub use handler::{CommandHandler, FnHandler, HookHandler, handler_fn};
pub use host::{LoadReport, LoadedPlugin, PluginHost};
pub use manifest::{ManifestIssue, PluginManifest};
pub use types::{HandlerResult, HookContext, HookEvent, HookOutcome, HookResult};
