//! Hook handlers: the in-process trait and the command-backed implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use super::types::{HookContext, HookResult};
use crate::errors::InvocationError;
use crate::llm::ShellCommand;

/// Exit code a command handler uses to stop propagation.
pub const STOP_PROPAGATION_EXIT_CODE: i32 = 2;

/// Handles one hook invocation.
///
/// Returning `Err` or panicking is recorded as a failed result by the host;
/// it never reaches other handlers or the orchestrator.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, context: &HookContext) -> Result<HookResult>;
}

/// Adapter for closures.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> HookHandler for FnHandler<F>
where
    F: Fn(&HookContext) -> Result<HookResult> + Send + Sync,
{
    async fn handle(&self, context: &HookContext) -> Result<HookResult> {
        (self.0)(context)
    }
}

/// Wrap a synchronous closure as a handler.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&HookContext) -> Result<HookResult> + Send + Sync,
{
    FnHandler(f)
}

/// Runs a shell command with the JSON context on stdin.
///
/// - stdout that parses as a JSON `HookResult` is used as-is
/// - exit 0 with other stdout succeeds with `{"inject": <stdout>}` as data
/// - exit 2 succeeds and stops propagation
/// - any other exit code fails with stderr as the error
pub struct CommandHandler {
    shell: ShellCommand,
    timeout: Duration,
}

impl CommandHandler {
    pub fn new(
        command: impl Into<String>,
        working_dir: impl AsRef<Path>,
        plugin: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            shell: ShellCommand::new(command, working_dir).env("CONDUCTOR_PLUGIN", plugin),
            timeout,
        }
    }

    pub fn command(&self) -> &str {
        self.shell.command()
    }

    fn parse_stdout(stdout: &str) -> HookResult {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return HookResult::ok();
        }
        if let Ok(result) = serde_json::from_str::<HookResult>(trimmed) {
            return result;
        }
        HookResult::with_data(serde_json::json!({ "inject": trimmed }))
    }
}

#[async_trait]
impl HookHandler for CommandHandler {
    async fn handle(&self, context: &HookContext) -> Result<HookResult> {
        let context_json =
            serde_json::to_vec(context).context("Failed to serialize hook context to JSON")?;

        let shell = self
            .shell
            .clone()
            .env("CONDUCTOR_EVENT", context.event.as_str())
            .env("CONDUCTOR_SESSION_ID", context.session_id.as_str())
            .env(
                "CONDUCTOR_PHASE",
                context.phase.map(|p| p.as_str()).unwrap_or(""),
            );

        match shell
            .run(&context_json, context.event.as_str(), self.timeout)
            .await
        {
            Ok(stdout) => Ok(Self::parse_stdout(&String::from_utf8_lossy(&stdout))),
            Err(InvocationError::NonZeroExit { code, stderr }) if code == STOP_PROPAGATION_EXIT_CODE => {
                let mut result = HookResult::ok().stop();
                if !stderr.is_empty() {
                    result.data = Some(serde_json::json!({ "reason": stderr }));
                }
                Ok(result)
            }
            Err(InvocationError::NonZeroExit { code, stderr }) => {
                let error = if stderr.is_empty() {
                    format!("Hook command failed with exit code {}", code)
                } else {
                    format!("Hook command failed (exit {}): {}", code, stderr)
                };
                Ok(HookResult::failed(error))
            }
            Err(e) => Err(e.into()),
        }
    }
}
