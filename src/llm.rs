//! External process invocation.
//!
//! Every collaborator the engine shells out to (the LLM CLI, plugin command
//! handlers, screenshot capture, the vision model) goes through
//! [`ShellCommand`], which enforces a timeout and maps exit codes onto
//! [`InvocationError`].

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::errors::InvocationError;
use crate::util::truncate_chars;

/// Exit codes `sh` uses when the command cannot be found or executed.
const SHELL_NOT_EXECUTABLE: i32 = 126;
const SHELL_NOT_FOUND: i32 = 127;

const MAX_STDERR_CHARS: usize = 2000;

/// A prompt sent to an LLM for one target.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub prompt: String,
    /// What the output is for: a file path, "plan", "audit" and so on
    pub target: String,
    pub timeout: Duration,
}

impl InvocationRequest {
    pub fn new(prompt: impl Into<String>, target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            target: target.into(),
            timeout,
        }
    }
}

/// LLM invocation collaborator.
#[async_trait]
pub trait LlmInvoker: Send + Sync {
    /// Name recorded as the agent on phase records.
    fn name(&self) -> &str;

    async fn invoke(&self, request: &InvocationRequest) -> Result<String, InvocationError>;
}

/// A shell command run with `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    command: String,
    working_dir: PathBuf,
    envs: Vec<(String, String)>,
    human_input_exit_code: Option<i32>,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.as_ref().to_path_buf(),
            envs: Vec::new(),
            human_input_exit_code: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Exit code that means "ask a human" rather than failure.
    pub fn human_input_exit_code(mut self, code: i32) -> Self {
        self.human_input_exit_code = Some(code);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run the command, feeding `stdin`, and return stdout on exit code 0.
    ///
    /// The child is killed if the timeout elapses.
    pub async fn run(
        &self,
        stdin: &[u8],
        target: &str,
        limit: Duration,
    ) -> Result<Vec<u8>, InvocationError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| InvocationError::Spawn {
            command: self.command.clone(),
            message: e.to_string(),
        })?;

        // Write stdin concurrently so a chatty child can't deadlock on a full pipe
        if let Some(mut pipe) = child.stdin.take() {
            let input = stdin.to_vec();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    tracing::debug!(error = %e, "Child closed stdin early");
                }
            });
        }

        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| InvocationError::Spawn {
                command: self.command.clone(),
                message: e.to_string(),
            })?,
            Err(_) => {
                return Err(InvocationError::Timeout {
                    target: target.to_string(),
                    after: limit,
                });
            }
        };

        let code = output.status.code().unwrap_or(-1);
        if code == 0 {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stderr = truncate_chars(&stderr, MAX_STDERR_CHARS);

        if Some(code) == self.human_input_exit_code {
            let message = if stderr.is_empty() {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            } else {
                stderr
            };
            return Err(InvocationError::NeedsHumanInput { message });
        }

        if code == SHELL_NOT_FOUND || code == SHELL_NOT_EXECUTABLE {
            return Err(InvocationError::Spawn {
                command: self.command.clone(),
                message: stderr,
            });
        }

        Err(InvocationError::NonZeroExit { code, stderr })
    }
}

/// Invokes an LLM CLI with the prompt on stdin and takes stdout as the reply.
pub struct CliInvoker {
    name: String,
    shell: ShellCommand,
}

impl CliInvoker {
    /// `args` are appended to `program` and interpreted by the shell.
    pub fn new(
        program: &str,
        args: &[String],
        working_dir: impl AsRef<Path>,
        human_input_exit_code: i32,
    ) -> Self {
        let command = if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        };
        let name = Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| program.to_string());

        Self {
            name,
            shell: ShellCommand::new(command, working_dir).human_input_exit_code(human_input_exit_code),
        }
    }
}

#[async_trait]
impl LlmInvoker for CliInvoker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<String, InvocationError> {
        tracing::debug!(
            llm = %self.name,
            for_target = %request.target,
            prompt_chars = request.prompt.len(),
            "Invoking LLM"
        );
        let shell = self
            .shell
            .clone()
            .env("CONDUCTOR_TARGET", request.target.as_str());
        let stdout = shell
            .run(request.prompt.as_bytes(), &request.target, request.timeout)
            .await?;
        Ok(String::from_utf8_lossy(&stdout).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(prompt: &str, secs: u64) -> InvocationRequest {
        InvocationRequest::new(prompt, "src/main.rs", Duration::from_secs(secs))
    }

    #[tokio::test]
    async fn test_cli_invoker_returns_stdout() {
        let dir = tempdir().unwrap();
        let llm = CliInvoker::new("cat", &[], dir.path(), 3);
        assert_eq!(llm.name(), "cat");

        let reply = llm.invoke(&request("hello prompt", 5)).await.unwrap();
        assert_eq!(reply, "hello prompt");
    }

    #[tokio::test]
    async fn test_cli_invoker_sees_target_env() {
        let dir = tempdir().unwrap();
        let llm = CliInvoker::new("sh", &["-c".into(), "'echo $CONDUCTOR_TARGET'".into()], dir.path(), 3);
        let reply = llm.invoke(&request("", 5)).await.unwrap();
        assert_eq!(reply.trim(), "src/main.rs");
    }

    #[tokio::test]
    async fn test_shell_command_non_zero_exit() {
        let dir = tempdir().unwrap();
        let shell = ShellCommand::new("echo broken >&2; exit 1", dir.path());
        let err = shell.run(b"", "t", Duration::from_secs(5)).await.unwrap_err();
        match err {
            InvocationError::NonZeroExit { code, stderr } => {
                assert_eq!(code, 1);
                assert_eq!(stderr, "broken");
            }
            other => panic!("Expected NonZeroExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shell_command_human_input_code() {
        let dir = tempdir().unwrap();
        let shell =
            ShellCommand::new("echo 'which database?'; exit 3", dir.path()).human_input_exit_code(3);
        let err = shell.run(b"", "t", Duration::from_secs(5)).await.unwrap_err();
        match err {
            InvocationError::NeedsHumanInput { message } => {
                assert_eq!(message, "which database?");
            }
            other => panic!("Expected NeedsHumanInput, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shell_command_timeout() {
        let dir = tempdir().unwrap();
        let shell = ShellCommand::new("sleep 5", dir.path());
        let err = shell
            .run(b"", "slow", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_shell_command_missing_program_is_not_transient() {
        let dir = tempdir().unwrap();
        let shell = ShellCommand::new("definitely-not-a-real-binary-xyz", dir.path());
        let err = shell.run(b"", "t", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, InvocationError::Spawn { .. }));
        assert!(!err.is_transient());
    }
}
