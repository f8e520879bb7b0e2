//! Screenshot capture and vision analysis for the observe phase.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::parse::parse_vision_response;
use super::types::ValidationResult;
use crate::errors::InvocationError;
use crate::llm::ShellCommand;
use crate::prompts;

/// One captured view of a route.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub image: PathBuf,
    pub console_errors: Vec<String>,
}

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self, route: &str) -> Result<Capture, InvocationError>;
}

/// Vision model collaborator. Returns the raw, unparsed reply.
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn analyze(&self, capture: &Capture, route: &str) -> Result<String, InvocationError>;
}

/// File-name-safe form of a route.
fn route_slug(route: &str) -> String {
    let slug: String = route
        .trim_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if slug.is_empty() { "root".to_string() } else { slug }
}

fn join_url(base: &str, route: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        route.trim_start_matches('/')
    )
}

#[derive(Debug, Deserialize)]
struct CaptureReport {
    #[serde(default)]
    image: Option<PathBuf>,
    #[serde(default, alias = "consoleErrors")]
    console_errors: Vec<String>,
}

/// Captures a route by running a shell command.
///
/// The command sees `CONDUCTOR_ROUTE`, `CONDUCTOR_URL` and
/// `CONDUCTOR_OUTPUT`. It may print a JSON object
/// `{"image": ..., "console_errors": [...]}`; otherwise the screenshot is
/// expected at `CONDUCTOR_OUTPUT` and each non-empty stdout line is a
/// console error.
pub struct CommandCapture {
    command: String,
    working_dir: PathBuf,
    base_url: Option<String>,
    output_dir: PathBuf,
    timeout: Duration,
}

impl CommandCapture {
    pub fn new(
        command: impl Into<String>,
        working_dir: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
        timeout: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.as_ref().to_path_buf(),
            base_url: None,
            output_dir: output_dir.as_ref().to_path_buf(),
            timeout,
        }
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }

    fn output_path(&self, route: &str) -> PathBuf {
        self.output_dir.join(format!("{}.png", route_slug(route)))
    }
}

#[async_trait]
impl ScreenCapture for CommandCapture {
    async fn capture(&self, route: &str) -> Result<Capture, InvocationError> {
        let output = self.output_path(route);
        if let Err(e) = std::fs::create_dir_all(&self.output_dir) {
            return Err(InvocationError::Spawn {
                command: self.command.clone(),
                message: format!("cannot create {}: {}", self.output_dir.display(), e),
            });
        }

        let url = self
            .base_url
            .as_deref()
            .map(|base| join_url(base, route))
            .unwrap_or_default();
        let shell = ShellCommand::new(self.command.as_str(), &self.working_dir)
            .env("CONDUCTOR_ROUTE", route)
            .env("CONDUCTOR_URL", url)
            .env("CONDUCTOR_OUTPUT", output.to_string_lossy());
        let stdout = shell.run(b"", route, self.timeout).await?;
        let stdout = String::from_utf8_lossy(&stdout);

        if let Ok(report) = serde_json::from_str::<CaptureReport>(stdout.trim()) {
            return Ok(Capture {
                image: report.image.unwrap_or(output),
                console_errors: report.console_errors,
            });
        }

        Ok(Capture {
            image: output,
            console_errors: stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
        })
    }
}

/// Sends the vision prompt on stdin to a shell command.
///
/// The screenshot path is also exported as `CONDUCTOR_IMAGE`.
pub struct CommandVision {
    shell: ShellCommand,
    base_url: Option<String>,
    timeout: Duration,
}

impl CommandVision {
    pub fn new(command: impl Into<String>, working_dir: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            shell: ShellCommand::new(command, working_dir),
            base_url: None,
            timeout,
        }
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
impl VisionAnalyzer for CommandVision {
    async fn analyze(&self, capture: &Capture, route: &str) -> Result<String, InvocationError> {
        let image = capture.image.to_string_lossy().to_string();
        let url = self.base_url.as_deref().map(|base| join_url(base, route));
        let prompt = prompts::vision_prompt(route, url.as_deref(), &image, &capture.console_errors);
        let stdout = self
            .shell
            .clone()
            .env("CONDUCTOR_IMAGE", image)
            .run(prompt.as_bytes(), route, self.timeout)
            .await?;
        Ok(String::from_utf8_lossy(&stdout).to_string())
    }
}

/// Runs capture and analysis across every configured route.
pub struct VisualValidator {
    capture: Arc<dyn ScreenCapture>,
    vision: Arc<dyn VisionAnalyzer>,
    routes: Vec<String>,
}

impl VisualValidator {
    pub fn new(
        capture: Arc<dyn ScreenCapture>,
        vision: Arc<dyn VisionAnalyzer>,
        routes: Vec<String>,
    ) -> Self {
        let routes = if routes.is_empty() {
            vec!["/".to_string()]
        } else {
            routes
        };
        Self {
            capture,
            vision,
            routes,
        }
    }

    pub fn routes(&self) -> &[String] {
        &self.routes
    }

    async fn validate_route(&self, route: &str) -> Result<ValidationResult, InvocationError> {
        let capture = self.capture.capture(route).await?;
        let raw = self.vision.analyze(&capture, route).await?;
        let result = parse_vision_response(route, &raw, &capture.console_errors);
        tracing::debug!(
            route = %route,
            approved = result.is_approved(),
            issues = result.issues.len(),
            "Route validated"
        );
        Ok(result)
    }

    /// Validate every route, at most `max_concurrency` at a time.
    ///
    /// Results come back in route order. The first tool error fails the
    /// whole pass.
    pub async fn validate_all(
        &self,
        max_concurrency: usize,
    ) -> Result<Vec<ValidationResult>, InvocationError> {
        let pending: Vec<_> = self
            .routes
            .iter()
            .map(|route| self.validate_route(route))
            .collect();
        let results: Vec<Result<ValidationResult, InvocationError>> = stream::iter(pending)
            .buffered(max_concurrency.max(1))
            .collect()
            .await;
        results.into_iter().collect()
    }
}
