//! Phase payloads and the per-file generation executor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use crate::artifacts::ArtifactStore;
use crate::config::CONDUCTOR_DIR;
use crate::llm::{InvocationRequest, LlmInvoker};
use crate::prompts;
use crate::tasks::{Task, TaskExecutor, TaskFailure, TaskOutput};
use crate::util::{extract_json_object, strip_code_fence};
use crate::vision::Severity;

/// One file the plan asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedFile {
    pub path: String,
    #[serde(default)]
    pub description: String,
}

/// Output of the plan phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub summary: String,
    pub files: Vec<PlannedFile>,
}

impl Plan {
    pub fn file(&self, path: &str) -> Option<&PlannedFile> {
        self.files.iter().find(|f| f.path == path)
    }
}

/// Top-level directories generated files may never land in.
const RESERVED_DIRS: &[&str] = &[CONDUCTOR_DIR, ".git"];

fn is_safe_relative(path: &str) -> bool {
    let path = Path::new(path);
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        && path.components().any(|c| matches!(c, Component::Normal(_)))
}

fn is_reserved(path: &str) -> bool {
    Path::new(path)
        .components()
        .find(|c| !matches!(c, Component::CurDir))
        .is_some_and(|c| RESERVED_DIRS.iter().any(|dir| c.as_os_str() == *dir))
}

/// Parse the planner's reply. The error text is fed back as a correction.
pub fn parse_plan(raw: &str) -> Result<Plan, String> {
    let json = extract_json_object(raw).ok_or("the reply did not contain a JSON object")?;
    let mut plan: Plan =
        serde_json::from_str(&json).map_err(|e| format!("the plan JSON was malformed: {}", e))?;

    let mut seen = HashSet::new();
    for file in &mut plan.files {
        file.path = file.path.trim().trim_start_matches("./").to_string();
        if !is_safe_relative(&file.path) {
            return Err(format!(
                "file path '{}' must be relative and stay inside the project",
                file.path
            ));
        }
        if is_reserved(&file.path) {
            return Err(format!(
                "file path '{}' is inside a reserved directory ({})",
                file.path,
                RESERVED_DIRS.join(", ")
            ));
        }
        if !seen.insert(file.path.clone()) {
            return Err(format!("file path '{}' is listed more than once", file.path));
        }
    }
    if plan.files.is_empty() {
        return Err("the plan lists no files".to_string());
    }
    Ok(plan)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditVerdict {
    Pass,
    Concerns,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditFinding {
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub message: String,
}

/// Output of the audit phase. Findings are advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub verdict: AuditVerdict,
    #[serde(default)]
    pub findings: Vec<AuditFinding>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Deserialize)]
struct RawAudit {
    verdict: String,
    #[serde(default)]
    findings: Vec<RawFinding>,
    #[serde(default)]
    summary: String,
}

#[derive(Deserialize)]
struct RawFinding {
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default, alias = "description")]
    message: String,
}

/// Parse the auditor's reply. The error text is fed back as a correction.
pub fn parse_audit(raw: &str) -> Result<AuditReport, String> {
    let json = extract_json_object(raw).ok_or("the reply did not contain a JSON object")?;
    let audit: RawAudit =
        serde_json::from_str(&json).map_err(|e| format!("the audit JSON was malformed: {}", e))?;

    let verdict = match audit.verdict.trim().to_lowercase().as_str() {
        "pass" | "approved" | "ok" => AuditVerdict::Pass,
        "concerns" | "fail" | "needs-work" => AuditVerdict::Concerns,
        other => return Err(format!("unknown verdict '{}'", other)),
    };

    Ok(AuditReport {
        verdict,
        findings: audit
            .findings
            .into_iter()
            .filter(|f| !f.message.trim().is_empty())
            .map(|f| AuditFinding {
                severity: f.severity.as_deref().map_or(Severity::Major, Severity::from_loose),
                file: f.file,
                message: f.message,
            })
            .collect(),
        summary: audit.summary,
    })
}

/// Generates one planned file per task and writes it to the artifact store.
pub struct FileGenerator {
    pub llm: Arc<dyn LlmInvoker>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub task: String,
    pub plan: Arc<Plan>,
    pub fix_notes: Option<String>,
    pub injections: Vec<String>,
    pub timeout: Duration,
}

#[async_trait]
impl TaskExecutor for FileGenerator {
    async fn execute(&self, task: &Task) -> Result<TaskOutput, TaskFailure> {
        let file = self
            .plan
            .file(&task.target)
            .ok_or_else(|| TaskFailure::fatal(format!("{} is not in the plan", task.target)))?;

        let prompt = prompts::execute_prompt(
            &self.task,
            &self.plan,
            file,
            self.fix_notes.as_deref(),
            &self.injections,
        );
        let reply = self
            .llm
            .invoke(&InvocationRequest::new(prompt, &task.target, self.timeout))
            .await?;

        let content = strip_code_fence(&reply);
        if content.trim().is_empty() {
            return Err(TaskFailure::transient(format!(
                "empty output for {}",
                task.target
            )));
        }

        self.artifacts
            .write(&task.target, content.as_bytes())
            .map_err(|e| TaskFailure::fatal(format!("{:#}", e)))?;

        Ok(TaskOutput {
            artifact: Some(task.target.clone()),
            bytes: content.len(),
        })
    }
}
