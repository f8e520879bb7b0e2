//! Turning free-text vision responses into validation results.

use serde::Deserialize;

use super::types::{Region, Severity, ValidationIssue, ValidationResult, ValidationStatus};
use crate::util::extract_json_object;

pub const PARSE_ERROR_CATEGORY: &str = "parse-error";
pub const PARSE_ERROR_DESCRIPTION: &str = "response could not be parsed";
pub const CONSOLE_ERROR_CATEGORY: &str = "console-error";

#[derive(Debug, Deserialize)]
struct RawResponse {
    status: String,
    #[serde(default)]
    issues: Vec<RawIssue>,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "fix", alias = "remedy")]
    suggestion: Option<String>,
    #[serde(default)]
    region: Option<Region>,
}

fn parse_status(status: &str) -> Option<ValidationStatus> {
    match status.trim().to_lowercase().replace('_', "-").as_str() {
        "approved" | "pass" | "ok" => Some(ValidationStatus::Approved),
        "needs-work" | "fail" | "rejected" => Some(ValidationStatus::NeedsWork),
        _ => None,
    }
}

fn parse_structured(raw: &str) -> Option<(ValidationStatus, Vec<ValidationIssue>, String)> {
    let json = extract_json_object(raw)?;
    let response: RawResponse = serde_json::from_str(&json).ok()?;
    let status = parse_status(&response.status)?;
    let issues = response
        .issues
        .into_iter()
        .filter(|i| !i.description.trim().is_empty())
        .map(|i| ValidationIssue {
            severity: i.severity.as_deref().map_or(Severity::Major, Severity::from_loose),
            category: i.category.unwrap_or_else(|| "visual".to_string()),
            description: i.description,
            suggestion: i.suggestion.unwrap_or_default(),
            region: i.region,
        })
        .collect();
    Some((status, issues, response.summary))
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Whether `error` is already covered by an issue description.
fn is_reflected(error: &str, issues: &[ValidationIssue]) -> bool {
    let error = normalize(error);
    issues.iter().any(|issue| {
        let description = normalize(&issue.description);
        description == error || description.contains(&error) || error.contains(&description)
    })
}

/// Parse a vision response for `target`, folding in captured console errors.
///
/// Never fails: an unusable response becomes a single parse-error issue.
pub fn parse_vision_response(target: &str, raw: &str, console_errors: &[String]) -> ValidationResult {
    let (mut status, mut issues, summary) = match parse_structured(raw) {
        Some(parsed) => parsed,
        None => {
            tracing::warn!(route = %target, "Vision response could not be parsed");
            (
                ValidationStatus::NeedsWork,
                vec![ValidationIssue {
                    severity: Severity::Major,
                    category: PARSE_ERROR_CATEGORY.to_string(),
                    description: PARSE_ERROR_DESCRIPTION.to_string(),
                    suggestion: "Re-run visual validation".to_string(),
                    region: None,
                }],
                String::new(),
            )
        }
    };

    for error in console_errors {
        if error.trim().is_empty() || is_reflected(error, &issues) {
            continue;
        }
        issues.push(ValidationIssue {
            severity: Severity::Major,
            category: CONSOLE_ERROR_CATEGORY.to_string(),
            description: error.trim().to_string(),
            suggestion: "Fix the error reported in the browser console".to_string(),
            region: None,
        });
        status = ValidationStatus::NeedsWork;
    }

    ValidationResult {
        target: target.to_string(),
        status,
        issues,
        summary,
    }
}
