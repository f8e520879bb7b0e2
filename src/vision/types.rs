//! Validation issues and results produced by the observe phase.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

impl Severity {
    /// Lenient parse of model-provided severities.
    pub fn from_loose(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "critical" | "blocker" | "high" => Severity::Critical,
            "minor" | "low" | "info" | "trivial" => Severity::Minor,
            _ => Severity::Major,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::Major => write!(f, "major"),
            Severity::Minor => write!(f, "minor"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationStatus {
    Approved,
    NeedsWork,
}

/// Screen area an issue refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub suggestion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
}

/// Verdict for one route or view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub target: String,
    pub status: ValidationStatus,
    pub issues: Vec<ValidationIssue>,
    #[serde(default)]
    pub summary: String,
}

impl ValidationResult {
    pub fn is_approved(&self) -> bool {
        self.status == ValidationStatus::Approved
    }
}

/// True when every result is approved. An empty set counts as approved.
pub fn all_approved(results: &[ValidationResult]) -> bool {
    results.iter().all(ValidationResult::is_approved)
}
