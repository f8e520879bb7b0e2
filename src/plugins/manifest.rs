//! Plugin manifests.
//!
//! A manifest lives next to the plugin as `plugin.toml` or `plugin.json`:
//!
//! ```toml
//! name = "lint-gate"
//! version = "0.2.0"
//! description = "Runs the linter after every execute attempt"
//! entry = "./run.sh"
//! dependencies = ["formatter"]
//!
//! [hooks]
//! after_phase = "after"
//! session_end = "report"
//! ```
//!
//! Every hook value is a handler reference. For command plugins the handler
//! runs as `<entry> <handler>`, or as the handler alone when there is no entry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::types::HookEvent;
use crate::errors::PluginError;

/// One problem found while validating a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestIssue {
    pub field: String,
    pub message: String,
}

impl ManifestIssue {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ManifestIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PluginManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub entry: Option<String>,
    /// Hook name → handler reference
    #[serde(default)]
    pub hooks: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PluginManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "0.1.0".to_string(),
            ..Default::default()
        }
    }

    pub fn with_hook(mut self, event: HookEvent, handler: impl Into<String>) -> Self {
        self.hooks.insert(event.as_str().to_string(), handler.into());
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    pub fn parse_toml(content: &str, source_name: &str) -> Result<Self, PluginError> {
        toml::from_str(content).map_err(|e| PluginError::InvalidManifest {
            source_name: source_name.to_string(),
            issues: vec![ManifestIssue::new("<document>", e.to_string())],
        })
    }

    pub fn parse_json(content: &str, source_name: &str) -> Result<Self, PluginError> {
        serde_json::from_str(content).map_err(|e| PluginError::InvalidManifest {
            source_name: source_name.to_string(),
            issues: vec![ManifestIssue::new("<document>", e.to_string())],
        })
    }

    /// Read a manifest file, choosing the format by extension.
    pub fn load(path: &Path) -> Result<Self, PluginError> {
        let content = std::fs::read_to_string(path).map_err(|source| PluginError::ManifestRead {
            path: path.to_path_buf(),
            source,
        })?;
        let source_name = path.display().to_string();
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::parse_json(&content, &source_name)
        } else {
            Self::parse_toml(&content, &source_name)
        }
    }

    /// Every problem with the manifest, empty when valid.
    pub fn validate(&self) -> Vec<ManifestIssue> {
        let mut issues = Vec::new();

        if self.name.trim().is_empty() {
            issues.push(ManifestIssue::new("name", "must not be empty"));
        } else if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            issues.push(ManifestIssue::new(
                "name",
                format!("'{}' may only contain letters, digits, '-', '_' and '.'", self.name),
            ));
        }

        if self.hooks.is_empty() {
            issues.push(ManifestIssue::new("hooks", "at least one hook must be declared"));
        }
        for (hook, handler) in &self.hooks {
            if hook.parse::<HookEvent>().is_err() {
                issues.push(ManifestIssue::new(
                    format!("hooks.{}", hook),
                    "unknown hook name",
                ));
            }
            if handler.trim().is_empty() {
                issues.push(ManifestIssue::new(
                    format!("hooks.{}", hook),
                    "handler reference must not be empty",
                ));
            }
        }

        let mut seen = Vec::new();
        for dep in &self.dependencies {
            if dep.trim().is_empty() {
                issues.push(ManifestIssue::new("dependencies", "empty dependency name"));
            } else if dep == &self.name {
                issues.push(ManifestIssue::new("dependencies", "plugin cannot depend on itself"));
            } else if seen.contains(&dep) {
                issues.push(ManifestIssue::new(
                    "dependencies",
                    format!("'{}' listed more than once", dep),
                ));
            }
            seen.push(dep);
        }

        if let Some(entry) = &self.entry
            && entry.trim().is_empty()
        {
            issues.push(ManifestIssue::new("entry", "must not be empty when given"));
        }

        issues
    }

    /// Fail with the full issue list if the manifest is invalid.
    pub fn ensure_valid(&self, source_name: &str) -> Result<(), PluginError> {
        let issues = self.validate();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(PluginError::InvalidManifest {
                source_name: source_name.to_string(),
                issues,
            })
        }
    }

    /// Declared hooks as (event, handler reference). Only meaningful after validation.
    pub fn hook_bindings(&self) -> Vec<(HookEvent, &str)> {
        self.hooks
            .iter()
            .filter_map(|(hook, handler)| {
                hook.parse::<HookEvent>()
                    .ok()
                    .map(|event| (event, handler.as_str()))
            })
            .collect()
    }

    /// Shell command for a handler reference.
    pub fn command_for(&self, handler: &str) -> String {
        match &self.entry {
            Some(entry) => format!("{} {}", entry, handler),
            None => handler.to_string(),
        }
    }
}
