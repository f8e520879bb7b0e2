//! Prompt templates for each phase.
//!
//! Prompts are plain markdown. Phases that parse structured output (plan,
//! audit, vision) spell out the exact JSON shape they expect.

use crate::orchestrator::phases::{Plan, PlannedFile};
use crate::vision::{Severity, ValidationResult};

/// Extra instructions collected from plugins and corrective notes.
fn push_extra(prompt: &mut String, injections: &[String], corrective: Option<&str>) {
    if !injections.is_empty() {
        prompt.push_str("## Additional Instructions\n\n");
        for inject in injections {
            prompt.push_str(inject.trim());
            prompt.push_str("\n\n");
        }
    }
    if let Some(note) = corrective {
        prompt.push_str("## Correction\n\n");
        prompt.push_str("Your previous answer could not be used: ");
        prompt.push_str(note.trim());
        prompt.push_str("\nFollow the required format exactly.\n\n");
    }
}

/// Build the planning prompt.
pub fn plan_prompt(task: &str, injections: &[String], corrective: Option<&str>) -> String {
    let mut prompt = String::new();
    prompt.push_str("# Plan\n\n");
    prompt.push_str("Break the following task into the files that must be created or rewritten.\n\n");
    prompt.push_str("## Task\n\n");
    prompt.push_str(task.trim());
    prompt.push_str("\n\n");
    push_extra(&mut prompt, injections, corrective);
    prompt.push_str("## Output\n\n");
    prompt.push_str(
        "Respond with a single JSON object and nothing else:\n\n\
         ```json\n\
         {\"summary\": \"one paragraph\", \"files\": [{\"path\": \"relative/path.ext\", \"description\": \"what this file contains\"}]}\n\
         ```\n\n\
         Paths are relative to the project root. List each file once.\n",
    );
    prompt
}

/// Build the prompt that generates one planned file.
pub fn execute_prompt(
    task: &str,
    plan: &Plan,
    file: &PlannedFile,
    fix_notes: Option<&str>,
    injections: &[String],
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Generate `{}`\n\n", file.path));
    prompt.push_str("## Task\n\n");
    prompt.push_str(task.trim());
    prompt.push_str("\n\n## Plan\n\n");
    prompt.push_str(plan.summary.trim());
    prompt.push_str("\n\nFiles in this plan:\n");
    for planned in &plan.files {
        prompt.push_str(&format!("- `{}`: {}\n", planned.path, planned.description));
    }
    prompt.push_str(&format!(
        "\n## This File\n\n`{}`: {}\n\n",
        file.path, file.description
    ));
    if let Some(notes) = fix_notes {
        prompt.push_str("## Fix Required\n\n");
        prompt.push_str("Visual validation found these problems. Fix them in this file where relevant:\n\n");
        prompt.push_str(notes.trim());
        prompt.push_str("\n\n");
    }
    push_extra(&mut prompt, injections, None);
    prompt.push_str(
        "## Output\n\nRespond with the complete file content in one fenced code block. \
         Do not include explanations.\n",
    );
    prompt
}

/// Build the audit prompt over the produced files.
pub fn audit_prompt(
    task: &str,
    files: &[(String, String)],
    injections: &[String],
    corrective: Option<&str>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str("# Audit\n\n");
    prompt.push_str("Review the generated files against the task. Look for bugs, missing pieces and security problems.\n\n");
    prompt.push_str("## Task\n\n");
    prompt.push_str(task.trim());
    prompt.push_str("\n\n## Files\n\n");
    for (path, content) in files {
        prompt.push_str(&format!("### `{}`\n\n```\n{}\n```\n\n", path, content.trim_end()));
    }
    push_extra(&mut prompt, injections, corrective);
    prompt.push_str(
        "## Output\n\n\
         Respond with a single JSON object and nothing else:\n\n\
         ```json\n\
         {\"verdict\": \"pass\" | \"concerns\", \"findings\": [{\"severity\": \"critical|major|minor\", \"file\": \"path\", \"message\": \"...\"}], \"summary\": \"...\"}\n\
         ```\n",
    );
    prompt
}

/// Build the prompt sent to the vision model for one capture.
pub fn vision_prompt(route: &str, url: Option<&str>, image: &str, console_errors: &[String]) -> String {
    let mut prompt = String::new();
    prompt.push_str("# Visual Validation\n\n");
    prompt.push_str(&format!("Route: `{}`\n", route));
    if let Some(url) = url {
        prompt.push_str(&format!("URL: {}\n", url));
    }
    prompt.push_str(&format!("Screenshot: {}\n\n", image));
    if !console_errors.is_empty() {
        prompt.push_str("## Console Errors\n\n");
        for error in console_errors {
            prompt.push_str(&format!("- {}\n", error));
        }
        prompt.push('\n');
    }
    prompt.push_str(
        "Judge whether the page renders correctly and is usable.\n\n\
         Respond with a single JSON object and nothing else:\n\n\
         ```json\n\
         {\"status\": \"approved\" | \"needs-work\", \"issues\": [{\"severity\": \"critical|major|minor\", \"category\": \"layout\", \"description\": \"...\", \"suggestion\": \"...\"}], \"summary\": \"...\"}\n\
         ```\n",
    );
    prompt
}

/// Condense validation results into notes for the next execute pass.
pub fn fix_notes(results: &[ValidationResult]) -> String {
    let mut notes = String::new();
    for result in results.iter().filter(|r| !r.is_approved()) {
        notes.push_str(&format!("Route `{}`:\n", result.target));
        let mut issues: Vec<_> = result.issues.iter().collect();
        issues.sort_by_key(|i| i.severity);
        for issue in issues {
            let marker = match issue.severity {
                Severity::Critical => "!!",
                Severity::Major => "!",
                Severity::Minor => "-",
            };
            notes.push_str(&format!(
                "{} [{}] {}",
                marker, issue.category, issue.description
            ));
            if !issue.suggestion.is_empty() {
                notes.push_str(&format!(" (suggestion: {})", issue.suggestion));
            }
            notes.push('\n');
        }
    }
    notes
}

/// Default commit message for a finished session.
pub fn commit_message(prefix: Option<&str>, task: &str, files: &[String]) -> String {
    let headline = task.lines().next().unwrap_or("").trim();
    let headline: String = headline.chars().take(72).collect();
    let mut message = format!("{}{}\n", prefix.unwrap_or(""), headline);
    if !files.is_empty() {
        message.push('\n');
        for file in files {
            message.push_str(&format!("- {}\n", file));
        }
    }
    message
}
