//! Recovery commands: `conductor recover` and `conductor sessions`.

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use conductor::checkpoint::RecoveryReport;
use conductor::config::RunOptions;

use super::run::print_summary;
use super::setup;
use crate::Cli;

pub async fn cmd_recover(
    cli: &Cli,
    project_dir: PathBuf,
    session: Option<&str>,
    resume: bool,
) -> Result<()> {
    let config = setup::load_config(project_dir, cli.verbose)?;
    let recovery = setup::recovery_manager(&config);

    let reports = match session {
        Some(id) => vec![recovery.recover(id)?],
        None => recovery.recover_all()?,
    };

    println!();
    if reports.is_empty() {
        println!("No interrupted sessions.");
        return Ok(());
    }

    for report in &reports {
        print_report(report);
    }

    if !resume {
        println!("Run with --resume to continue recovered sessions.");
        return Ok(());
    }

    let orchestrator = setup::build_orchestrator(&config, true)?;
    let mut failed = 0;
    for report in reports.into_iter().filter(|r| r.recovered) {
        let session_id = report.session_id.clone();
        println!("{} {}", style("Resuming").bold(), style(&session_id).cyan());
        let result = orchestrator.resume(report, RunOptions::default()).await?;
        print_summary(&result);
        if !result.success() {
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} resumed session(s) did not complete", failed);
    }
    Ok(())
}

fn print_report(report: &RecoveryReport) {
    let phase = report
        .phase
        .map(|p| p.to_string())
        .unwrap_or_else(|| "start".to_string());
    if !report.recovered {
        println!(
            "{} {} (nothing to recover)",
            style("·").dim(),
            report.session_id
        );
        return;
    }

    println!(
        "{} {} at {}",
        style("✓").green(),
        style(&report.session_id).bold(),
        phase
    );
    if !report.restored.is_empty() {
        println!("  restored:  {}", report.restored.join(", "));
    }
    if !report.rewritten.is_empty() {
        println!("  rewritten: {}", report.rewritten.join(", "));
    }
    if !report.drifted.is_empty() {
        println!(
            "  {} changed since checkpoint: {}",
            style("drifted").yellow(),
            report.drifted.join(", ")
        );
    }
    for failure in &report.failed {
        println!(
            "  {} {}: {}",
            style("✗").red(),
            failure.path,
            failure.reason
        );
    }
    println!();
}

/// First line of the task, shortened for a table cell.
fn task_headline(task: &str) -> String {
    let line = task.lines().next().unwrap_or("").trim();
    if line.chars().count() > 50 {
        format!("{}...", line.chars().take(47).collect::<String>())
    } else {
        line.to_string()
    }
}

pub fn cmd_sessions(project_dir: PathBuf) -> Result<()> {
    let config = setup::load_config(project_dir, false)?;
    let recovery = setup::recovery_manager(&config);
    let points = recovery.list()?;

    println!();
    if points.is_empty() {
        println!("No sessions with recovery points.");
        return Ok(());
    }

    let header = format!(
        "{:<38} {:<10} {:<8} {:<20} {}",
        "SESSION", "STATUS", "PHASE", "WRITTEN", "TASK"
    );
    println!("{}", style(header).bold());
    for point in &points {
        let phase = point
            .phase
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<10} {:<8} {:<20} {}",
            point.session_id,
            point.session.status.to_string(),
            phase,
            point.written_at.format("%Y-%m-%d %H:%M:%S"),
            task_headline(&point.session.task)
        );
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_headline() {
        assert_eq!(task_headline("short task\nmore detail"), "short task");
        let long = "x".repeat(80);
        let headline = task_headline(&long);
        assert_eq!(headline.chars().count(), 50);
        assert!(headline.ends_with("..."));
    }
}
