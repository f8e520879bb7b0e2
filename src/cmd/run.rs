//! Session execution command: `conductor run`.

use anyhow::{Context, Result, bail};
use console::style;
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use conductor::config::RunOptions;
use conductor::orchestrator::{RunResult, SessionEvent, SessionRegistry};
use conductor::session::{PhaseOutcome, SessionStatus};

use super::setup;
use crate::Cli;

/// Build run options from CLI flags. Metadata values are parsed as JSON
/// when possible and kept as strings otherwise.
pub fn run_options(
    max_visual_iterations: Option<u32>,
    max_concurrency: Option<usize>,
    phase_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    metadata: &[String],
) -> Result<RunOptions> {
    let mut options = RunOptions::default();
    if let Some(n) = max_visual_iterations {
        options = options.with_max_visual_iterations(n);
    }
    if let Some(n) = max_concurrency {
        options = options.with_max_concurrency(n);
    }
    if let Some(secs) = phase_timeout_secs {
        options = options.with_phase_timeout(Duration::from_secs(secs));
    }
    if let Some(n) = max_retries {
        options = options.with_max_retries(n);
    }

    let mut parsed = HashMap::new();
    for entry in metadata {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("Invalid --meta '{}': expected KEY=VALUE", entry);
        };
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        parsed.insert(key.trim().to_string(), value);
    }
    options.metadata = parsed;
    Ok(options)
}

fn read_task(task: &str) -> Result<String> {
    let task = if task == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read task from stdin")?;
        buf
    } else {
        task.to_string()
    };
    let task = task.trim().to_string();
    if task.is_empty() {
        bail!("Task description is empty");
    }
    Ok(task)
}

pub async fn cmd_run(
    cli: &Cli,
    project_dir: PathBuf,
    task: &str,
    options: RunOptions,
    commit: bool,
) -> Result<()> {
    let task = read_task(task)?;
    let config = setup::load_config(project_dir, cli.verbose)?;
    config.ensure_directories()?;

    let orchestrator = setup::build_orchestrator(&config, commit)?;
    let registry = SessionRegistry::new(Arc::new(orchestrator));

    let session_id = registry.start(&task, options).await;
    println!();
    println!("{} {}", style("Session").bold(), style(&session_id).cyan());
    println!();

    let mut events = registry
        .subscribe(&session_id)
        .await
        .context("Session disappeared before it could be observed")?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event, cli.verbose);
                    if event.is_final() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("{}", style("Cancelling after the current phase...").yellow());
                registry.cancel(&session_id).await;
            }
        }
    }

    let result = registry
        .wait(&session_id)
        .await
        .context("Session task did not return a result")?;
    registry.forget(&session_id).await;
    print_summary(&result);

    if !result.success() {
        match &result.error {
            Some(e) => bail!("Session {} {}: {}", session_id, result.status(), e),
            None => bail!("Session {} {}", session_id, result.status()),
        }
    }
    Ok(())
}

pub fn print_event(event: &SessionEvent, verbose: bool) {
    match event {
        SessionEvent::PhaseStarted { phase, attempt, .. } => {
            if *attempt > 1 {
                println!("{} {} (attempt {})", style("▶").cyan(), phase, attempt);
            } else {
                println!("{} {}", style("▶").cyan(), phase);
            }
        }
        SessionEvent::PhaseCompleted { phase, outcome, .. } => match outcome {
            PhaseOutcome::Success => println!("  {} {}", style("✓").green(), phase),
            PhaseOutcome::NeedsRetry => {
                println!("  {} {} needs retry", style("↻").yellow(), phase)
            }
            PhaseOutcome::Failure => println!("  {} {} failed", style("✗").red(), phase),
        },
        SessionEvent::TaskUpdated { target, state, .. } if verbose => {
            println!("    {} {:?}", style(target).dim(), state);
        }
        SessionEvent::Error { kind, message, .. } => {
            println!("  {} [{:?}] {}", style("!").yellow(), kind, message);
        }
        _ => {}
    }
}

pub fn print_summary(result: &RunResult) {
    let session = &result.session;
    println!();
    let status = match session.status {
        SessionStatus::Completed => style(session.status.to_string()).green().bold(),
        SessionStatus::Cancelled => style(session.status.to_string()).yellow().bold(),
        _ => style(session.status.to_string()).red().bold(),
    };
    println!("Session {}: {}", session.id, status);
    println!("  Attempts: {}", session.records.len());

    if !session.produced_files.is_empty() {
        println!("  Files:");
        for file in &session.produced_files {
            println!("    - {}", file);
        }
    }
    if !session.errors.is_empty() {
        println!("  Errors: {}", session.errors.len());
    }
    println!();
}
