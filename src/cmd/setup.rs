//! Builds runtime collaborators from `conductor.toml`.

use anyhow::{Context, Result};
use console::style;
use std::sync::Arc;
use std::time::Duration;

use conductor::artifacts::FsArtifactStore;
use conductor::checkpoint::{BackupPolicy, FileCheckpointStore, RecoveryManager};
use conductor::commit::GitCommitter;
use conductor::config::ConductorConfig;
use conductor::llm::CliInvoker;
use conductor::orchestrator::Orchestrator;
use conductor::plugins::{LoadReport, PluginHost};
use conductor::vision::{CommandCapture, CommandVision, VisualValidator};

pub fn load_config(project_dir: std::path::PathBuf, verbose: bool) -> Result<ConductorConfig> {
    let config = ConductorConfig::with_cli_args(project_dir, verbose)?;
    for warning in config.validate() {
        tracing::warn!(warning = %warning, "Configuration warning");
    }
    Ok(config)
}

pub fn recovery_manager(config: &ConductorConfig) -> RecoveryManager {
    let store = Arc::new(FileCheckpointStore::new(config.checkpoint_dir()));
    let artifacts = Arc::new(FsArtifactStore::new(&config.project_dir));
    RecoveryManager::new(store, artifacts).with_backup_policy(BackupPolicy {
        enabled: config.toml.checkpoint.backup_contents,
        max_bytes: config.toml.checkpoint.max_backup_bytes,
    })
}

pub fn load_plugins(config: &ConductorConfig) -> (PluginHost, LoadReport) {
    let mut host = PluginHost::new(Duration::from_secs(config.toml.plugins.hook_timeout_secs));
    let report = host.discover(&config.plugins_dir(), &config.toml.plugins.disabled);
    (host, report)
}

pub fn print_load_errors(report: &LoadReport) {
    for (source, error) in &report.errors {
        println!("  {} {}: {}", style("✗").red(), source, error);
    }
}

/// Assemble an orchestrator. `commit` is ANDed with `[commit] enabled`.
pub fn build_orchestrator(config: &ConductorConfig, commit: bool) -> Result<Orchestrator> {
    let toml = &config.toml;
    let llm = Arc::new(CliInvoker::new(
        &toml.llm_cmd(),
        &toml.project.llm_args,
        &config.project_dir,
        toml.defaults.human_input_exit_code,
    ));
    let artifacts = Arc::new(FsArtifactStore::new(&config.project_dir));
    let recovery = Arc::new(recovery_manager(config));

    let (plugins, report) = load_plugins(config);
    if !report.errors.is_empty() {
        println!("{}", style("Some plugins failed to load:").yellow());
        print_load_errors(&report);
    }

    let mut orchestrator =
        Orchestrator::new(llm, artifacts, recovery, toml.clone()).with_plugins(plugins);

    if toml.visual.enabled {
        let capture_cmd = toml
            .visual
            .capture_cmd
            .as_deref()
            .context("[visual] capture_cmd is required when visual validation is enabled")?;
        let vision_cmd = toml
            .visual
            .vision_cmd
            .as_deref()
            .context("[visual] vision_cmd is required when visual validation is enabled")?;
        let timeout = Duration::from_secs(toml.defaults.task_timeout_secs);

        let capture = CommandCapture::new(
            capture_cmd,
            &config.project_dir,
            config.conductor_dir.join("screenshots"),
            timeout,
        )
        .with_base_url(toml.visual.base_url.clone());
        let vision = CommandVision::new(vision_cmd, &config.project_dir, timeout)
            .with_base_url(toml.visual.base_url.clone());

        orchestrator = orchestrator.with_visual(VisualValidator::new(
            Arc::new(capture),
            Arc::new(vision),
            toml.visual.routes.clone(),
        ));
    }

    if commit && toml.commit.enabled {
        if GitCommitter::is_repository(&config.project_dir) {
            let committer = GitCommitter::new(&config.project_dir).with_author(
                toml.commit.author_name.as_deref(),
                toml.commit.author_email.as_deref(),
            );
            orchestrator = orchestrator.with_committer(Arc::new(committer));
        } else {
            tracing::warn!(
                project_dir = %config.project_dir.display(),
                "Commit enabled but project is not a git repository; skipping commits"
            );
        }
    }

    Ok(orchestrator)
}
