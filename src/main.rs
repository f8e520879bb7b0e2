use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Phase-driven agent orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a task through plan, execute, observe, audit and commit
    Run {
        /// Natural-language task. Use "-" to read it from stdin.
        task: String,

        /// Upper bound on observe/fix loops
        #[arg(long)]
        max_visual_iterations: Option<u32>,

        /// Upper bound on concurrently running tasks
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Per-phase timeout in seconds
        #[arg(long)]
        phase_timeout_secs: Option<u64>,

        /// Retries per phase after the first attempt
        #[arg(long)]
        max_retries: Option<u32>,

        /// Skip the git commit even when enabled in conductor.toml
        #[arg(long)]
        no_commit: bool,

        /// Attach metadata to the session (key=value)
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },
    /// Restore files of interrupted sessions from their recovery points
    Recover {
        /// Only recover this session
        #[arg(long)]
        session: Option<String>,

        /// Continue each recovered session from its next phase
        #[arg(long)]
        resume: bool,
    },
    /// List sessions that have a recovery point
    Sessions,
    /// Inspect installed plugins
    Plugins {
        #[command(subcommand)]
        command: Option<PluginsCommands>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum PluginsCommands {
    /// List plugins and the hooks they register
    List,
    /// Load every plugin manifest and report problems
    Validate,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate conductor.toml
    Validate,
    /// Write a default conductor.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(e) = conductor::logging::init_tracing(cli.verbose, cli.json_logs) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            task,
            max_visual_iterations,
            max_concurrency,
            phase_timeout_secs,
            max_retries,
            no_commit,
            metadata,
        } => {
            let options = cmd::run_options(
                *max_visual_iterations,
                *max_concurrency,
                *phase_timeout_secs,
                *max_retries,
                metadata,
            )?;
            cmd::cmd_run(&cli, project_dir, task, options, !*no_commit).await?;
        }
        Commands::Recover { session, resume } => {
            cmd::cmd_recover(&cli, project_dir, session.as_deref(), *resume).await?;
        }
        Commands::Sessions => cmd::cmd_sessions(project_dir)?,
        Commands::Plugins { command } => cmd::cmd_plugins(project_dir, command.clone())?,
        Commands::Config { command } => cmd::cmd_config(project_dir, command.clone())?,
    }

    Ok(())
}
