//! Configuration for the conductor engine.
//!
//! Settings are read from `.conductor/conductor.toml` and layered:
//! file → environment → per-run options.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-app"
//! llm_cmd = "claude"
//! llm_args = ["--print"]
//!
//! [defaults]
//! max_retries = 2
//! max_concurrency = 4
//! phase_timeout_secs = 900
//! task_timeout_secs = 300
//! max_visual_iterations = 3
//! human_input_exit_code = 3
//!
//! [phases.execute]
//! max_retries = 3
//! timeout_secs = 1800
//!
//! [visual]
//! enabled = true
//! base_url = "http://localhost:3000"
//! routes = ["/", "/settings"]
//! capture_cmd = "./scripts/capture.sh"
//! vision_cmd = "claude --print"
//!
//! [checkpoint]
//! backup_contents = true
//! max_backup_bytes = 262144
//! max_consecutive_failures = 5
//!
//! [plugins]
//! hook_timeout_secs = 30
//! disabled = ["noisy-plugin"]
//!
//! [commit]
//! enabled = true
//! message_prefix = "conductor: "
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::PhaseName;

/// Name of the per-project state directory.
pub const CONDUCTOR_DIR: &str = ".conductor";

/// Project-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name (optional, defaults to directory name)
    #[serde(default)]
    pub name: Option<String>,
    /// LLM CLI command (default: "claude")
    #[serde(default)]
    pub llm_cmd: Option<String>,
    /// Extra arguments passed to every LLM invocation
    #[serde(default)]
    pub llm_args: Vec<String>,
}

/// Default limits for all phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Retries allowed after the first attempt of a phase
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Ceiling on concurrently running tasks and route captures
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    /// Timeout for a single external invocation inside a phase
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_max_visual_iterations")]
    pub max_visual_iterations: u32,
    /// Exit code an LLM CLI uses to ask for human input
    #[serde(default = "default_human_input_exit_code")]
    pub human_input_exit_code: i32,
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_concurrency() -> usize {
    4
}

fn default_phase_timeout_secs() -> u64 {
    900
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_max_visual_iterations() -> u32 {
    3
}

fn default_human_input_exit_code() -> i32 {
    3
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_concurrency: default_max_concurrency(),
            phase_timeout_secs: default_phase_timeout_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            max_visual_iterations: default_max_visual_iterations(),
            human_input_exit_code: default_human_input_exit_code(),
        }
    }
}

/// Per-phase override settings, keyed by phase name in `[phases.<name>]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Visual validation configuration section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisualSection {
    /// Whether the observe phase runs at all
    #[serde(default)]
    pub enabled: bool,
    /// Routes or views to capture each iteration
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Command that captures a screenshot. Receives the route JSON on stdin.
    #[serde(default)]
    pub capture_cmd: Option<String>,
    /// Command that analyzes a screenshot. Receives the prompt on stdin.
    #[serde(default)]
    pub vision_cmd: Option<String>,
}

/// Recovery point configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSection {
    /// Directory for recovery points, relative to `.conductor/` (default: "checkpoints")
    #[serde(default)]
    pub dir: Option<String>,
    /// Store full file contents alongside hashes
    #[serde(default = "default_backup_contents")]
    pub backup_contents: bool,
    /// Files larger than this are hashed but not backed up
    #[serde(default = "default_max_backup_bytes")]
    pub max_backup_bytes: u64,
    /// Fail the session after this many consecutive checkpoint write failures.
    /// Unset means checkpoint failures never fail a session.
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,
}

fn default_backup_contents() -> bool {
    true
}

fn default_max_backup_bytes() -> u64 {
    256 * 1024
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            dir: None,
            backup_contents: default_backup_contents(),
            max_backup_bytes: default_max_backup_bytes(),
            max_consecutive_failures: None,
        }
    }
}

/// Plugin configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsSection {
    /// Plugin directory, relative to `.conductor/` (default: "plugins")
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "default_hook_timeout_secs")]
    pub hook_timeout_secs: u64,
    /// Plugin names to skip during discovery
    #[serde(default)]
    pub disabled: Vec<String>,
}

fn default_hook_timeout_secs() -> u64 {
    30
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            dir: None,
            hook_timeout_secs: default_hook_timeout_secs(),
            disabled: Vec::new(),
        }
    }
}

/// Commit phase configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSection {
    #[serde(default = "default_commit_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub message_prefix: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
}

fn default_commit_enabled() -> bool {
    true
}

impl Default for CommitSection {
    fn default() -> Self {
        Self {
            enabled: default_commit_enabled(),
            message_prefix: None,
            author_name: None,
            author_email: None,
        }
    }
}

/// The complete conductor.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConductorToml {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    /// Phase-specific overrides keyed by phase name
    #[serde(default)]
    pub phases: HashMap<String, PhaseOverride>,
    #[serde(default)]
    pub visual: VisualSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub plugins: PluginsSection,
    #[serde(default)]
    pub commit: CommitSection,
}

impl ConductorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load configuration from `<conductor_dir>/conductor.toml`.
    /// Returns default configuration if the file doesn't exist.
    pub fn load_or_default(conductor_dir: &Path) -> Result<Self> {
        let config_path = conductor_dir.join("conductor.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Get the LLM command, with fallback to environment variable.
    pub fn llm_cmd(&self) -> String {
        self.project
            .llm_cmd
            .clone()
            .or_else(|| std::env::var("CONDUCTOR_LLM_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Resolve the effective settings for one run.
    pub fn resolve(&self, options: &RunOptions) -> RunSettings {
        let max_retries = options.max_retries.unwrap_or(self.defaults.max_retries);
        let phase_timeout = options
            .phase_timeout
            .unwrap_or(Duration::from_secs(self.defaults.phase_timeout_secs));

        let mut phase_limits = HashMap::new();
        for phase in PhaseName::all() {
            let mut limits = PhaseLimits {
                max_retries,
                timeout: phase_timeout,
            };
            if let Some(override_cfg) = self.phases.get(phase.as_str()) {
                if options.max_retries.is_none()
                    && let Some(retries) = override_cfg.max_retries
                {
                    limits.max_retries = retries;
                }
                if options.phase_timeout.is_none()
                    && let Some(secs) = override_cfg.timeout_secs
                {
                    limits.timeout = Duration::from_secs(secs);
                }
            }
            phase_limits.insert(*phase, limits);
        }

        RunSettings {
            max_concurrency: options
                .max_concurrency
                .unwrap_or(self.defaults.max_concurrency)
                .max(1),
            task_timeout: Duration::from_secs(self.defaults.task_timeout_secs),
            max_visual_iterations: options
                .max_visual_iterations
                .unwrap_or(self.defaults.max_visual_iterations),
            human_input_exit_code: self.defaults.human_input_exit_code,
            hook_timeout: Duration::from_secs(self.plugins.hook_timeout_secs),
            backup_contents: self.checkpoint.backup_contents,
            max_backup_bytes: self.checkpoint.max_backup_bytes,
            max_consecutive_checkpoint_failures: self.checkpoint.max_consecutive_failures,
            phase_limits,
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.defaults.max_concurrency == 0 {
            warnings.push("max_concurrency is 0; it will be treated as 1".to_string());
        }
        if self.defaults.phase_timeout_secs == 0 {
            warnings.push("phase_timeout_secs is 0; every phase will time out".to_string());
        }
        if self.defaults.task_timeout_secs == 0 {
            warnings.push("task_timeout_secs is 0; every invocation will time out".to_string());
        }

        for (name, override_cfg) in &self.phases {
            if name.parse::<PhaseName>().is_err() {
                warnings.push(format!(
                    "Unknown phase '{}' in [phases]; valid names: plan, execute, observe, audit, commit",
                    name
                ));
            }
            if override_cfg.timeout_secs == Some(0) {
                warnings.push(format!("timeout_secs is 0 for phase '{}'", name));
            }
        }

        if self.visual.enabled {
            if self.visual.routes.is_empty() {
                warnings.push("Visual validation is enabled but no routes are configured".into());
            }
            if self.visual.capture_cmd.is_none() {
                warnings.push("Visual validation is enabled but capture_cmd is not set".into());
            }
            if self.visual.vision_cmd.is_none() {
                warnings.push("Visual validation is enabled but vision_cmd is not set".into());
            }
            if self.defaults.max_visual_iterations == 0 {
                warnings.push(
                    "max_visual_iterations is 0; observe will be skipped straight to audit".into(),
                );
            }
        }

        if self.checkpoint.max_consecutive_failures == Some(0) {
            warnings.push(
                "max_consecutive_failures is 0; the first checkpoint failure fails the session"
                    .into(),
            );
        }

        warnings
    }
}

/// Per-run options supplied by the caller, layered over the file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_visual_iterations: Option<u32>,
    pub max_concurrency: Option<usize>,
    /// Applies to every phase, replacing per-phase overrides
    pub phase_timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    /// Free-form metadata copied onto the session
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RunOptions {
    pub fn with_max_visual_iterations(mut self, n: u32) -> Self {
        self.max_visual_iterations = Some(n);
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }
}

/// Retry budget and timeout for one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseLimits {
    pub max_retries: u32,
    pub timeout: Duration,
}

impl PhaseLimits {
    /// Total attempts allowed, counting the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_concurrency: usize,
    pub task_timeout: Duration,
    pub max_visual_iterations: u32,
    pub human_input_exit_code: i32,
    pub hook_timeout: Duration,
    pub backup_contents: bool,
    pub max_backup_bytes: u64,
    pub max_consecutive_checkpoint_failures: Option<u32>,
    phase_limits: HashMap<PhaseName, PhaseLimits>,
}

impl RunSettings {
    pub fn limits_for(&self, phase: PhaseName) -> PhaseLimits {
        self.phase_limits
            .get(&phase)
            .copied()
            .unwrap_or(PhaseLimits {
                max_retries: default_max_retries(),
                timeout: Duration::from_secs(default_phase_timeout_secs()),
            })
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        ConductorToml::default().resolve(&RunOptions::default())
    }
}

/// Project configuration: paths plus the parsed conductor.toml.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    pub project_dir: PathBuf,
    pub conductor_dir: PathBuf,
    pub toml: ConductorToml,
    pub verbose: bool,
}

impl ConductorConfig {
    /// Create a new ConductorConfig from a project directory.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let conductor_dir = project_dir.join(CONDUCTOR_DIR);
        let toml = ConductorToml::load_or_default(&conductor_dir)?;

        Ok(Self {
            project_dir,
            conductor_dir,
            toml,
            verbose: false,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.conductor_dir.join("conductor.toml")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.conductor_dir
            .join(self.toml.checkpoint.dir.as_deref().unwrap_or("checkpoints"))
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.conductor_dir
            .join(self.toml.plugins.dir.as_deref().unwrap_or("plugins"))
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.checkpoint_dir())
            .context("Failed to create checkpoint directory")?;
        std::fs::create_dir_all(self.plugins_dir())
            .context("Failed to create plugins directory")?;
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
