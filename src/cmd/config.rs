//! Configuration view and validation commands: `conductor config`.

use anyhow::{Context, Result};
use console::style;
use std::path::PathBuf;

use conductor::config::{CONDUCTOR_DIR, ConductorToml};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: PathBuf, command: Option<ConfigCommands>) -> Result<()> {
    let conductor_dir = project_dir.join(CONDUCTOR_DIR);
    let config_path = conductor_dir.join("conductor.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                ConductorToml::load(&config_path)?
            } else {
                println!("No conductor.toml found. Showing defaults.");
                ConductorToml::default()
            };
            println!("LLM command: {}", toml.llm_cmd());
            println!();

            let rendered =
                toml::to_string_pretty(&toml).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No conductor.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ConductorToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("{}", style("Configuration is valid.").green());
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("conductor.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&conductor_dir).with_context(|| {
                format!("Failed to create {}", conductor_dir.display())
            })?;

            ConductorToml::default().save(&config_path)?;

            println!("Created conductor.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [project] llm_cmd, llm_args");
            println!("  - [defaults] max_retries, max_concurrency, phase_timeout_secs");
            println!("  - [phases.<name>] per-phase retries and timeouts");
            println!("  - [visual] routes, capture_cmd, vision_cmd");
            println!();
        }
    }

    Ok(())
}
