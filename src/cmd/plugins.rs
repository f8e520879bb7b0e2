//! Plugin inspection commands: `conductor plugins`.

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use conductor::plugins::HookEvent;

use super::super::PluginsCommands;
use super::setup;

pub fn cmd_plugins(project_dir: PathBuf, command: Option<PluginsCommands>) -> Result<()> {
    let config = setup::load_config(project_dir, false)?;
    let plugins_dir = config.plugins_dir();
    let (host, report) = setup::load_plugins(&config);

    match command {
        None | Some(PluginsCommands::List) => {
            println!();
            println!("Plugins in {}", plugins_dir.display());
            println!();

            if host.plugins().is_empty() {
                println!("No plugins loaded.");
            }
            for plugin in host.plugins() {
                let manifest = &plugin.manifest;
                println!(
                    "{} {}",
                    style(&manifest.name).bold(),
                    style(format!("v{}", manifest.version)).dim()
                );
                if !manifest.description.is_empty() {
                    println!("  {}", manifest.description);
                }
                for hook in manifest.hooks.keys() {
                    println!("  - {}", hook);
                }
                if !manifest.dependencies.is_empty() {
                    println!("  depends on: {}", manifest.dependencies.join(", "));
                }
            }

            if !report.skipped.is_empty() {
                println!();
                println!("Disabled: {}", report.skipped.join(", "));
            }
            if !report.errors.is_empty() {
                println!();
                println!("{}", style("Failed to load:").yellow());
                setup::print_load_errors(&report);
            }

            println!();
            println!("Handlers per hook:");
            for event in HookEvent::all() {
                println!("  {:<14} {}", event.as_str(), host.handler_count(*event));
            }
            println!();
        }
        Some(PluginsCommands::Validate) => {
            println!();
            println!("Validating plugins in {}...", plugins_dir.display());
            println!();

            for name in &report.loaded {
                println!("  {} {}", style("✓").green(), name);
            }
            setup::print_load_errors(&report);
            println!();

            if !report.is_clean() {
                anyhow::bail!("{} plugin(s) failed validation", report.errors.len());
            }
            println!("All plugins are valid.");
            println!();
        }
    }

    Ok(())
}
