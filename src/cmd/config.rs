//! Configuration view and validation commands: `berth config`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use berth::config::BerthConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Berth Configuration");
            println!("===================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {}; using defaults", config_path.display());
            }
            println!();

            // Effective values: file, .env and BERTH_* overrides applied.
            let config = BerthConfig::load_with_env(config_path)?;
            let rendered = toml::to_string_pretty(&config.redacted())
                .context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No config file at {}", config_path.display());
                println!("Defaults will be used.");
                return Ok(());
            }

            let config = BerthConfig::load_with_env(config_path)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid: {}", config_path.display());
                println!("  workspaces seeded: {}", config.workspaces.len());
                println!("  agent tokens: {}", config.agent.tokens.len());
            } else {
                println!("Configuration has {} problem(s):", warnings.len());
                for warning in &warnings {
                    println!("  - {}", warning);
                }
                bail!("Invalid configuration: {}", config_path.display());
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory: {}", parent.display())
                })?;
            }
            BerthConfig::default().save(config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }

    Ok(())
}
