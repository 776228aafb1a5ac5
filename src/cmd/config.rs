//! Configuration view and validation commands: `shipyard config`.

use std::path::Path;

use anyhow::{Context, Result};

use shipyard::config::ShipyardToml;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Shipyard Configuration");
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No shipyard.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let mut settings = ShipyardToml::load_or_default(config_path)?;
            settings
                .apply_env()
                .context("Invalid SHIPYARD_* environment override")?;
            println!("Effective values (with env overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(&settings).context("Failed to render configuration")?;
            print!("{}", rendered);
            println!();

            if !config_path.exists() {
                println!("Run 'shipyard config init' to create a shipyard.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No shipyard.toml found. Using defaults (valid).");
                return Ok(());
            }

            let settings = ShipyardToml::load(config_path)?;
            let warnings = settings.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
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
                println!("shipyard.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }

            ShipyardToml::default().save(config_path)?;

            println!("Created shipyard.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, dev_mode");
            println!("  - [namespace] backend, workspace_root, ready_timeout_secs");
            println!("  - [deploy] domain_suffix, service_port");
            println!();
        }
    }

    Ok(())
}
