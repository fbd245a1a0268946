// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use dispatcher_core::domain::node_config::{DispatcherConfig, UserConfig};
use dispatcher_core::infrastructure::auth::StaticAuthenticator;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./dispatcher.yaml")]
        output: PathBuf,

        /// Add a privileged `root` user with this password
        #[arg(long, value_name = "PASSWORD")]
        root_password: Option<String>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate {
            output,
            root_password,
            force,
        } => generate(&output, root_password.as_deref(), force),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. DISPATCHER_CONFIG_PATH: {}",
            std::env::var("DISPATCHER_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./dispatcher.yaml");
        println!("  4. ~/.config/dispatcher/config.yaml");
        println!("  5. /usr/local/etc/middleware.yaml");
        match config_override.clone().or_else(DispatcherConfig::discover_config) {
            Some(path) => println!("  Using: {}", path.display().to_string().green()),
            None => println!("  Using: {}", "built-in defaults".yellow()),
        }
        println!();
    }

    let config = DispatcherConfig::load_or_default(config_override)
        .context("Failed to load configuration")?;
    print!("{}", config.to_yaml_string()?);
    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = DispatcherConfig::load_or_default(config_path)
        .context("Failed to load configuration")?;
    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

fn generate(output: &Path, root_password: Option<&str>, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite", output.display());
    }

    let config = sample_config(root_password);
    config
        .to_yaml_file(output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );
    Ok(())
}

fn sample_config(root_password: Option<&str>) -> DispatcherConfig {
    let mut config = DispatcherConfig::default();
    if let Some(password) = root_password {
        config.spec.auth.users.push(UserConfig {
            username: "root".to_string(),
            password_sha256: StaticAuthenticator::hash_password(password),
            privileged: true,
        });
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_config_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatcher.yaml");

        generate(&path, Some("secret"), false).unwrap();
        let config = DispatcherConfig::from_yaml_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.spec.auth.users.len(), 1);
        assert!(config.spec.auth.users[0].privileged);
    }

    #[test]
    fn test_generate_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatcher.yaml");
        std::fs::write(&path, "keep me").unwrap();

        assert!(generate(&path, None, false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");

        generate(&path, None, true).unwrap();
        assert!(DispatcherConfig::from_yaml_file(&path).is_ok());
    }
}
