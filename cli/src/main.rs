// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # NAS middleware dispatcher
//!
//! The `dispatcherd` binary runs the dispatcher and doubles as its client.
//!
//! ## Commands
//!
//! - `dispatcherd run` - Serve the WebSocket protocol (default)
//! - `dispatcherd call <service.method> [ARGS...]` - One RPC call
//! - `dispatcherd task submit|status|abort|list` - Balancer operations
//! - `dispatcherd events watch|emit` - Event bus
//! - `dispatcherd config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use dispatcher_core::domain::node_config::{DispatcherConfig, LogFormat, LoggingConfig};
use nas_dispatcher::commands::{self, ConfigCommand, ConnectArgs, EventsCommand, TaskCommand};
use nas_dispatcher::{daemon, plugins};

/// NAS middleware dispatcher - RPC, tasks and events over one WebSocket
#[derive(Parser)]
#[command(name = "dispatcherd")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "DISPATCHER_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level or filter directive; overrides the configured level
    #[arg(long, global = true, env = "DISPATCHER_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(flatten)]
    connect: ConnectArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher in the foreground
    #[command(name = "run")]
    Run,

    /// Call a method, e.g. `discovery.get_services`
    #[command(name = "call")]
    Call {
        #[arg(value_name = "METHOD")]
        method: String,

        /// Positional arguments (JSON or plain strings)
        #[arg(value_name = "ARGS")]
        args: Vec<String>,
    },

    /// Task operations
    #[command(name = "task")]
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Event bus operations
    #[command(name = "events")]
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);

    let logging = match &command {
        Commands::Run => {
            let config = DispatcherConfig::load_or_default(cli.config.clone())
                .context("Failed to load configuration")?;
            let mut logging = config.spec.logging;
            if let Some(level) = cli.log_level {
                logging.level = level;
            }
            logging
        }
        // Client commands keep quiet unless asked
        _ => LoggingConfig {
            level: cli.log_level.unwrap_or_else(|| "warn".to_string()),
            format: LogFormat::Text,
        },
    };
    daemon::init_logging(&logging)?;

    match command {
        Commands::Run => {
            info!(version = env!("CARGO_PKG_VERSION"), "Starting dispatcherd");
            daemon::run_daemon(cli.config, plugins::compiled_plugins).await
        }
        Commands::Call { method, args } => {
            commands::call::handle_command(&cli.connect, method, args).await
        }
        Commands::Task { command } => commands::task::handle_command(command, &cli.connect).await,
        Commands::Events { command } => {
            commands::events::handle_command(command, &cli.connect).await
        }
        Commands::Config { command } => commands::config::handle_command(command, cli.config).await,
    }
}
