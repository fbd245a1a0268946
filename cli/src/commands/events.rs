// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Event commands
//!
//! Commands: watch, emit

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use dispatcher_client::Event;

use super::ConnectArgs;

#[derive(Subcommand)]
pub enum EventsCommand {
    /// Print events matching the given masks until interrupted
    Watch {
        /// Event name masks, e.g. `task.*` or `*`
        #[arg(value_name = "MASK", default_value = "*")]
        masks: Vec<String>,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Publish an event (privileged)
    Emit {
        #[arg(value_name = "NAME")]
        name: String,

        /// Event payload as a JSON object
        #[arg(value_name = "ARGS", default_value = "{}")]
        args: String,
    },
}

pub async fn handle_command(command: EventsCommand, connect: &ConnectArgs) -> Result<()> {
    match command {
        EventsCommand::Watch { masks, json } => watch(connect, masks, json).await,
        EventsCommand::Emit { name, args } => emit(connect, &name, &args).await,
    }
}

async fn watch(connect: &ConnectArgs, masks: Vec<String>, json: bool) -> Result<()> {
    let client = connect.connect().await?;
    let mut events = client.events();
    let masks: Vec<&str> = masks.iter().map(String::as_str).collect();
    let active = client
        .subscribe(&masks)
        .await
        .context("Failed to subscribe")?;
    eprintln!("{} {}", "Watching".bold(), active.join(", "));

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => print_event(&event, json),
                Err(RecvError::Lagged(n)) => {
                    eprintln!("{}", format!("... {} events dropped", n).yellow());
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        if client.is_logged_out() || !client.is_connected() {
            eprintln!("{}", "Dispatcher closed the connection".yellow());
            break;
        }
    }

    client.close().await;
    Ok(())
}

async fn emit(connect: &ConnectArgs, name: &str, args: &str) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(args).with_context(|| format!("Event payload is not JSON: {}", args))?;
    let client = connect.connect().await?;
    let result = client.emit(name, payload).await;
    client.close().await;
    result?;
    println!("{}", format!("✓ Event published: {}", name).green());
    Ok(())
}

fn print_event(event: &Event, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Failed to encode event {}: {}", event.name, e),
        }
        return;
    }
    let timestamp = event.args["timestamp"]
        .as_str()
        .map(str::to_string)
        .or_else(|| event.args["timestamp"].as_f64().map(|t| t.to_string()))
        .unwrap_or_default();
    println!("{} {} {}", timestamp.dimmed(), event.name.cyan().bold(), event.args);
}
