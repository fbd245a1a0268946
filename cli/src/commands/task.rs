// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Task operations commands
//!
//! Commands: submit, status, abort, list

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;

use dispatcher_client::{MiddlewareClient, TaskId, TaskRecord, TaskState};

use super::{parse_args, render, ConnectArgs};

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Submit a task to the balancer
    Submit {
        /// Registered task name, e.g. `pool.scrub`
        #[arg(value_name = "NAME")]
        name: String,

        /// Positional task arguments (JSON or plain strings)
        #[arg(value_name = "ARGS")]
        args: Vec<String>,

        /// Wait for the task to finish, rendering its progress
        #[arg(short, long)]
        wait: bool,
    },

    /// Show a task record
    Status {
        #[arg(value_name = "TASK_ID")]
        id: TaskId,
    },

    /// Abort a waiting or running task
    Abort {
        #[arg(value_name = "TASK_ID")]
        id: TaskId,
    },

    /// List recent tasks, newest first
    List {
        /// Maximum number of results
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Show the balancer queues instead
        #[arg(long)]
        queues: bool,
    },
}

pub async fn handle_command(command: TaskCommand, connect: &ConnectArgs) -> Result<()> {
    let client = connect.connect().await?;
    let result = match command {
        TaskCommand::Submit { name, args, wait } => submit(&client, &name, &args, wait).await,
        TaskCommand::Status { id } => status(&client, id).await,
        TaskCommand::Abort { id } => abort(&client, id).await,
        TaskCommand::List { limit, queues } => {
            if queues {
                list_queues(&client).await
            } else {
                list(&client, limit).await
            }
        }
    };
    client.close().await;
    result
}

async fn submit(client: &MiddlewareClient, name: &str, args: &[String], wait: bool) -> Result<()> {
    if !wait {
        let id = client.submit_task(name, parse_args(args)).await?;
        println!("{}", format!("✓ Task submitted: {}", id).green());
        return Ok(());
    }

    // Subscribe first so no update is lost between submit and the wait loop
    let mut events = client.events();
    client
        .subscribe(&["task.progress", "task.updated"])
        .await
        .context("Failed to subscribe to task events")?;
    let id = client.submit_task(name, parse_args(args)).await?;

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {pos:>3}% {msg}")?.progress_chars("=> "),
    );
    bar.set_message(format!("{} #{}", name, id));

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => {
                // Fall back to polling; progress rendering may skip a step
                if client.task_status(id).await?.state.is_terminal() {
                    break;
                }
                continue;
            }
            Err(RecvError::Closed) => {
                bar.abandon_with_message("connection closed");
                anyhow::bail!("Connection closed while waiting for task {}", id);
            }
        };
        if event.args["id"].as_u64() != Some(id) {
            continue;
        }

        match event.name.as_str() {
            "task.progress" => {
                let percent = event.args["percent"].as_f64().unwrap_or(0.0);
                bar.set_position(percent.clamp(0.0, 100.0) as u64);
                if let Some(message) = event.args["message"].as_str().filter(|m| !m.is_empty()) {
                    bar.set_message(message.to_string());
                }
            }
            "task.updated" => {
                let terminal = event.args["state"]
                    .as_str()
                    .and_then(TaskState::parse)
                    .is_some_and(TaskState::is_terminal);
                if terminal {
                    break;
                }
            }
            _ => {}
        }
    }

    let record = client.task_status(id).await?;
    match record.state {
        TaskState::Finished => {
            bar.finish_with_message("done");
            if let Some(result) = &record.result {
                println!("{}", render(result));
            }
            Ok(())
        }
        state => {
            bar.abandon_with_message(state.to_string());
            print_record(&record);
            std::process::exit(1);
        }
    }
}

async fn status(client: &MiddlewareClient, id: TaskId) -> Result<()> {
    let record = client.task_status(id).await?;
    print_record(&record);
    Ok(())
}

async fn abort(client: &MiddlewareClient, id: TaskId) -> Result<()> {
    client.abort_task(id).await?;
    println!("{}", format!("✓ Abort requested for task {}", id).green());
    Ok(())
}

async fn list(client: &MiddlewareClient, limit: usize) -> Result<()> {
    let tasks = client.list_tasks(Some(limit)).await?;
    if tasks.is_empty() {
        println!("{}", "No tasks found".yellow());
        return Ok(());
    }

    println!("{} tasks:", tasks.len());
    for task in &tasks {
        println!(
            "  {:>6}  {:<9}  {}  {}",
            task.id,
            format_state(task.state),
            task.name.bold(),
            task.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
    }
    Ok(())
}

async fn list_queues(client: &MiddlewareClient) -> Result<()> {
    let queues = client.list_queues().await?;
    if queues.is_empty() {
        println!("{}", "No queues".yellow());
        return Ok(());
    }

    for queue in &queues {
        let active = queue
            .active
            .map(|id| format!("#{}", id))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<24} {:?}  active: {}  waiting: {}",
            queue.name.bold(),
            queue.worker,
            active,
            queue.waiting.len()
        );
    }
    Ok(())
}

fn print_record(record: &TaskRecord) {
    println!("Task {}", record.id);
    println!("  Name: {}", record.name);
    println!("  State: {}", format_state(record.state));
    if let Some(queue) = &record.queue {
        println!("  Queue: {}", queue);
    }
    println!("  Created: {}", record.created_at);
    if let Some(started) = record.started_at {
        println!("  Started: {}", started);
    }
    if let Some(ended) = record.ended_at {
        println!("  Ended: {}", ended);
    }
    if let Some(progress) = &record.progress {
        println!("  Progress: {:.0}% {}", progress.percent, progress.message);
    }
    if let Some(result) = &record.result {
        println!("  Result: {}", render(result));
    }
    if let Some(error) = &record.error {
        println!("  Error: {}", error.message.red());
        if let Some(trace) = &error.trace {
            println!("{}", trace.dimmed());
        }
    }
}

fn format_state(state: TaskState) -> colored::ColoredString {
    match state {
        TaskState::Waiting => "WAITING".normal(),
        TaskState::Running => "RUNNING".yellow(),
        TaskState::Finished => "FINISHED".green(),
        TaskState::Failed => "FAILED".red(),
        TaskState::Aborted => "ABORTED".yellow(),
    }
}
