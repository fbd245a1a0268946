// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Runs the dispatcher until `management.die`, a signal, or a fatal error.
//! `management.restart` tears the runtime down and boots a fresh one from
//! the same configuration file.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use dispatcher_core::application::plugin_loader::Plugin;
use dispatcher_core::domain::node_config::DispatcherConfig;
use dispatcher_core::{presentation, DispatcherBuilder, ShutdownReason};

use super::PidFile;

/// Builds the compiled-in plugin set; called once per boot
pub type PluginFactory = fn() -> Vec<Arc<dyn Plugin>>;

pub async fn run_daemon(config_path: Option<PathBuf>, plugins: PluginFactory) -> Result<()> {
    let mut generation = 0u32;
    let mut pidfile: Option<PidFile> = None;

    loop {
        generation += 1;
        let config = load_config(config_path.clone())?;

        if pidfile.as_ref().map(|p| p.path()) != config.spec.pidfile.as_deref() {
            pidfile = None;
            if let Some(path) = &config.spec.pidfile {
                pidfile = Some(PidFile::create(path)?);
            }
        }

        info!(generation, pid = std::process::id(), "Dispatcher starting");
        let reason = run_once(config, plugins).await?;

        match reason {
            ShutdownReason::Restart => {
                info!(generation, "Dispatcher restarting");
            }
            ShutdownReason::Die => {
                info!(generation, "Dispatcher stopped");
                return Ok(());
            }
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<DispatcherConfig> {
    let config = DispatcherConfig::load_or_default(path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

async fn run_once(config: DispatcherConfig, plugins: PluginFactory) -> Result<ShutdownReason> {
    // Bind before booting so a taken port fails fast
    let listener = presentation::bind(&config.spec.server).await?;

    let dispatcher = DispatcherBuilder::new(config)
        .plugins(plugins())
        .build()
        .await
        .context("Failed to start dispatcher")?;

    let mut server = tokio::spawn(presentation::serve(dispatcher.clone(), listener));

    let reason = tokio::select! {
        reason = dispatcher.wait_for_shutdown() => reason,
        _ = shutdown_signal() => {
            dispatcher.request_shutdown(ShutdownReason::Die);
            dispatcher.wait_for_shutdown().await
        }
        joined = &mut server => {
            // The endpoint died on its own; take the runtime down with it
            dispatcher.stop().await;
            return match joined {
                Ok(Ok(())) => Ok(ShutdownReason::Die),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("WebSocket server panicked: {}", e)),
            };
        }
    };

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "WebSocket server failed during shutdown"),
        Err(e) => error!(error = %e, "WebSocket server panicked during shutdown"),
    }
    dispatcher.stop().await;
    Ok(reason)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
