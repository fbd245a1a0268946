// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! `management`: runtime status and lifecycle. Every method requires a
//! privileged session.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use crate::application::dispatcher::{DispatcherRef, ShutdownReason};
use crate::application::rpc_context::RpcService;
use crate::domain::error::RpcError;
use crate::domain::service::{CallContext, MethodDescriptor};
use crate::domain::task::TaskState;

pub struct ManagementService {
    dispatcher: DispatcherRef,
}

impl ManagementService {
    pub fn new(dispatcher: DispatcherRef) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl RpcService for ManagementService {
    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![
            MethodDescriptor::new("status")
                .description("Uptime, sessions, plugins, queues, hooks and event sources")
                .privileged(),
            MethodDescriptor::new("reload_plugins")
                .description("Re-read plugin descriptors and load plugins not loaded yet")
                .privileged(),
            MethodDescriptor::new("restart")
                .description("Stop the runtime and boot a fresh one")
                .privileged()
                .pass_sender(),
            MethodDescriptor::new("die")
                .description("Stop the runtime and exit")
                .privileged()
                .pass_sender(),
        ]
    }

    async fn call(&self, method: &str, _args: Vec<Value>, ctx: &CallContext) -> Result<Value, RpcError> {
        let dispatcher = self.dispatcher.get()?;
        match method {
            "status" => {
                let balancer = dispatcher.balancer();
                let config = dispatcher.config();
                let started_at = dispatcher.started_at();
                Ok(json!({
                    "name": config.metadata.name,
                    "version": env!("CARGO_PKG_VERSION"),
                    "started_at": started_at.to_rfc3339(),
                    "uptime": (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0,
                    "host_tags": dispatcher.plugins().host_tags(),
                    "sessions": dispatcher.sessions().len(),
                    "plugins": dispatcher.plugins().infos(),
                    "services": dispatcher.rpc().get_services(),
                    "event_sources": dispatcher.event_source_names(),
                    "hooks": dispatcher.hooks().names(),
                    "queues": balancer.list_queues(),
                    "tasks": {
                        "waiting": balancer.get_tasks(TaskState::Waiting).len(),
                        "running": balancer.get_active_tasks().len(),
                    },
                }))
            }
            "reload_plugins" => {
                let loaded = dispatcher.discover_plugins().await;
                info!(loaded = ?loaded, "Plugins reloaded");
                Ok(json!(loaded))
            }
            "restart" | "die" => {
                let reason = if method == "restart" {
                    ShutdownReason::Restart
                } else {
                    ShutdownReason::Die
                };
                info!(
                    reason = ?reason,
                    requested_by = ?ctx.sender.as_ref().and_then(|s| s.username()),
                    "Shutdown requested over RPC"
                );
                dispatcher.request_shutdown(reason);
                Ok(Value::Null)
            }
            other => Err(RpcError::method_not_found("management", other)),
        }
    }
}
