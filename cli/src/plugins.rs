// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Plugins compiled into `dispatcherd`.
//!
//! A `*.yaml` descriptor in a configured plugin directory can disable any of
//! them or hand them settings.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use dispatcher_core::application::dispatcher::DispatcherRef;
use dispatcher_core::application::plugin_loader::{Plugin, PluginContext};
use dispatcher_core::application::rpc_context::RpcService;
use dispatcher_core::domain::service::{opt_arg, positional, CallContext, MethodDescriptor};
use dispatcher_core::domain::task::{Task, TaskContext, TaskFailure, TaskHandler};
use dispatcher_core::RpcError;

/// Every plugin the binary ships with
pub fn compiled_plugins() -> Vec<Arc<dyn Plugin>> {
    vec![Arc::new(SystemPlugin)]
}

/// `system` service and the `system.sleep` task
pub struct SystemPlugin;

#[async_trait]
impl Plugin for SystemPlugin {
    fn name(&self) -> &str {
        "system"
    }

    fn metadata(&self) -> Value {
        json!({ "description": "Host information and diagnostics" })
    }

    async fn init(&self, ctx: &mut PluginContext) -> anyhow::Result<()> {
        let hostname = ctx.settings()["hostname"]
            .as_str()
            .map(str::to_string)
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string());

        let service = SystemService {
            dispatcher: ctx.dispatcher().handle(),
            hostname,
        };
        ctx.register_service("system", Arc::new(service)).await?;
        ctx.register_task_handler(
            TaskHandler::new("system.sleep", || Arc::new(Sleep) as Arc<dyn Task>)
                .with_description("Sleep for N seconds, reporting progress"),
        )?;
        Ok(())
    }
}

struct SystemService {
    dispatcher: DispatcherRef,
    hostname: String,
}

#[async_trait]
impl RpcService for SystemService {
    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![
            MethodDescriptor::new("info").description("Host name, version and uptime"),
            MethodDescriptor::new("ping").returns(json!({"type": "string"})),
        ]
    }

    async fn call(&self, method: &str, _args: Vec<Value>, _ctx: &CallContext) -> Result<Value, RpcError> {
        match method {
            "info" => {
                let dispatcher = self.dispatcher.get()?;
                let started_at = dispatcher.started_at();
                Ok(json!({
                    "hostname": self.hostname,
                    "version": env!("CARGO_PKG_VERSION"),
                    "pid": std::process::id(),
                    "host_tags": dispatcher.config().host_tags(),
                    "started_at": started_at,
                    "uptime": (chrono::Utc::now() - started_at).num_seconds(),
                }))
            }
            "ping" => Ok(json!("pong")),
            other => Err(RpcError::method_not_found("system", other)),
        }
    }
}

struct Sleep;

#[async_trait]
impl Task for Sleep {
    fn describe(&self, args: &Value) -> Option<String> {
        Some(format!("Sleeping {}s", args[0].as_u64().unwrap_or(1)))
    }

    async fn run(&self, ctx: &TaskContext, args: Value) -> Result<Value, TaskFailure> {
        let args = positional(args);
        let seconds: u64 = opt_arg(&args, 0, "seconds")
            .map_err(|e| TaskFailure::message(e.message))?
            .unwrap_or(1);

        for elapsed in 1..=seconds {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = ctx.aborted() => return Err(TaskFailure::message("aborted")),
            }
            ctx.set_progress(
                elapsed as f64 * 100.0 / seconds as f64,
                format!("{}/{}s", elapsed, seconds),
            );
        }
        Ok(json!(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatcher_core::domain::node_config::DispatcherConfig;
    use dispatcher_core::DispatcherBuilder;

    #[tokio::test]
    async fn test_system_plugin_registers() {
        let mut config = DispatcherConfig::default();
        config.spec.auth.enabled = false;
        let dispatcher = DispatcherBuilder::new(config)
            .plugins(compiled_plugins())
            .build()
            .await
            .unwrap();

        assert_eq!(dispatcher.call_sync("system.ping", json!([])).await.unwrap(), json!("pong"));
        let info = dispatcher.call_sync("system.info", json!([])).await.unwrap();
        assert_eq!(info["pid"], json!(std::process::id()));

        let record = dispatcher.call_task_sync("system.sleep", json!([0])).await.unwrap();
        assert_eq!(record.result, Some(json!(0)));
        dispatcher.stop().await;
    }
}
