// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the dispatcher CLI

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;

use dispatcher_client::MiddlewareClient;

pub mod call;
pub mod config;
pub mod events;
pub mod task;

pub use self::config::ConfigCommand;
pub use self::events::EventsCommand;
pub use self::task::TaskCommand;

/// Where and as whom client subcommands connect
#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Dispatcher WebSocket URL
    #[arg(
        long,
        global = true,
        env = "DISPATCHER_URL",
        default_value = "ws://127.0.0.1:5000/socket"
    )]
    pub url: String,

    #[arg(short, long, global = true, env = "DISPATCHER_USERNAME")]
    pub username: Option<String>,

    #[arg(short, long, global = true, env = "DISPATCHER_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

impl ConnectArgs {
    /// Connect and log in when credentials were given
    pub async fn connect(&self) -> Result<MiddlewareClient> {
        let client = MiddlewareClient::connect(&self.url)
            .await
            .with_context(|| format!("Failed to connect to {}. Daemon not running?", self.url))?;

        if let Some(username) = &self.username {
            let password = self.password.as_deref().unwrap_or_default();
            client
                .login(username, password)
                .await
                .with_context(|| format!("Login as {} failed", username))?;
        }
        Ok(client)
    }
}

/// Positional arguments are JSON when they parse as JSON, plain strings otherwise
pub fn parse_args(raw: &[String]) -> Value {
    Value::Array(
        raw.iter()
            .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.clone())))
            .collect(),
    )
}

/// Scalars print bare, everything else as pretty JSON
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_args_mixes_json_and_strings() {
        let raw = vec![
            "tank".to_string(),
            "42".to_string(),
            r#"{"recursive": true}"#.to_string(),
            "[1, 2".to_string(),
        ];
        assert_eq!(
            parse_args(&raw),
            json!(["tank", 42, {"recursive": true}, "[1, 2"])
        );
    }

    #[test]
    fn test_render() {
        assert_eq!(render(&json!("ok")), "ok");
        assert_eq!(render(&json!(7)), "7");
        assert_eq!(render(&json!({"a": 1})), "{\n  \"a\": 1\n}");
    }
}
