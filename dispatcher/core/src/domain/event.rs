// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Events published on the bus and the metadata of registered event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type names emitted by the runtime itself
pub mod names {
    pub const TASK_UPDATED: &str = "task.updated";
    pub const TASK_PROGRESS: &str = "task.progress";
    pub const PLUGIN_LOADED: &str = "server.plugin.loaded";
    pub const PLUGIN_LOAD_ERROR: &str = "server.plugin.load_error";
    pub const CLIENT_CONNECTED: &str = "server.client_connected";
    pub const CLIENT_DISCONNECTED: &str = "server.client_disconnected";
    pub const CLIENT_LOGGED: &str = "server.client_logged";
    pub const SERVICE_LOGGED: &str = "server.service_logged";
    pub const READY: &str = "server.ready";
    pub const SHUTDOWN: &str = "server.shutdown";
}

/// One emitted event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub args: Value,
    #[serde(skip)]
    pub emitted_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Build an event, stamping `timestamp` into object payloads that lack one
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        let now = Utc::now();
        let args = match args {
            Value::Object(mut map) => {
                map.entry("timestamp")
                    .or_insert_with(|| Value::from(now.timestamp_millis() as f64 / 1000.0));
                Value::Object(map)
            }
            Value::Null => serde_json::json!({ "timestamp": now.timestamp_millis() as f64 / 1000.0 }),
            other => other,
        };
        Self {
            name: name.into(),
            args,
            emitted_at: Some(now),
        }
    }

    /// Payloads flagged `"nolog": true` are not written to the events collection
    pub fn is_nolog(&self) -> bool {
        self.args
            .get("nolog")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Registration metadata of an event type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl EventTypeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            description: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Snapshot of a registered event type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTypeInfo {
    #[serde(flatten)]
    pub spec: EventTypeSpec,
    /// Sessions whose subscription masks currently match this type
    pub subscribers: usize,
}
