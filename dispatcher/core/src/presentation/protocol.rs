// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Wire Frames
//!
//! Every WebSocket text message is one JSON object:
//!
//! ```json
//! {"namespace": "rpc", "name": "call", "id": "42", "args": {"method": "disk.query", "args": []}}
//! ```
//!
//! | namespace | client → server | server → client |
//! |-----------|-----------------|-----------------|
//! | `rpc` | `call`, `response`, `error` | `response`, `error`, `call` |
//! | `events` | `subscribe`, `unsubscribe`, `event` | `ack`, `event`, `error`, `logout` |
//! | `task` | `submit`, `status`, `abort` | `response`, `error` |
//! | `management` | `login`, `login_token`, `login_service`, `logout` | `response`, `error` |
//!
//! Event delivery and `events.logout` carry no `id`. An `rpc.call` sent by
//! the server carries one, and the client answers it with `rpc.response`
//! or `rpc.error` under the same id.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::error::RpcError;
use crate::domain::event::Event;

pub mod namespace {
    pub const RPC: &str = "rpc";
    pub const EVENTS: &str = "events";
    pub const TASK: &str = "task";
    pub const MANAGEMENT: &str = "management";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Required on the wire; `null` when there is nothing to send
    pub args: Value,
}

impl Frame {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, id: Option<String>, args: Value) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            id,
            args,
        }
    }

    pub fn response(namespace: &str, id: Option<String>, result: Value) -> Self {
        Self::new(namespace, "response", id, result)
    }

    pub fn error(namespace: &str, id: Option<String>, error: &RpcError) -> Self {
        let args = serde_json::to_value(error.to_payload()).unwrap_or_else(|_| {
            json!({ "code": error.code(), "message": error.message })
        });
        Self::new(namespace, "error", id, args)
    }

    pub fn ack(namespace: &str, id: Option<String>, args: Value) -> Self {
        Self::new(namespace, "ack", id, args)
    }

    pub fn event(event: &Event) -> Self {
        Self::new(
            namespace::EVENTS,
            "event",
            None,
            json!({ "name": event.name, "args": event.args }),
        )
    }

    pub fn logout() -> Self {
        Self::new(namespace::EVENTS, "logout", None, Value::Null)
    }

    pub fn rpc_call(id: impl Into<String>, method: &str, args: Value) -> Self {
        Self::new(
            namespace::RPC,
            "call",
            Some(id.into()),
            json!({ "method": method, "args": args }),
        )
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> String {
        // Frame holds only strings and serde_json::Value, which always serialize
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Read the argument `key` from an object payload, or position `index`
    /// of an array payload
    pub fn field(&self, key: &str, index: usize) -> Option<&Value> {
        match &self.args {
            Value::Object(map) => map.get(key),
            Value::Array(items) => items.get(index),
            _ => None,
        }
    }
}
