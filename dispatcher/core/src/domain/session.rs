// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Connected client sessions and their authenticated principal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::domain::error::RpcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Authenticated identity of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub username: String,
    pub privileged: bool,
}

/// Reply to a successful login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginGrant {
    #[serde(flatten)]
    pub principal: Principal,
    /// Presented to `management.login_token` to resume on a new connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Seconds the token survives without use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<u64>,
}

impl LoginGrant {
    pub fn without_token(principal: Principal) -> Self {
        Self {
            principal,
            token: None,
            lifetime: None,
        }
    }
}

/// Calls from the server to a connected client
#[async_trait]
pub trait ClientChannel: Send + Sync {
    async fn call(&self, method: &str, args: Value) -> Result<Value, RpcError>;
}

/// What a service sees of the session that called it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub address: Option<String>,
    pub principal: Option<Principal>,
    pub connected_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(address: Option<String>) -> Self {
        Self {
            id: SessionId::new(),
            address,
            principal: None,
            connected_at: Utc::now(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    pub fn is_privileged(&self) -> bool {
        self.principal.as_ref().is_some_and(|p| p.privileged)
    }

    pub fn username(&self) -> Option<&str> {
        self.principal.as_ref().map(|p| p.username.as_str())
    }
}
