// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Hooks
//!
//! Named extension points. A plugin declares a hook, other plugins attach
//! handlers to it, and the owner runs them all with [`HookRegistry::run`],
//! getting one result per handler in attachment order.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::error::RpcError;

#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, args: &Value) -> anyhow::Result<Value>;
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<BTreeMap<String, Vec<Arc<dyn Hook>>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declaring a hook twice is a no-op
    pub fn register(&self, name: &str) {
        self.hooks.write().entry(name.to_string()).or_default();
    }

    /// Drops the hook along with everything attached to it
    pub fn unregister(&self, name: &str) -> bool {
        self.hooks.write().remove(name).is_some()
    }

    /// Attaching to an undeclared hook declares it
    pub fn attach(&self, name: &str, hook: Arc<dyn Hook>) {
        self.hooks.write().entry(name.to_string()).or_default().push(hook);
        debug!(hook = %name, "Hook handler attached");
    }

    pub fn detach(&self, name: &str, hook: &Arc<dyn Hook>) -> bool {
        let mut hooks = self.hooks.write();
        let Some(handlers) = hooks.get_mut(name) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, hook));
        before != handlers.len()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.hooks.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks.read().keys().cloned().collect()
    }

    pub fn attached(&self, name: &str) -> usize {
        self.hooks.read().get(name).map_or(0, Vec::len)
    }

    /// Run every handler of `name` in attachment order. The first failure
    /// ends the run.
    pub async fn run(&self, name: &str, args: &Value) -> Result<Vec<Value>, RpcError> {
        let handlers = self
            .hooks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::invalid_parameters(format!("Hook {} is not registered", name)))?;

        let mut results = Vec::with_capacity(handlers.len());
        for (index, handler) in handlers.iter().enumerate() {
            match handler.run(args).await {
                Ok(value) => results.push(value),
                Err(e) => {
                    warn!(hook = %name, index, error = %format!("{:#}", e), "Hook handler failed");
                    return Err(RpcError::call_error(format!("Hook {} failed: {:#}", name, e)));
                }
            }
        }
        Ok(results)
    }
}
