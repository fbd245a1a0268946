// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Method declarations and call metadata of RPC services.
//!
//! Services declare their exported methods explicitly through
//! [`MethodDescriptor`]s; that list is the method enumerator used for routing
//! and for `discovery.get_methods`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::error::RpcError;
use crate::domain::session::SessionInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Service,
    Provider,
}

/// One exported method of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Only internal callers may invoke it
    #[serde(default)]
    pub private: bool,
    /// The calling session is handed to the method in [`CallContext::sender`]
    #[serde(default)]
    pub pass_sender: bool,
    /// Requires a privileged principal
    #[serde(default)]
    pub privileged: bool,
    /// One schema per positional argument
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepts: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<Value>,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            private: false,
            pass_sender: false,
            privileged: false,
            accepts: None,
            returns: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn pass_sender(mut self) -> Self {
        self.pass_sender = true;
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn accepts(mut self, schemas: Vec<Value>) -> Self {
        self.accepts = Some(schemas);
        self
    }

    pub fn returns(mut self, schema: Value) -> Self {
        self.returns = Some(schema);
        self
    }
}

/// Who is invoking a method
#[derive(Debug, Clone)]
pub enum Caller {
    /// Other services, the balancer, plugin code
    Internal,
    Session(SessionInfo),
}

impl Caller {
    pub fn is_internal(&self) -> bool {
        matches!(self, Caller::Internal)
    }

    pub fn session(&self) -> Option<&SessionInfo> {
        match self {
            Caller::Internal => None,
            Caller::Session(session) => Some(session),
        }
    }

    pub fn is_privileged(&self) -> bool {
        match self {
            Caller::Internal => true,
            Caller::Session(session) => session.is_privileged(),
        }
    }
}

/// Per-call context handed to [`crate::application::rpc_context::RpcService::call`]
#[derive(Debug, Clone)]
pub struct CallContext {
    pub caller: Caller,
    /// Set only for `pass_sender` methods invoked from a session
    pub sender: Option<SessionInfo>,
}

impl CallContext {
    pub fn internal() -> Self {
        Self {
            caller: Caller::Internal,
            sender: None,
        }
    }
}

/// Normalise the `args` of a call into positional arguments
pub fn positional(args: Value) -> Vec<Value> {
    match args {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Required positional argument
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize, name: &str) -> Result<T, RpcError> {
    let value = args
        .get(index)
        .ok_or_else(|| RpcError::invalid_parameters(format!("Missing argument '{}'", name)))?;
    serde_json::from_value(value.clone()).map_err(|e| {
        RpcError::invalid_parameters(format!("Invalid argument '{}': {}", name, e))
    })
}

/// Optional positional argument; absent and `null` both give `None`
pub fn opt_arg<T: DeserializeOwned>(
    args: &[Value],
    index: usize,
    name: &str,
) -> Result<Option<T>, RpcError> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => arg(args, index, name).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_positional_normalisation() {
        assert_eq!(positional(json!([1, 2])), vec![json!(1), json!(2)]);
        assert!(positional(Value::Null).is_empty());
        assert_eq!(positional(json!({"a": 1})), vec![json!({"a": 1})]);
    }

    #[test]
    fn test_argument_helpers() {
        let args = vec![json!("disk"), Value::Null];
        let name: String = arg(&args, 0, "name").unwrap();
        assert_eq!(name, "disk");
        assert_eq!(opt_arg::<u64>(&args, 1, "limit").unwrap(), None);
        assert_eq!(opt_arg::<u64>(&args, 2, "limit").unwrap(), None);

        let err = arg::<u64>(&args, 0, "id").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameters);
        let err = arg::<u64>(&args, 5, "id").unwrap_err();
        assert!(err.message.contains("Missing argument 'id'"));
    }
}
