// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Process-wide table of named JSON schema definitions.
//!
//! Method argument schemas may reference a registered definition with
//! `{"$ref": "<name>"}`; references are inlined before validation.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::domain::error::RpcError;

const MAX_REF_DEPTH: usize = 16;

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    definitions: RwLock<HashMap<String, Value>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, schema: Value) -> Result<(), RpcError> {
        let mut definitions = self.definitions.write();
        if definitions.contains_key(name) {
            return Err(RpcError::already_registered("Schema", name));
        }
        definitions.insert(name.to_string(), schema);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.definitions.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.definitions.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Inline `{"$ref": name}` references to registered definitions
    pub fn resolve(&self, schema: &Value) -> Result<Value, RpcError> {
        let definitions = self.definitions.read();
        inline_refs(schema, &definitions, 0)
    }

    /// Validate positional `args` against one schema per position.
    ///
    /// Missing arguments are validated as `null`; surplus arguments are
    /// rejected. Errors carry `[path, message]` pairs in `extra.errors`.
    pub fn validate_args(&self, accepts: &[Value], args: &[Value]) -> Result<(), RpcError> {
        if args.len() > accepts.len() {
            return Err(RpcError::invalid_parameters(format!(
                "Too many arguments (expected at most {}, got {})",
                accepts.len(),
                args.len()
            )));
        }

        let mut errors = Vec::new();
        for (index, schema) in accepts.iter().enumerate() {
            let schema = self.resolve(schema)?;
            let validator = jsonschema::validator_for(&schema).map_err(|e| {
                RpcError::call_error(format!("Invalid schema for argument {}: {}", index, e))
            })?;
            let instance = args.get(index).cloned().unwrap_or(Value::Null);
            for error in validator.iter_errors(&instance) {
                errors.push(serde_json::json!([format!("args.{}", index), error.to_string()]));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RpcError::invalid_parameters("Validation failed")
                .with_extra(serde_json::json!({ "errors": errors })))
        }
    }
}

fn inline_refs(
    schema: &Value,
    definitions: &HashMap<String, Value>,
    depth: usize,
) -> Result<Value, RpcError> {
    if depth > MAX_REF_DEPTH {
        return Err(RpcError::call_error("Schema references nest too deeply"));
    }

    match schema {
        Value::Object(map) => {
            if let Some(Value::String(name)) = map.get("$ref") {
                if let Some(target) = definitions.get(name) {
                    return inline_refs(target, definitions, depth + 1);
                }
            }
            let mut resolved = Map::with_capacity(map.len());
            for (key, value) in map {
                resolved.insert(key.clone(), inline_refs(value, definitions, depth)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| inline_refs(item, definitions, depth))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}
