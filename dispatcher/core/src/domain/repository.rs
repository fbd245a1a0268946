// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Datastore Interface
//!
//! The persistence collaborator of the runtime: a small collection-oriented
//! query/insert/update/delete surface over JSON rows. Implementations live in
//! `crate::infrastructure::datastore` and are selected from configuration.
//!
//! | Collection | Rows |
//! |------------|------|
//! | `tasks` | one per submitted task |
//! | `events` | every emitted event not flagged `nolog` |
//! | `sessions` | one per successful login |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::domain::error::RpcError;

pub mod collections {
    pub const TASKS: &str = "tasks";
    pub const EVENTS: &str = "events";
    pub const SESSIONS: &str = "sessions";

    pub const ALL: [&str; 3] = [TASKS, EVENTS, SESSIONS];
}

#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Row {id} not found in {collection}")]
    NotFound { collection: String, id: String },

    #[error("Row {id} already exists in {collection}")]
    Duplicate { collection: String, id: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DatastoreError {
    fn from(err: serde_json::Error) -> Self {
        DatastoreError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for DatastoreError {
    fn from(err: std::io::Error) -> Self {
        DatastoreError::Storage(err.to_string())
    }
}

impl From<DatastoreError> for RpcError {
    fn from(err: DatastoreError) -> Self {
        RpcError::call_error(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "nin")]
    NotIn,
}

/// Row predicate; serialized as `[field, op, value]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(String, FilterOp, Value)", into = "(String, FilterOp, Value)")]
pub struct Filter {
    /// Dotted path into the row (`progress.percent`)
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl From<(String, FilterOp, Value)> for Filter {
    fn from((field, op, value): (String, FilterOp, Value)) -> Self {
        Self { field, op, value }
    }
}

impl From<Filter> for (String, FilterOp, Value) {
    fn from(filter: Filter) -> Self {
        (filter.field, filter.op, filter.value)
    }
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value.into())
    }

    pub fn matches(&self, row: &Value) -> bool {
        let actual = lookup(row, &self.field).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Ne => actual != &self.value,
            FilterOp::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Ge => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Le => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|items| items.contains(actual)),
            FilterOp::NotIn => self
                .value
                .as_array()
                .is_none_or(|items| !items.contains(actual)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub dir: SortDirection,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl QueryOptions {
    pub fn sorted(field: impl Into<String>, dir: SortDirection) -> Self {
        Self {
            sort: Some(field.into()),
            dir,
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Apply sort, offset and limit to an already filtered row set
    pub fn apply(&self, mut rows: Vec<Value>) -> Vec<Value> {
        if let Some(field) = &self.sort {
            rows.sort_by(|a, b| {
                let a = lookup(a, field).unwrap_or(&Value::Null);
                let b = lookup(b, field).unwrap_or(&Value::Null);
                let ordering = compare(a, b).unwrap_or(Ordering::Equal);
                match self.dir {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            });
        }
        let offset = self.offset.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        rows.into_iter().skip(offset).take(limit).collect()
    }
}

fn lookup<'a>(row: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(row, |value, key| value.get(key))
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        _ => None,
    }
}

/// Canonical key of a row id (numbers and strings)
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
pub trait Datastore: Send + Sync {
    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        options: &QueryOptions,
    ) -> Result<Vec<Value>, DatastoreError>;

    async fn get_by_id(&self, collection: &str, id: &Value) -> Result<Option<Value>, DatastoreError>;

    /// Insert a row and return its id. A row without `id` gets the next serial.
    async fn insert(&self, collection: &str, row: Value) -> Result<Value, DatastoreError>;

    /// Shallow-merge `patch` into an existing row
    async fn update(&self, collection: &str, id: &Value, patch: Value) -> Result<(), DatastoreError>;

    async fn delete(&self, collection: &str, id: &Value) -> Result<(), DatastoreError>;

    async fn collection_exists(&self, collection: &str) -> Result<bool, DatastoreError>;

    async fn collection_create(&self, collection: &str) -> Result<(), DatastoreError>;

    async fn require_collection(&self, collection: &str) -> Result<(), DatastoreError> {
        if !self.collection_exists(collection).await? {
            self.collection_create(collection).await?;
        }
        Ok(())
    }
}
