// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Domain
//!
//! Tasks are long-running units of work executed by the balancer. A plugin
//! registers a [`TaskHandler`] (name, queue class, factory); every submission
//! instantiates a fresh [`Task`] execution object from that factory.
//!
//! ## State machine
//!
//! ```text
//! WAITING ──► RUNNING ──► FINISHED
//!    │           ├──────► FAILED
//!    │           └──────► ABORTED
//!    ├──────────────────► FAILED   (verify rejected the arguments)
//!    └──────────────────► ABORTED
//! ```
//!
//! Terminal states never transition again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::domain::error::{ErrorKind, RpcError};

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Waiting,
    Running,
    Finished,
    Failed,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Waiting => "WAITING",
            TaskState::Running => "RUNNING",
            TaskState::Finished => "FINISHED",
            TaskState::Failed => "FAILED",
            TaskState::Aborted => "ABORTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "WAITING" => Some(TaskState::Waiting),
            "RUNNING" => Some(TaskState::Running),
            "FINISHED" => Some(TaskState::Finished),
            "FAILED" => Some(TaskState::Failed),
            "ABORTED" => Some(TaskState::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress snapshot published by a running task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub percent: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

/// Error payload stored on a FAILED task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct TaskFailure {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl TaskFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            trace: None,
        }
    }

    /// Failure with the generic `CALL_ERROR` code
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CallError.code(), message)
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl From<RpcError> for TaskFailure {
    fn from(err: RpcError) -> Self {
        Self {
            code: err.code(),
            message: err.message,
            trace: err.extra.map(|extra| extra.to_string()),
        }
    }
}

impl From<anyhow::Error> for TaskFailure {
    fn from(err: anyhow::Error) -> Self {
        TaskFailure::message(err.to_string()).with_trace(format!("{:?}", err))
    }
}

/// Coarse category of balancer queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueClass {
    Disk,
    Network,
    System,
    Io,
    #[default]
    Default,
}

impl QueueClass {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueClass::Disk => "disk",
            QueueClass::Network => "network",
            QueueClass::System => "system",
            QueueClass::Io => "io",
            QueueClass::Default => "default",
        }
    }

    /// Queue name for this class, optionally narrowed to one instance
    /// (`disk` or `disk:ada0`).
    pub fn queue_name(self, instance: Option<&str>) -> String {
        match instance {
            Some(key) if !key.is_empty() => format!("{}:{}", self.as_str(), key),
            _ => self.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerState {
    Idle,
    Busy,
    Stopped,
}

/// Snapshot of one balancer queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub class: QueueClass,
    pub worker: WorkerState,
    pub active: Option<TaskId>,
    pub waiting: Vec<TaskId>,
}

/// Row of the `tasks` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub args: Value,
    pub state: TaskState,
    #[serde(default)]
    pub progress: Option<TaskProgress>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<TaskFailure>,
    #[serde(default)]
    pub queue: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(id: TaskId, name: impl Into<String>, args: Value) -> Self {
        Self {
            id,
            name: name.into(),
            args,
            state: TaskState::Waiting,
            progress: None,
            result: None,
            error: None,
            queue: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }
}

/// Sink that receives progress updates from a running task
pub trait ProgressReporter: Send + Sync {
    fn report(&self, progress: TaskProgress);
}

/// Per-invocation handle handed to [`Task::run`]
#[derive(Clone)]
pub struct TaskContext {
    pub id: TaskId,
    pub name: String,
    reporter: Arc<dyn ProgressReporter>,
    abort: CancellationToken,
}

impl TaskContext {
    pub fn new(
        id: TaskId,
        name: impl Into<String>,
        reporter: Arc<dyn ProgressReporter>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            reporter,
            abort,
        }
    }

    pub fn set_progress(&self, percent: f64, message: impl Into<String>) {
        self.reporter.report(TaskProgress {
            percent: percent.clamp(0.0, 100.0),
            message: message.into(),
            extra: None,
        });
    }

    pub fn set_progress_extra(&self, percent: f64, message: impl Into<String>, extra: Value) {
        self.reporter.report(TaskProgress {
            percent: percent.clamp(0.0, 100.0),
            message: message.into(),
            extra: Some(extra),
        });
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Resolves once the task has been asked to abort
    pub async fn aborted(&self) {
        self.abort.cancelled().await
    }
}

/// Execution object produced by a [`TaskHandler`] for one submission
#[async_trait]
pub trait Task: Send + Sync {
    /// Short human readable summary of what this invocation does
    fn describe(&self, _args: &Value) -> Option<String> {
        None
    }

    /// Reject arguments before the task is queued
    async fn verify(&self, _args: &Value) -> Result<(), TaskFailure> {
        Ok(())
    }

    /// Instance key within the handler's queue class (e.g. a disk name)
    fn queue_key(&self, _args: &Value) -> Option<String> {
        None
    }

    async fn run(&self, ctx: &TaskContext, args: Value) -> Result<Value, TaskFailure>;

    /// Called when a RUNNING task is aborted, before its run future is dropped
    async fn abort(&self) -> Result<(), TaskFailure> {
        Ok(())
    }
}

type TaskFactory = dyn Fn() -> Arc<dyn Task> + Send + Sync;

/// Registered factory bound to a task type name
#[derive(Clone)]
pub struct TaskHandler {
    pub name: String,
    pub queue_class: QueueClass,
    pub locks: Vec<String>,
    pub description: Option<String>,
    factory: Arc<TaskFactory>,
}

impl TaskHandler {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Task> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            queue_class: QueueClass::Default,
            locks: Vec::new(),
            description: None,
            factory: Arc::new(factory),
        }
    }

    pub fn with_queue_class(mut self, class: QueueClass) -> Self {
        self.queue_class = class;
        self
    }

    /// Named resources held exclusively while a task of this type runs
    pub fn with_locks<I, S>(mut self, locks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locks = locks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn instantiate(&self) -> Arc<dyn Task> {
        (self.factory)()
    }
}

impl fmt::Debug for TaskHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandler")
            .field("name", &self.name)
            .field("queue_class", &self.queue_class)
            .field("locks", &self.locks)
            .finish()
    }
}
