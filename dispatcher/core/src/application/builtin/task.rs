// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! `task`: submission, abort and history queries.
//!
//! History is served from the `tasks` collection so it survives a restart;
//! live tasks get their runtime state and progress merged over the row.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::application::dispatcher::{Dispatcher, DispatcherRef};
use crate::application::rpc_context::RpcService;
use crate::domain::error::RpcError;
use crate::domain::repository::{collections, Filter, QueryOptions, SortDirection};
use crate::domain::service::{arg, opt_arg, CallContext, MethodDescriptor};
use crate::domain::task::{TaskId, TaskRecord, TaskState};

pub struct TaskService {
    dispatcher: DispatcherRef,
}

impl TaskService {
    pub fn new(dispatcher: DispatcherRef) -> Self {
        Self { dispatcher }
    }
}

/// Overlay the runtime record onto the persisted row
fn merge(row: Option<Value>, live: &TaskRecord) -> Result<Value, RpcError> {
    let live = serde_json::to_value(live)?;
    Ok(match (row, live) {
        (Some(Value::Object(mut row)), Value::Object(live)) => {
            row.extend(live);
            Value::Object(row)
        }
        (_, live) => live,
    })
}

fn with_runtime(dispatcher: &Dispatcher, rows: Vec<Value>) -> Result<Vec<Value>, RpcError> {
    rows.into_iter()
        .map(|row| {
            let live = row
                .get("id")
                .and_then(Value::as_u64)
                .and_then(|id| dispatcher.balancer().get_task(id));
            match live {
                Some(live) => merge(Some(row), &live),
                None => Ok(row),
            }
        })
        .collect()
}

async fn status(dispatcher: &Dispatcher, id: TaskId) -> Result<Value, RpcError> {
    let datastore = dispatcher.datastore();
    let row = datastore.get_by_id(collections::TASKS, &json!(id)).await?;
    match dispatcher.balancer().get_task(id) {
        Some(live) => merge(row, &live),
        // A task leaves the balancer only after its terminal row is written,
        // which may be newer than the row read above
        None => datastore
            .get_by_id(collections::TASKS, &json!(id))
            .await?
            .ok_or_else(|| RpcError::unknown_task(&id.to_string())),
    }
}

#[async_trait]
impl RpcService for TaskService {
    fn methods(&self) -> Vec<MethodDescriptor> {
        let id = json!({"type": "integer", "minimum": 1});
        vec![
            MethodDescriptor::new("submit")
                .description("Queue a task; returns its id")
                .accepts(vec![json!({"type": "string"}), json!({})])
                .returns(json!({"type": "integer"})),
            MethodDescriptor::new("status")
                .description("Task row merged with runtime progress")
                .accepts(vec![id.clone()]),
            MethodDescriptor::new("abort").accepts(vec![id]),
            MethodDescriptor::new("list_queues"),
            MethodDescriptor::new("list_tasks")
                .description("Most recent tasks first")
                .accepts(vec![json!({"type": ["integer", "null"], "minimum": 0})]),
            MethodDescriptor::new("list_active").description("Tasks WAITING or RUNNING"),
            MethodDescriptor::new("list_failed"),
        ]
    }

    async fn call(&self, method: &str, args: Vec<Value>, _ctx: &CallContext) -> Result<Value, RpcError> {
        let dispatcher: Arc<Dispatcher> = self.dispatcher.get()?;
        let balancer = dispatcher.balancer();
        match method {
            "submit" => {
                let name: String = arg(&args, 0, "name")?;
                let task_args = args.get(1).cloned().unwrap_or_else(|| json!([]));
                Ok(json!(balancer.submit(&name, task_args).await?))
            }
            "status" => {
                let id: TaskId = arg(&args, 0, "id")?;
                status(&dispatcher, id).await
            }
            "abort" => {
                let id: TaskId = arg(&args, 0, "id")?;
                balancer.abort(id).await?;
                Ok(Value::Null)
            }
            "list_queues" => Ok(serde_json::to_value(balancer.list_queues())?),
            "list_tasks" => {
                let limit: Option<usize> = opt_arg(&args, 0, "limit")?;
                let rows = dispatcher
                    .datastore()
                    .query(
                        collections::TASKS,
                        &[],
                        &QueryOptions::sorted("id", SortDirection::Desc).with_limit(limit),
                    )
                    .await?;
                Ok(Value::Array(with_runtime(&dispatcher, rows)?))
            }
            "list_active" => {
                let mut live = balancer.get_tasks(TaskState::Waiting);
                live.extend(balancer.get_active_tasks());
                live.sort_by_key(|record| record.id);
                Ok(serde_json::to_value(live)?)
            }
            "list_failed" => {
                let rows = dispatcher
                    .datastore()
                    .query(
                        collections::TASKS,
                        &[Filter::eq("state", TaskState::Failed.as_str())],
                        &QueryOptions::sorted("id", SortDirection::Desc),
                    )
                    .await?;
                Ok(Value::Array(rows))
            }
            other => Err(RpcError::method_not_found("task", other)),
        }
    }
}
