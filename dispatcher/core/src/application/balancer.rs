// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Balancer
//!
//! Accepts task submissions, binds each to a queue, runs queued tasks one at
//! a time per queue and publishes lifecycle events.
//!
//! Queues are created on demand, one tokio worker per queue. The waiting
//! FIFO of a queue and the active slot are guarded by that queue's mutex;
//! each live task's record is guarded by its own mutex. Lock order is always
//! queue before task.
//!
//! A task takes its queue position when its id is allocated, before
//! `verify` runs. The worker holds the head of the queue until that task's
//! verify has returned, so a queue executes in submission order.
//!
//! Every state change is written to the `tasks` collection and published as
//! `task.updated`. Progress updates are published as `task.progress`, marked
//! `nolog` so they stay out of the event log, and only while the task is
//! RUNNING; the terminal transition takes the task mutex
//! first, so no progress event can follow the terminal `task.updated`.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::error::RpcError;
use crate::domain::event::names::{TASK_PROGRESS, TASK_UPDATED};
use crate::domain::repository::{collections, Datastore, Filter, FilterOp, QueryOptions, SortDirection};
use crate::domain::task::{
    ProgressReporter, QueueClass, QueueInfo, Task, TaskContext, TaskFailure, TaskHandler, TaskId,
    TaskProgress, TaskRecord, TaskState, WorkerState,
};
use crate::infrastructure::event_bus::EventBus;

struct QueueState {
    waiting: VecDeque<TaskId>,
    active: Option<TaskId>,
    worker: WorkerState,
}

struct Queue {
    name: String,
    class: QueueClass,
    state: Mutex<QueueState>,
    notify: Notify,
}

struct TaskEntry {
    task: Arc<dyn Task>,
    locks: Vec<String>,
    queue: String,
    record: Mutex<TaskRecord>,
    abort: CancellationToken,
    /// Flips to `true` once `verify` has returned
    verified: watch::Sender<bool>,
    done: watch::Sender<Option<TaskRecord>>,
}

impl TaskEntry {
    fn snapshot(&self) -> TaskRecord {
        self.record.lock().clone()
    }

    fn terminate(&self, state: TaskState, result: Option<Value>, error: Option<TaskFailure>) -> Option<TaskRecord> {
        terminate_locked(&mut self.record.lock(), state, result, error)
    }
}

/// Move a record into a terminal state. Returns `None` if it already was.
fn terminate_locked(
    record: &mut TaskRecord,
    state: TaskState,
    result: Option<Value>,
    error: Option<TaskFailure>,
) -> Option<TaskRecord> {
    if record.state.is_terminal() {
        return None;
    }
    record.state = state;
    record.result = result;
    record.error = error;
    record.ended_at = Some(chrono::Utc::now());
    Some(record.clone())
}

fn updated_payload(record: &TaskRecord) -> Value {
    let mut payload = json!({
        "id": record.id,
        "name": record.name,
        "state": record.state,
    });
    if let Some(result) = &record.result {
        payload["result"] = result.clone();
    }
    if let Some(error) = &record.error {
        payload["error"] = json!(error);
    }
    payload
}

/// Routes `TaskContext::set_progress` into the task record and the bus
struct EntryProgress {
    entry: Arc<TaskEntry>,
    bus: EventBus,
}

impl ProgressReporter for EntryProgress {
    fn report(&self, progress: TaskProgress) {
        let mut record = self.entry.record.lock();
        if record.state != TaskState::Running {
            debug!(task_id = record.id, "Dropping progress of a task that is not running");
            return;
        }

        let mut payload = json!({
            "id": record.id,
            "name": record.name,
            "percent": progress.percent,
            "message": progress.message,
            "nolog": true,
        });
        if let Some(extra) = &progress.extra {
            payload["extra"] = extra.clone();
        }
        record.progress = Some(progress);
        // Emitted under the record lock so a terminal update cannot overtake it
        self.bus.emit(TASK_PROGRESS, payload);
    }
}

struct Inner {
    handlers: RwLock<HashMap<String, TaskHandler>>,
    queues: Mutex<BTreeMap<String, Arc<Queue>>>,
    tasks: DashMap<TaskId, Arc<TaskEntry>>,
    resource_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Held from id allocation until the task is queued
    submissions: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    datastore: Arc<dyn Datastore>,
    bus: EventBus,
    abort_grace: Duration,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Task execution engine
#[derive(Clone)]
pub struct Balancer {
    inner: Arc<Inner>,
}

impl Balancer {
    pub fn new(datastore: Arc<dyn Datastore>, bus: EventBus, abort_grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(HashMap::new()),
                queues: Mutex::new(BTreeMap::new()),
                tasks: DashMap::new(),
                resource_locks: Mutex::new(HashMap::new()),
                submissions: tokio::sync::Mutex::new(()),
                next_id: AtomicU64::new(1),
                datastore,
                bus,
                abort_grace,
                shutdown: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Continue task ids after the persisted history and close out rows
    /// left unfinished by a previous process
    pub async fn start(&self) -> Result<(), RpcError> {
        let inner = &self.inner;
        let latest = inner
            .datastore
            .query(
                collections::TASKS,
                &[],
                &QueryOptions::sorted("id", SortDirection::Desc).with_limit(Some(1)),
            )
            .await
            .map_err(|e| RpcError::call_error(e.to_string()))?;
        if let Some(id) = latest.first().and_then(|row| row.get("id")).and_then(Value::as_u64) {
            inner.next_id.store(id + 1, Ordering::SeqCst);
        }

        let unfinished = inner
            .datastore
            .query(
                collections::TASKS,
                &[Filter::new("state", FilterOp::In, json!(["WAITING", "RUNNING"]))],
                &QueryOptions::default(),
            )
            .await
            .map_err(|e| RpcError::call_error(e.to_string()))?;
        for row in unfinished {
            if let Some(id) = row.get("id") {
                let patch = json!({
                    "state": TaskState::Aborted,
                    "error": TaskFailure::message("Interrupted by dispatcher restart"),
                    "ended_at": chrono::Utc::now(),
                });
                if let Err(e) = inner.datastore.update(collections::TASKS, id, patch).await {
                    warn!(task_id = %id, error = %e, "Failed to close out interrupted task");
                }
            }
        }

        info!(next_id = inner.next_id.load(Ordering::SeqCst), "Balancer started");
        Ok(())
    }

    pub fn register_handler(&self, handler: TaskHandler) -> Result<(), RpcError> {
        let mut handlers = self.inner.handlers.write();
        if handlers.contains_key(&handler.name) {
            return Err(RpcError::already_registered("Task handler", &handler.name));
        }
        debug!(task = %handler.name, class = ?handler.queue_class, "Registered task handler");
        handlers.insert(handler.name.clone(), handler);
        Ok(())
    }

    pub fn unregister_handler(&self, name: &str) -> bool {
        self.inner.handlers.write().remove(name).is_some()
    }

    pub fn handler(&self, name: &str) -> Option<TaskHandler> {
        self.inner.handlers.read().get(name).cloned()
    }

    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Create (or look up) the queue for a class and optional instance key
    pub fn ensure_queue(&self, class: QueueClass, key: Option<&str>) -> String {
        self.inner.queue(class, key).name.clone()
    }

    /// The submission runs in its own tokio task: dropping the returned
    /// future leaves the task queued and running.
    pub async fn submit(&self, name: &str, args: Value) -> Result<TaskId, RpcError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RpcError::invalid_state("Balancer is shutting down"));
        }
        let handler = self.handler(name).ok_or_else(|| RpcError::unknown_task(name))?;

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.submit(handler, args).await })
            .await
            .map_err(|e| RpcError::call_error(format!("Task submission failed: {}", e)))?
    }

    /// WAITING tasks are removed and marked ABORTED at once. RUNNING tasks
    /// get their abort hook called and are marked ABORTED by their worker.
    pub async fn abort(&self, id: TaskId) -> Result<(), RpcError> {
        let inner = &self.inner;
        let Some(entry) = inner.tasks.get(&id).map(|e| e.value().clone()) else {
            return match inner.load_record(id).await? {
                Some(record) => Err(RpcError::invalid_state(format!(
                    "Task {} is already {}",
                    id, record.state
                ))),
                None => Err(RpcError::new(
                    crate::domain::error::ErrorKind::UnknownTask,
                    format!("Task {} not found", id),
                )),
            };
        };

        let Some(queue) = inner.queues.lock().get(&entry.queue).cloned() else {
            return Err(RpcError::invalid_state(format!("Task {} has no queue", id)));
        };

        let aborted_while_waiting = {
            let mut state = queue.state.lock();
            let mut record = entry.record.lock();
            match record.state {
                s if s.is_terminal() => {
                    return Err(RpcError::invalid_state(format!("Task {} is already {}", id, s)));
                }
                TaskState::Waiting => match state.waiting.iter().position(|queued| *queued == id) {
                    Some(pos) => {
                        state.waiting.remove(pos);
                        terminate_locked(&mut record, TaskState::Aborted, None, None)
                    }
                    // Picked up by the worker, not yet RUNNING
                    None => None,
                },
                _ => None,
            }
        };

        if let Some(record) = aborted_while_waiting {
            info!(task_id = id, "Aborted waiting task");
            entry.abort.cancel();
            inner.finalize(&entry, record).await;
            return Ok(());
        }

        info!(task_id = id, "Aborting running task");
        if let Err(e) = entry.task.abort().await {
            warn!(task_id = id, error = %e, "Task abort hook failed");
        }
        entry.abort.cancel();
        Ok(())
    }

    /// Resolves with the terminal record of a task
    pub async fn wait(&self, id: TaskId) -> Result<TaskRecord, RpcError> {
        let live = self.inner.tasks.get(&id).map(|e| e.value().clone());
        if let Some(entry) = live {
            let mut done = entry.done.subscribe();
            let record = done
                .wait_for(Option::is_some)
                .await
                .map_err(|_| RpcError::call_error("Task tracking dropped"))?
                .clone();
            if let Some(record) = record {
                return Ok(record);
            }
        }

        match self.inner.load_record(id).await? {
            Some(record) if record.state.is_terminal() => Ok(record),
            Some(record) => Err(RpcError::invalid_state(format!(
                "Task {} is {} but not tracked by this process",
                id, record.state
            ))),
            None => Err(RpcError::new(
                crate::domain::error::ErrorKind::UnknownTask,
                format!("Task {} not found", id),
            )),
        }
    }

    /// Runtime view of a live task
    pub fn get_task(&self, id: TaskId) -> Option<TaskRecord> {
        self.inner.tasks.get(&id).map(|e| e.snapshot())
    }

    pub fn get_active_tasks(&self) -> Vec<TaskRecord> {
        self.get_tasks(TaskState::Running)
    }

    pub fn get_tasks(&self, state: TaskState) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .inner
            .tasks
            .iter()
            .map(|e| e.snapshot())
            .filter(|r| r.state == state)
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    pub fn list_queues(&self) -> Vec<QueueInfo> {
        self.inner
            .queues
            .lock()
            .values()
            .map(|queue| {
                let state = queue.state.lock();
                QueueInfo {
                    name: queue.name.clone(),
                    class: queue.class,
                    worker: state.worker,
                    active: state.active,
                    waiting: state.waiting.iter().copied().collect(),
                }
            })
            .collect()
    }

    /// Abort every live task and stop the queue workers
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();

        let mut live: Vec<TaskId> = inner.tasks.iter().map(|e| *e.key()).collect();
        live.sort_unstable();
        for id in live {
            if let Err(e) = self.abort(id).await {
                debug!(task_id = id, error = %e, "Skipping abort during shutdown");
            }
        }

        for queue in inner.queues.lock().values() {
            queue.notify.notify_one();
        }
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *inner.workers.lock());
        let grace = inner.abort_grace + Duration::from_secs(1);
        for worker in workers {
            if tokio::time::timeout(grace, worker).await.is_err() {
                warn!("Queue worker did not stop in time");
            }
        }
        info!("Balancer stopped");
    }
}

impl Inner {
    async fn submit(self: Arc<Self>, handler: TaskHandler, args: Value) -> Result<TaskId, RpcError> {
        let task = handler.instantiate();
        let key = task.queue_key(&args);
        let queue = self.queue(handler.queue_class, key.as_deref());

        let entry = {
            let _order = self.submissions.lock().await;
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let mut record = TaskRecord::new(id, &handler.name, args.clone());
            record.queue = Some(queue.name.clone());

            self.datastore
                .insert(collections::TASKS, serde_json::to_value(&record)?)
                .await
                .map_err(|e| RpcError::call_error(format!("Failed to record task: {}", e)))?;

            let (done, _) = watch::channel(None);
            let (verified, _) = watch::channel(false);
            let entry = Arc::new(TaskEntry {
                task,
                locks: handler.locks.clone(),
                queue: queue.name.clone(),
                record: Mutex::new(record.clone()),
                abort: CancellationToken::new(),
                verified,
                done,
            });
            self.tasks.insert(id, entry.clone());
            queue.state.lock().waiting.push_back(id);
            self.bus.emit(TASK_UPDATED, updated_payload(&record));
            entry
        };
        queue.notify.notify_one();

        let id = entry.snapshot().id;
        info!(task_id = id, task = %handler.name, queue = %queue.name, "Task submitted");

        let verdict = AssertUnwindSafe(entry.task.verify(&args))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(TaskFailure::message("Task verify panicked")));

        let rejected = match verdict {
            Ok(()) => None,
            Err(failure) => {
                info!(task_id = id, task = %handler.name, error = %failure, "Task rejected by verify");
                let mut state = queue.state.lock();
                state.waiting.retain(|queued| *queued != id);
                terminate_locked(&mut entry.record.lock(), TaskState::Failed, None, Some(failure))
            }
        };
        entry.verified.send_replace(true);
        if let Some(record) = rejected {
            self.finalize(&entry, record).await;
        }
        Ok(id)
    }

    fn queue(self: &Arc<Self>, class: QueueClass, key: Option<&str>) -> Arc<Queue> {
        let name = class.queue_name(key);
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(&name) {
            return queue.clone();
        }

        let queue = Arc::new(Queue {
            name: name.clone(),
            class,
            state: Mutex::new(QueueState {
                waiting: VecDeque::new(),
                active: None,
                worker: WorkerState::Idle,
            }),
            notify: Notify::new(),
        });
        queues.insert(name.clone(), queue.clone());

        let worker = tokio::spawn(run_worker(self.clone(), queue.clone()));
        self.workers.lock().push(worker);
        info!(queue = %name, "Created queue");
        queue
    }

    async fn load_record(&self, id: TaskId) -> Result<Option<TaskRecord>, RpcError> {
        let row = self
            .datastore
            .get_by_id(collections::TASKS, &json!(id))
            .await
            .map_err(|e| RpcError::call_error(e.to_string()))?;
        row.map(serde_json::from_value)
            .transpose()
            .map_err(|e| RpcError::call_error(format!("Corrupt task row {}: {}", id, e)))
    }

    /// Persist a terminal record, publish it, release the runtime entry and
    /// wake waiters
    async fn finalize(&self, entry: &Arc<TaskEntry>, record: TaskRecord) {
        let patch = json!({
            "state": record.state,
            "result": record.result,
            "error": record.error,
            "progress": record.progress,
            "started_at": record.started_at,
            "ended_at": record.ended_at,
        });
        if let Err(e) = self
            .datastore
            .update(collections::TASKS, &json!(record.id), patch)
            .await
        {
            warn!(task_id = record.id, error = %e, "Failed to persist task state");
        }

        self.bus.emit(TASK_UPDATED, updated_payload(&record));
        self.tasks.remove(&record.id);
        match record.state {
            TaskState::Failed => warn!(
                task_id = record.id,
                task = %record.name,
                error = ?record.error.as_ref().map(|e| &e.message),
                "Task failed"
            ),
            state => info!(task_id = record.id, task = %record.name, state = %state, "Task ended"),
        }
        entry.done.send_replace(Some(record));
    }

    async fn acquire_locks(&self, entry: &TaskEntry) -> Option<Vec<OwnedMutexGuard<()>>> {
        let mut names = entry.locks.clone();
        names.sort();
        names.dedup();

        let mut guards = Vec::with_capacity(names.len());
        for name in names {
            let lock = self
                .resource_locks
                .lock()
                .entry(name)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            tokio::select! {
                guard = lock.lock_owned() => guards.push(guard),
                _ = entry.abort.cancelled() => return None,
            }
        }
        Some(guards)
    }

    async fn execute(self: &Arc<Self>, queue: &Queue, id: TaskId) {
        let Some(entry) = self.tasks.get(&id).map(|e| e.value().clone()) else {
            return;
        };

        let mut verified = entry.verified.subscribe();
        tokio::select! {
            _ = verified.wait_for(|done| *done) => {}
            _ = entry.abort.cancelled() => {}
        }
        if entry.record.lock().state.is_terminal() {
            return;
        }

        let Some(_guards) = self.acquire_locks(&entry).await else {
            if let Some(record) = entry.terminate(TaskState::Aborted, None, None) {
                self.finalize(&entry, record).await;
            }
            return;
        };

        let running = {
            let mut record = entry.record.lock();
            if record.state.is_terminal() {
                return;
            }
            if entry.abort.is_cancelled() {
                terminate_locked(&mut record, TaskState::Aborted, None, None).map(Err)
            } else {
                record.state = TaskState::Running;
                record.started_at = Some(chrono::Utc::now());
                Some(Ok(record.clone()))
            }
        };
        let running = match running {
            Some(Ok(record)) => record,
            Some(Err(aborted)) => {
                self.finalize(&entry, aborted).await;
                return;
            }
            None => return,
        };

        if let Err(e) = self
            .datastore
            .update(
                collections::TASKS,
                &json!(id),
                json!({ "state": TaskState::Running, "started_at": running.started_at }),
            )
            .await
        {
            warn!(task_id = id, error = %e, "Failed to persist task state");
        }
        self.bus.emit(TASK_UPDATED, updated_payload(&running));
        info!(task_id = id, task = %running.name, queue = %queue.name, "Task started");

        let reporter = Arc::new(EntryProgress {
            entry: entry.clone(),
            bus: self.bus.clone(),
        });
        let ctx = TaskContext::new(id, running.name.clone(), reporter, entry.abort.clone());
        let task = entry.task.clone();
        let args = running.args.clone();
        let mut join = tokio::spawn(async move { task.run(&ctx, args).await });

        let joined = tokio::select! {
            joined = &mut join => Some(joined),
            _ = entry.abort.cancelled() => {
                match tokio::time::timeout(self.abort_grace, &mut join).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        warn!(task_id = id, "Task did not unwind after abort, cancelling it");
                        join.abort();
                        None
                    }
                }
            }
        };

        let record = if entry.abort.is_cancelled() {
            entry.terminate(TaskState::Aborted, None, None)
        } else {
            match joined {
                Some(Ok(Ok(result))) => entry.terminate(TaskState::Finished, Some(result), None),
                Some(Ok(Err(failure))) => entry.terminate(TaskState::Failed, None, Some(failure)),
                Some(Err(join_error)) => {
                    error!(task_id = id, error = %join_error, "Task panicked");
                    entry.terminate(
                        TaskState::Failed,
                        None,
                        Some(TaskFailure::message("Task panicked").with_trace(join_error.to_string())),
                    )
                }
                None => entry.terminate(TaskState::Aborted, None, None),
            }
        };

        if let Some(record) = record {
            self.finalize(&entry, record).await;
        }
    }
}

async fn run_worker(inner: Arc<Inner>, queue: Arc<Queue>) {
    debug!(queue = %queue.name, "Queue worker started");
    loop {
        let next = {
            let mut state = queue.state.lock();
            // Tasks still queued at shutdown are aborted by Balancer::shutdown
            if inner.shutdown.is_cancelled() {
                state.active = None;
                state.worker = WorkerState::Stopped;
                break;
            }
            match state.waiting.pop_front() {
                Some(id) => {
                    state.active = Some(id);
                    state.worker = WorkerState::Busy;
                    Some(id)
                }
                None => {
                    state.active = None;
                    state.worker = WorkerState::Idle;
                    None
                }
            }
        };

        match next {
            Some(id) => {
                inner.execute(&queue, id).await;
                queue.state.lock().active = None;
            }
            None => {
                tokio::select! {
                    _ = queue.notify.notified() => {}
                    _ = inner.shutdown.cancelled() => {}
                }
            }
        }
    }
    debug!(queue = %queue.name, "Queue worker stopped");
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("queues", &self.inner.queues.lock().len())
            .field("live_tasks", &self.inner.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorKind;
    use crate::domain::event::{Event, EventTypeSpec};
    use crate::domain::session::SessionId;
    use crate::infrastructure::datastore::InMemoryDatastore;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct Steps {
        percents: Vec<f64>,
    }

    #[async_trait]
    impl Task for Steps {
        async fn run(&self, ctx: &TaskContext, _args: Value) -> Result<Value, TaskFailure> {
            for percent in &self.percents {
                ctx.set_progress(*percent, format!("at {}", percent));
            }
            Ok(json!("ok"))
        }
    }

    struct Blocker;

    #[async_trait]
    impl Task for Blocker {
        fn queue_key(&self, args: &Value) -> Option<String> {
            args.get(0).and_then(Value::as_str).map(str::to_string)
        }

        async fn run(&self, ctx: &TaskContext, args: Value) -> Result<Value, TaskFailure> {
            let millis = args.get(1).and_then(Value::as_u64).unwrap_or(10_000);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(json!("slept")),
                _ = ctx.aborted() => Err(TaskFailure::message("interrupted")),
            }
        }
    }

    struct Picky;

    #[async_trait]
    impl Task for Picky {
        async fn verify(&self, args: &Value) -> Result<(), TaskFailure> {
            if args.get(0).is_none() {
                return Err(TaskFailure::new(22, "disk name required"));
            }
            Ok(())
        }

        async fn run(&self, _ctx: &TaskContext, _args: Value) -> Result<Value, TaskFailure> {
            Ok(Value::Null)
        }
    }

    /// Sleeps `args[1]` milliseconds in verify, queued on disk `args[0]`
    struct SlowVerify;

    #[async_trait]
    impl Task for SlowVerify {
        async fn verify(&self, args: &Value) -> Result<(), TaskFailure> {
            let millis = args.get(1).and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(())
        }

        fn queue_key(&self, args: &Value) -> Option<String> {
            args.get(0).and_then(Value::as_str).map(str::to_string)
        }

        async fn run(&self, _ctx: &TaskContext, _args: Value) -> Result<Value, TaskFailure> {
            Ok(json!("done"))
        }
    }

    struct Crashing;

    #[async_trait]
    impl Task for Crashing {
        async fn run(&self, _ctx: &TaskContext, _args: Value) -> Result<Value, TaskFailure> {
            panic!("unexpected disk layout");
        }
    }

    async fn balancer() -> (Balancer, EventBus, mpsc::Receiver<Event>) {
        let datastore = Arc::new(InMemoryDatastore::new());
        datastore.require_collection(collections::TASKS).await.unwrap();
        let bus = EventBus::new(256);
        bus.register_event_type(EventTypeSpec::new(TASK_UPDATED)).unwrap();
        bus.register_event_type(EventTypeSpec::new(TASK_PROGRESS)).unwrap();

        let session = SessionId::new();
        let rx = bus.attach(session);
        bus.subscribe(session, &["task.*".to_string()]).unwrap();

        let balancer = Balancer::new(datastore, bus.clone(), Duration::from_millis(500));
        balancer.start().await.unwrap();
        balancer
            .register_handler(TaskHandler::new("test.steps", || {
                Arc::new(Steps {
                    percents: vec![10.0, 50.0, 100.0],
                }) as Arc<dyn Task>
            }))
            .unwrap();
        balancer
            .register_handler(
                TaskHandler::new("disk.blocker", || Arc::new(Blocker) as Arc<dyn Task>)
                    .with_queue_class(QueueClass::Disk),
            )
            .unwrap();
        balancer
            .register_handler(TaskHandler::new("test.picky", || Arc::new(Picky) as Arc<dyn Task>))
            .unwrap();
        balancer
            .register_handler(
                TaskHandler::new("disk.slow_verify", || Arc::new(SlowVerify) as Arc<dyn Task>)
                    .with_queue_class(QueueClass::Disk),
            )
            .unwrap();
        balancer
            .register_handler(TaskHandler::new("test.crash", || Arc::new(Crashing) as Arc<dyn Task>))
            .unwrap();
        (balancer, bus, rx)
    }

    fn drain_for(rx: &mut mpsc::Receiver<Event>, id: TaskId) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.args["id"] == id {
                events.push(event);
            }
        }
        events
    }

    #[tokio::test]
    async fn test_lifecycle_events_in_order() {
        let (balancer, _bus, mut rx) = balancer().await;
        let id = balancer.submit("test.steps", json!([])).await.unwrap();
        let record = balancer.wait(id).await.unwrap();
        assert_eq!(record.state, TaskState::Finished);
        assert_eq!(record.result, Some(json!("ok")));

        let events = drain_for(&mut rx, id);
        let summary: Vec<String> = events
            .iter()
            .map(|e| match e.name.as_str() {
                TASK_UPDATED => e.args["state"].as_str().unwrap().to_string(),
                _ => format!("{}", e.args["percent"]),
            })
            .collect();
        assert_eq!(
            summary,
            vec!["WAITING", "RUNNING", "10.0", "50.0", "100.0", "FINISHED"]
        );
    }

    #[tokio::test]
    async fn test_unknown_task_name() {
        let (balancer, _bus, _rx) = balancer().await;
        let err = balancer.submit("nope", json!([])).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownTask);
    }

    #[tokio::test]
    async fn test_duplicate_handler_keeps_first() {
        let (balancer, _bus, _rx) = balancer().await;
        let err = balancer
            .register_handler(TaskHandler::new("test.steps", || Arc::new(Picky) as Arc<dyn Task>))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyRegistered);
        assert_eq!(balancer.handler("test.steps").unwrap().queue_class, QueueClass::Default);
    }

    #[tokio::test]
    async fn test_verify_failure_never_runs() {
        let (balancer, _bus, mut rx) = balancer().await;
        let id = balancer.submit("test.picky", json!([])).await.unwrap();
        let record = balancer.wait(id).await.unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert_eq!(record.error.unwrap().code, 22);
        assert!(record.started_at.is_none());

        let states: Vec<_> = drain_for(&mut rx, id)
            .iter()
            .map(|e| e.args["state"].clone())
            .collect();
        assert_eq!(states, vec![json!("WAITING"), json!("FAILED")]);
    }

    #[tokio::test]
    async fn test_abort_waiting_task() {
        let (balancer, _bus, mut rx) = balancer().await;
        let first = balancer.submit("disk.blocker", json!(["ada0", 200])).await.unwrap();
        let second = balancer.submit("disk.blocker", json!(["ada0", 200])).await.unwrap();

        balancer.abort(second).await.unwrap();
        let record = balancer.wait(second).await.unwrap();
        assert_eq!(record.state, TaskState::Aborted);

        let first_record = balancer.wait(first).await.unwrap();
        assert_eq!(first_record.state, TaskState::Finished);

        let events = drain_for(&mut rx, second);
        let aborted: Vec<_> = events
            .iter()
            .filter(|e| e.name == TASK_UPDATED && e.args["state"] == "ABORTED")
            .collect();
        assert_eq!(aborted.len(), 1);
        assert!(events.iter().all(|e| e.name != TASK_PROGRESS));
        assert!(events.iter().all(|e| e.args["state"] != "RUNNING"));

        let err = balancer.abort(second).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_abort_running_task() {
        let (balancer, _bus, _rx) = balancer().await;
        let id = balancer.submit("disk.blocker", json!(["ada1"])).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while balancer.get_task(id).map(|r| r.state) != Some(TaskState::Running) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(balancer.get_active_tasks().len(), 1);

        balancer.abort(id).await.unwrap();
        let record = balancer.wait(id).await.unwrap();
        assert_eq!(record.state, TaskState::Aborted);
        assert!(balancer.get_task(id).is_none());
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let (balancer, _bus, _rx) = balancer().await;
        let id = balancer.submit("test.crash", json!([])).await.unwrap();
        let record = balancer.wait(id).await.unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert_eq!(record.error.unwrap().message, "Task panicked");
    }

    #[tokio::test]
    async fn test_same_queue_is_serialized() {
        let (balancer, _bus, _rx) = balancer().await;
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(balancer.submit("disk.blocker", json!(["ada2", 20])).await.unwrap());
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let mut previous_end = None;
        for id in ids {
            let record = balancer.wait(id).await.unwrap();
            assert_eq!(record.queue.as_deref(), Some("disk:ada2"));
            if let Some(previous) = previous_end {
                assert!(record.started_at.unwrap() >= previous);
            }
            previous_end = record.ended_at;
        }

        let queues = balancer.list_queues();
        let queue = queues.iter().find(|q| q.name == "disk:ada2").unwrap();
        assert_eq!(queue.class, QueueClass::Disk);
        assert!(queue.waiting.is_empty());
    }

    #[tokio::test]
    async fn test_queue_order_ignores_verify_latency() {
        let (balancer, _bus, _rx) = balancer().await;
        let slow = {
            let balancer = balancer.clone();
            tokio::spawn(async move { balancer.submit("disk.slow_verify", json!(["ada0", 200])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fast = balancer.submit("disk.slow_verify", json!(["ada0", 0])).await.unwrap();
        let slow = slow.await.unwrap().unwrap();
        assert!(slow < fast);

        let slow = balancer.wait(slow).await.unwrap();
        let fast = balancer.wait(fast).await.unwrap();
        assert_eq!(slow.state, TaskState::Finished);
        assert_eq!(fast.state, TaskState::Finished);
        assert!(fast.started_at.unwrap() >= slow.ended_at.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_submit_still_runs() {
        let (balancer, _bus, _rx) = balancer().await;
        let submit = balancer.submit("disk.slow_verify", json!(["ada9", 300]));
        assert!(tokio::time::timeout(Duration::from_millis(50), submit).await.is_err());

        let record = tokio::time::timeout(Duration::from_secs(2), balancer.wait(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, TaskState::Finished);
        assert_eq!(record.queue.as_deref(), Some("disk:ada9"));
        assert!(balancer.list_queues().iter().all(|q| q.waiting.is_empty()));
    }

    #[tokio::test]
    async fn test_abort_during_verify() {
        let (balancer, _bus, _rx) = balancer().await;
        let submit = {
            let balancer = balancer.clone();
            tokio::spawn(async move { balancer.submit("disk.slow_verify", json!(["ada8", 200])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        balancer.abort(1).await.unwrap();
        assert_eq!(submit.await.unwrap().unwrap(), 1);
        assert_eq!(balancer.wait(1).await.unwrap().state, TaskState::Aborted);
    }

    #[tokio::test]
    async fn test_different_queues_run_in_parallel() {
        let (balancer, _bus, _rx) = balancer().await;
        let a = balancer.submit("disk.blocker", json!(["ada3", 300])).await.unwrap();
        let b = balancer.submit("disk.blocker", json!(["ada4", 300])).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while balancer.get_active_tasks().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        balancer.wait(a).await.unwrap();
        balancer.wait(b).await.unwrap();
    }

    #[tokio::test]
    async fn test_declared_locks_serialize_across_queues() {
        let (balancer, _bus, _rx) = balancer().await;
        balancer
            .register_handler(
                TaskHandler::new("pool.scrub", || Arc::new(Blocker) as Arc<dyn Task>)
                    .with_queue_class(QueueClass::Disk)
                    .with_locks(["pool:tank"]),
            )
            .unwrap();

        let a = balancer.submit("pool.scrub", json!(["ada5", 100])).await.unwrap();
        let b = balancer.submit("pool.scrub", json!(["ada6", 100])).await.unwrap();
        let a = balancer.wait(a).await.unwrap();
        let b = balancer.wait(b).await.unwrap();

        let (first, second) = if a.started_at <= b.started_at { (a, b) } else { (b, a) };
        assert!(second.started_at.unwrap() >= first.ended_at.unwrap());
    }

    #[tokio::test]
    async fn test_status_survives_in_datastore() {
        let datastore = Arc::new(InMemoryDatastore::new());
        datastore.require_collection(collections::TASKS).await.unwrap();
        datastore
            .insert(collections::TASKS, json!({"id": 41, "name": "old", "state": "RUNNING", "args": [], "created_at": chrono::Utc::now()}))
            .await
            .unwrap();

        let bus = EventBus::new(16);
        let balancer = Balancer::new(datastore.clone(), bus, Duration::from_millis(100));
        balancer.start().await.unwrap();
        balancer
            .register_handler(TaskHandler::new("test.picky", || Arc::new(Picky) as Arc<dyn Task>))
            .unwrap();

        let id = balancer.submit("test.picky", json!(["ada0"])).await.unwrap();
        assert_eq!(id, 42);

        let old = balancer.wait(41).await.unwrap();
        assert_eq!(old.state, TaskState::Aborted);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_live_tasks() {
        let (balancer, _bus, _rx) = balancer().await;
        let running = balancer.submit("disk.blocker", json!(["ada7"])).await.unwrap();
        let waiting = balancer.submit("disk.blocker", json!(["ada7"])).await.unwrap();

        balancer.shutdown().await;

        assert_eq!(balancer.wait(running).await.unwrap().state, TaskState::Aborted);
        assert_eq!(balancer.wait(waiting).await.unwrap().state, TaskState::Aborted);
        let err = balancer.submit("test.steps", json!([])).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }
}
