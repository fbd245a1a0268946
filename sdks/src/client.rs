// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use dispatcher_core::presentation::protocol::{namespace, Frame};

use crate::types::{ClientError, ErrorPayload, Event, LoginGrant, QueueInfo, RpcError, TaskId, TaskRecord};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 1024;

type Reply = Result<Value, ClientError>;
type CallHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// State shared by the client handle and its reader task
struct Shared {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    handlers: Mutex<HashMap<String, CallHandler>>,
    events: broadcast::Sender<Event>,
    logged_out: AtomicBool,
}

impl Shared {
    fn new(outbound: mpsc::UnboundedSender<Message>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            events,
            logged_out: AtomicBool::new(false),
        }
    }

    fn send(&self, frame: Frame) -> bool {
        self.outbound.send(Message::Text(frame.to_text())).is_ok()
    }

    /// The writer stops after sending this
    fn send_close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

/// Client for the dispatcher's WebSocket protocol.
///
/// Requests are multiplexed over one socket; events are fanned out to every
/// [`MiddlewareClient::events`] receiver. Methods registered with
/// [`MiddlewareClient::on_call`] answer calls the server makes.
pub struct MiddlewareClient {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl MiddlewareClient {
    /// Connect to `ws://host:port/socket`
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (socket, _) = connect_async(url).await.map_err(ClientError::Connect)?;
        debug!(url = %url, "Connected to dispatcher");
        let (mut sink, mut stream) = socket.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "Send failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let shared = Arc::new(Shared::new(outbound));
        let reader = {
            let shared = shared.clone();
            tokio::spawn(async move {
                while let Some(message) = stream.next().await {
                    match message {
                        Ok(Message::Text(text)) => match Frame::parse(&text) {
                            Ok(frame) => route(frame, &shared),
                            Err(e) => warn!(error = %e, "Ignoring malformed frame"),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!(error = %e, "Socket error");
                            break;
                        }
                    }
                }
                for (_, waiter) in shared.pending.lock().drain() {
                    let _ = waiter.send(Err(ClientError::Closed));
                }
            })
        };

        Ok(Self {
            shared,
            next_id: AtomicU64::new(1),
            timeout: DEFAULT_TIMEOUT,
            reader,
            writer,
        })
    }

    /// Per-request reply timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// New receiver for events matching this connection's subscriptions
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// The server announced it is shutting down
    pub fn is_logged_out(&self) -> bool {
        self.shared.logged_out.load(Ordering::SeqCst)
    }

    /// Answer server calls to `method` with `handler`. Calls to methods
    /// without a handler are answered with `METHOD_NOT_FOUND`.
    pub fn on_call<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let handler: CallHandler = Arc::new(move |args| handler(args).boxed());
        self.shared.handlers.lock().insert(method.to_string(), handler);
    }

    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished()
    }

    async fn request(&self, namespace: &str, name: &str, args: Value) -> Reply {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id.clone(), tx);

        if !self.shared.send(Frame::new(namespace, name, Some(id.clone()), args)) {
            self.shared.pending.lock().remove(&id);
            return Err(ClientError::Closed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(ClientError::Timeout(self.timeout))
            }
        }
    }

    /// The grant's token logs a later connection back in with
    /// [`MiddlewareClient::login_token`]
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginGrant, ClientError> {
        let reply = self
            .request(
                namespace::MANAGEMENT,
                "login",
                json!({ "username": username, "password": password }),
            )
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Resume a login. The token is spent; use the one in the new grant next.
    pub async fn login_token(&self, token: &str) -> Result<LoginGrant, ClientError> {
        let reply = self
            .request(namespace::MANAGEMENT, "login_token", json!({ "token": token }))
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Log in as a local service listed in the server's `auth.services`
    pub async fn login_service(&self, name: &str) -> Result<LoginGrant, ClientError> {
        let reply = self
            .request(namespace::MANAGEMENT, "login_service", json!({ "name": name }))
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn logout(&self) -> Result<(), ClientError> {
        self.request(namespace::MANAGEMENT, "logout", Value::Null).await?;
        Ok(())
    }

    /// `rpc.call`; `args` is the positional argument array
    pub async fn call(&self, method: &str, args: Value) -> Result<Value, ClientError> {
        self.request(namespace::RPC, "call", json!({ "method": method, "args": args }))
            .await
    }

    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: Value) -> Result<T, ClientError> {
        Ok(serde_json::from_value(self.call(method, args).await?)?)
    }

    /// Returns the session's resulting mask set
    pub async fn subscribe(&self, masks: &[&str]) -> Result<Vec<String>, ClientError> {
        let reply = self.request(namespace::EVENTS, "subscribe", json!(masks)).await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn unsubscribe(&self, masks: &[&str]) -> Result<Vec<String>, ClientError> {
        let reply = self.request(namespace::EVENTS, "unsubscribe", json!(masks)).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Publish an event; needs a privileged session
    pub async fn emit(&self, name: &str, args: Value) -> Result<(), ClientError> {
        self.request(namespace::EVENTS, "event", json!({ "name": name, "args": args }))
            .await?;
        Ok(())
    }

    pub async fn submit_task(&self, name: &str, args: Value) -> Result<TaskId, ClientError> {
        let reply = self
            .request(namespace::TASK, "submit", json!({ "name": name, "args": args }))
            .await?;
        reply
            .as_u64()
            .ok_or_else(|| ClientError::Protocol(format!("task id {} is not an integer", reply)))
    }

    pub async fn task_status(&self, id: TaskId) -> Result<TaskRecord, ClientError> {
        let reply = self.request(namespace::TASK, "status", json!({ "id": id })).await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn abort_task(&self, id: TaskId) -> Result<(), ClientError> {
        self.request(namespace::TASK, "abort", json!({ "id": id })).await?;
        Ok(())
    }

    pub async fn list_queues(&self) -> Result<Vec<QueueInfo>, ClientError> {
        self.call_as("task.list_queues", json!([])).await
    }

    pub async fn list_tasks(&self, limit: Option<usize>) -> Result<Vec<TaskRecord>, ClientError> {
        self.call_as("task.list_tasks", json!([limit])).await
    }

    /// Wait for a task to reach a terminal state. Adds `task.updated` to the
    /// session's subscriptions.
    pub async fn wait_task(&self, id: TaskId) -> Result<TaskRecord, ClientError> {
        let mut events = self.events();
        self.subscribe(&["task.updated"]).await?;

        let record = self.task_status(id).await?;
        if record.state.is_terminal() {
            return Ok(record);
        }

        loop {
            match events.recv().await {
                Ok(event) if event.name == "task.updated" && event.args["id"] == json!(id) => {
                    let terminal = event.args["state"]
                        .as_str()
                        .is_some_and(|s| matches!(s, "FINISHED" | "FAILED" | "ABORTED"));
                    if terminal {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event receiver lagged; polling task status");
                    if self.task_status(id).await?.state.is_terminal() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ClientError::Closed),
            }
        }

        self.task_status(id).await
    }

    pub async fn close(self) {
        self.shared.send_close();
        let _ = self.writer.await;
        self.reader.abort();
    }
}

fn route(frame: Frame, shared: &Shared) {
    match (frame.id, frame.namespace.as_str(), frame.name.as_str()) {
        (Some(id), namespace::RPC, "call") => answer_call(id, frame.args, shared),
        (Some(id), _, name) => {
            let Some(waiter) = shared.pending.lock().remove(&id) else {
                debug!(id = %id, "Reply for unknown request");
                return;
            };
            let reply = if name == "error" {
                match serde_json::from_value::<ErrorPayload>(frame.args) {
                    Ok(payload) => Err(ClientError::Rpc(RpcError::from_payload(payload))),
                    Err(e) => Err(ClientError::Protocol(e.to_string())),
                }
            } else {
                Ok(frame.args)
            };
            let _ = waiter.send(reply);
        }
        (None, namespace::EVENTS, "event") => {
            match serde_json::from_value::<Event>(frame.args) {
                // send() only fails when nobody holds a receiver
                Ok(event) => {
                    let _ = shared.events.send(event);
                }
                Err(e) => warn!(error = %e, "Ignoring malformed event"),
            }
        }
        (None, namespace::EVENTS, "logout") => {
            debug!("Server is closing the session");
            shared.logged_out.store(true, Ordering::SeqCst);
        }
        (None, namespace, name) => {
            if name == "error" {
                warn!(namespace = %namespace, error = %frame.args, "Server reported an error");
            } else {
                debug!(namespace = %namespace, name = %name, "Ignoring unsolicited frame");
            }
        }
    }
}

/// Run the handler for a server call off the reader task and send back
/// `rpc.response` or `rpc.error` under the call's id
fn answer_call(id: String, args: Value, shared: &Shared) {
    let method = args["method"].as_str().unwrap_or_default().to_string();
    let handler = shared.handlers.lock().get(&method).cloned();
    let Some(handler) = handler else {
        debug!(id = %id, method = %method, "Server called an unhandled method");
        let (service, name) = method.rsplit_once('.').unwrap_or(("", method.as_str()));
        shared.send(Frame::error(
            namespace::RPC,
            Some(id),
            &RpcError::method_not_found(service, name),
        ));
        return;
    };

    let outbound = shared.outbound.clone();
    let call_args = args.get("args").cloned().unwrap_or(Value::Null);
    tokio::spawn(async move {
        let frame = match handler(call_args).await {
            Ok(result) => Frame::response(namespace::RPC, Some(id), result),
            Err(e) => Frame::error(namespace::RPC, Some(id), &e),
        };
        let _ = outbound.send(Message::Text(frame.to_text()));
    });
}
