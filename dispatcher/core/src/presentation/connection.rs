// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Connection
//!
//! Transport-independent half of a client connection: owns the session,
//! its pending calls and its event channel. The WebSocket endpoint feeds it
//! text frames and drains [`Outbound`].
//!
//! Calls run in their own tokio tasks so a slow method never blocks the
//! read loop; results come back on the outbound channel in completion
//! order. Closing the connection forgets its pending calls without
//! cancelling them: they run to completion and their replies are dropped.
//!
//! The server can call the client too ([`Connection::call_client`]). Those
//! calls wait for the client's `rpc.response` or `rpc.error` and fail with
//! `CONNECTION_CLOSED` when the connection goes away first.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::dispatcher::Dispatcher;
use crate::domain::error::{ErrorKind, ErrorPayload, RpcError};
use crate::domain::event::Event;
use crate::domain::service::Caller;
use crate::domain::session::{ClientChannel, LoginGrant, SessionId, SessionInfo};
use crate::presentation::protocol::{namespace, Frame};

/// Receiving ends of a connection: replies and matched events
pub struct Outbound {
    pub frames: mpsc::UnboundedReceiver<Frame>,
    pub events: mpsc::Receiver<Event>,
}

pub struct Connection {
    dispatcher: Arc<Dispatcher>,
    session: SessionId,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    client_calls: Arc<ClientCalls>,
}

type ClientReply = Result<Value, RpcError>;

/// Calls the server made to the client, keyed by frame id
struct ClientCalls {
    outbound: mpsc::UnboundedSender<Frame>,
    waiting: Mutex<HashMap<String, oneshot::Sender<ClientReply>>>,
    timeout: Duration,
}

impl ClientCalls {
    fn resolve(&self, id: &str, reply: ClientReply) -> bool {
        match self.waiting.lock().remove(id) {
            Some(waiter) => waiter.send(reply).is_ok(),
            None => false,
        }
    }

    fn fail_all(&self) -> usize {
        let waiting: Vec<_> = self.waiting.lock().drain().collect();
        let count = waiting.len();
        for (_, waiter) in waiting {
            let _ = waiter.send(Err(RpcError::connection_closed()));
        }
        count
    }
}

#[async_trait]
impl ClientChannel for ClientCalls {
    async fn call(&self, method: &str, args: Value) -> Result<Value, RpcError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(id.clone(), tx);
        if self.outbound.send(Frame::rpc_call(id.clone(), method, args)).is_err() {
            self.waiting.lock().remove(&id);
            return Err(RpcError::connection_closed());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RpcError::connection_closed()),
            Err(_) => {
                self.waiting.lock().remove(&id);
                Err(RpcError::new(
                    ErrorKind::Timeout,
                    format!("Client did not answer {} within {}s", method, self.timeout.as_secs()),
                ))
            }
        }
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => None,
    }
}

impl Connection {
    pub fn open(dispatcher: Arc<Dispatcher>, address: Option<String>) -> (Self, Outbound) {
        let session = dispatcher.open_session(address);
        let events = dispatcher.event_bus().attach(session.id);
        let (outbound, frames) = mpsc::unbounded_channel();
        let client_calls = Arc::new(ClientCalls {
            outbound: outbound.clone(),
            waiting: Mutex::new(HashMap::new()),
            timeout: dispatcher.config().spec.server.client_call_timeout(),
        });
        dispatcher.bind_client(session.id, client_calls.clone());
        let connection = Self {
            dispatcher,
            session: session.id,
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            client_calls,
        };
        (connection, Outbound { frames, events })
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.dispatcher.session(self.session)
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Call `method` on the client and wait for its answer
    pub async fn call_client(&self, method: &str, args: Value) -> Result<Value, RpcError> {
        self.client_calls.call(method, args).await
    }

    fn send(&self, frame: Frame) {
        // Fails only after the transport dropped the receiver
        let _ = self.outbound.send(frame);
    }

    fn reply_error(&self, namespace: &str, id: Option<String>, error: RpcError) {
        debug!(session_id = %self.session, code = error.code(), error = %error.message, "Request failed");
        self.send(Frame::error(namespace, id, &error));
    }

    pub async fn handle_text(&self, text: &str) {
        match Frame::parse(text) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(e) => {
                debug!(session_id = %self.session, error = %e, "Malformed frame");
                self.reply_error(
                    namespace::RPC,
                    None,
                    RpcError::invalid_parameters(format!("Invalid request: {}", e)),
                );
            }
        }
    }

    pub async fn handle_frame(&self, frame: Frame) {
        match (frame.namespace.as_str(), frame.name.as_str()) {
            (namespace::RPC, "call") => self.rpc_call(frame),
            (namespace::RPC, "response" | "error") => self.client_reply(frame),
            (namespace::EVENTS, "subscribe") => self.subscribe(frame, true),
            (namespace::EVENTS, "unsubscribe") => self.subscribe(frame, false),
            (namespace::EVENTS, "event") => self.publish(frame),
            (namespace::TASK, "submit" | "status" | "abort") => self.task_call(frame),
            (namespace::MANAGEMENT, "login") => self.login(frame).await,
            (namespace::MANAGEMENT, "login_token") => self.login_token(frame).await,
            (namespace::MANAGEMENT, "login_service") => self.login_service(frame).await,
            (namespace::MANAGEMENT, "logout") => self.logout(frame).await,
            _ => {
                let namespace = frame.namespace.clone();
                self.reply_error(&namespace, frame.id, RpcError::invalid_parameters("Invalid request"));
            }
        }
    }

    /// The session, if it may call `method` in its current login state
    fn authorize(&self, method: &str) -> Result<SessionInfo, RpcError> {
        let session = self.session().ok_or_else(RpcError::connection_closed)?;
        if session.is_authenticated() {
            self.dispatcher.keepalive(self.session);
            return Ok(session);
        }
        let auth = &self.dispatcher.config().spec.auth;
        if auth.anonymous_introspection && method.starts_with("discovery.") {
            return Ok(session);
        }
        Err(RpcError::permission_denied("Not logged in"))
    }

    fn rpc_call(&self, frame: Frame) {
        let Some(id) = frame.id.clone() else {
            return self.reply_error(namespace::RPC, None, RpcError::invalid_parameters("Call without id"));
        };
        let Some(method) = frame.field("method", 0).and_then(Value::as_str).map(str::to_string) else {
            return self.reply_error(
                namespace::RPC,
                Some(id),
                RpcError::invalid_parameters("Call without method"),
            );
        };
        let args = frame.field("args", 1).cloned().unwrap_or(Value::Null);
        self.spawn_call(namespace::RPC, id, method, args);
    }

    /// The client's answer to a call made with [`Connection::call_client`]
    fn client_reply(&self, frame: Frame) {
        let Some(id) = frame.id else {
            debug!(session_id = %self.session, "Client reply without id");
            return;
        };
        let reply = if frame.name == "error" {
            match serde_json::from_value::<ErrorPayload>(frame.args) {
                Ok(payload) => Err(RpcError::from_payload(payload)),
                Err(e) => Err(RpcError::call_error(format!("Malformed error from client: {}", e))),
            }
        } else {
            Ok(frame.args)
        };
        if !self.client_calls.resolve(&id, reply) {
            debug!(session_id = %self.session, call_id = %id, "Reply to unknown client call");
        }
    }

    fn task_call(&self, frame: Frame) {
        let Some(id) = frame.id.clone() else {
            return self.reply_error(namespace::TASK, None, RpcError::invalid_parameters("Request without id"));
        };
        let args = match frame.name.as_str() {
            "submit" => {
                let name = frame.field("name", 0).cloned().unwrap_or(Value::Null);
                let args = frame.field("args", 1).cloned().unwrap_or_else(|| json!([]));
                json!([name, args])
            }
            _ => json!([frame.field("id", 0).cloned().unwrap_or(Value::Null)]),
        };
        self.spawn_call(namespace::TASK, id, format!("task.{}", frame.name), args);
    }

    fn spawn_call(&self, namespace: &'static str, id: String, method: String, args: Value) {
        let session = match self.authorize(&method) {
            Ok(session) => session,
            Err(e) => return self.reply_error(namespace, Some(id), e),
        };

        let mut pending = self.pending.lock();
        if pending.contains_key(&id) {
            drop(pending);
            return self.reply_error(
                namespace,
                Some(id.clone()),
                RpcError::invalid_parameters(format!("Call {} is already pending", id)),
            );
        }

        let dispatcher = self.dispatcher.clone();
        let outbound = self.outbound.clone();
        let pending_calls = self.pending.clone();
        let call_id = id.clone();
        let session_id = self.session;
        let handle = tokio::spawn(async move {
            let result = dispatcher
                .rpc()
                .dispatch_call(&method, args, Caller::Session(session))
                .await;
            let frame = match result {
                Ok(value) => Frame::response(namespace, Some(call_id.clone()), value),
                Err(e) => {
                    debug!(session_id = %session_id, method = %method, code = e.code(), error = %e.message, "Call failed");
                    Frame::error(namespace, Some(call_id.clone()), &e)
                }
            };
            // Queue the reply before the id is released so a drained
            // connection never misses it
            let mut pending = pending_calls.lock();
            let _ = outbound.send(frame);
            pending.remove(&call_id);
        });
        pending.insert(id, handle);
    }

    fn subscribe(&self, frame: Frame, add: bool) {
        if !self.session().is_some_and(|s| s.is_authenticated()) {
            return self.reply_error(namespace::EVENTS, frame.id, RpcError::permission_denied("Not logged in"));
        }
        let Some(masks) = string_list(&frame.args) else {
            return self.reply_error(
                namespace::EVENTS,
                frame.id,
                RpcError::invalid_parameters("Expected a list of event masks"),
            );
        };

        let bus = self.dispatcher.event_bus();
        let result = if add {
            bus.subscribe(self.session, &masks)
        } else {
            bus.unsubscribe(self.session, &masks)
        };
        match result {
            Ok(active) => {
                debug!(session_id = %self.session, masks = ?active, "Subscriptions changed");
                self.send(Frame::ack(namespace::EVENTS, frame.id, json!(active)));
            }
            Err(e) => self.reply_error(namespace::EVENTS, frame.id, e.into()),
        }
    }

    /// `events.event` from a privileged client is published on the bus
    fn publish(&self, frame: Frame) {
        if !self.session().is_some_and(|s| s.is_privileged()) {
            return self.reply_error(
                namespace::EVENTS,
                frame.id,
                RpcError::permission_denied("Publishing events requires a privileged session"),
            );
        }
        let Some(name) = frame.field("name", 0).and_then(Value::as_str).map(str::to_string) else {
            return self.reply_error(namespace::EVENTS, frame.id, RpcError::invalid_parameters("Event without name"));
        };
        if !self.dispatcher.event_bus().is_registered(&name) {
            return self.reply_error(
                namespace::EVENTS,
                frame.id,
                RpcError::invalid_parameters(format!("Event type {} is not registered", name)),
            );
        }
        let args = frame.field("args", 1).cloned().unwrap_or(Value::Null);
        let delivered = self.dispatcher.emit_event(&name, args);
        if frame.id.is_some() {
            self.send(Frame::ack(namespace::EVENTS, frame.id, json!(delivered)));
        }
    }

    /// With authentication disabled every login form succeeds as the
    /// session's local principal
    fn local_grant(&self) -> Option<LoginGrant> {
        if self.dispatcher.config().spec.auth.enabled {
            return None;
        }
        self.session()
            .and_then(|s| s.principal)
            .map(LoginGrant::without_token)
    }

    fn reply_login(&self, id: Option<String>, result: Result<LoginGrant, RpcError>) {
        match result {
            Ok(grant) => self.send(Frame::response(namespace::MANAGEMENT, id, json!(grant))),
            Err(e) => self.reply_error(namespace::MANAGEMENT, id, e),
        }
    }

    async fn login(&self, frame: Frame) {
        if let Some(grant) = self.local_grant() {
            return self.reply_login(frame.id, Ok(grant));
        }

        let username = frame.field("username", 0).and_then(Value::as_str).map(str::to_string);
        let password = frame.field("password", 1).and_then(Value::as_str).map(str::to_string);
        let (Some(username), Some(password)) = (username, password) else {
            return self.reply_error(
                namespace::MANAGEMENT,
                frame.id,
                RpcError::invalid_parameters("Login requires username and password"),
            );
        };

        let result = self.dispatcher.login(self.session, &username, &password).await;
        self.reply_login(frame.id, result);
    }

    async fn login_token(&self, frame: Frame) {
        if let Some(grant) = self.local_grant() {
            return self.reply_login(frame.id, Ok(grant));
        }
        let Some(token) = frame.field("token", 0).and_then(Value::as_str).map(str::to_string) else {
            return self.reply_error(
                namespace::MANAGEMENT,
                frame.id,
                RpcError::invalid_parameters("Token login requires a token"),
            );
        };
        let result = self.dispatcher.login_token(self.session, &token).await;
        self.reply_login(frame.id, result);
    }

    async fn login_service(&self, frame: Frame) {
        if let Some(grant) = self.local_grant() {
            return self.reply_login(frame.id, Ok(grant));
        }
        let Some(name) = frame.field("name", 0).and_then(Value::as_str).map(str::to_string) else {
            return self.reply_error(
                namespace::MANAGEMENT,
                frame.id,
                RpcError::invalid_parameters("Service login requires a name"),
            );
        };
        let result = self.dispatcher.login_service(self.session, &name).await;
        self.reply_login(frame.id, result);
    }

    async fn logout(&self, frame: Frame) {
        self.dispatcher.logout(self.session).await;
        self.send(Frame::response(namespace::MANAGEMENT, frame.id, Value::Null));
    }

    /// Wait until no call is pending, at most `timeout`
    pub async fn drain(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.pending_calls() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Forget pending calls, fail calls waiting on the client and release
    /// the session
    pub async fn close(self) {
        let failed = self.client_calls.fail_all();
        if failed > 0 {
            debug!(session_id = %self.session, failed, "Client calls failed on close");
        }
        let pending: Vec<(String, JoinHandle<()>)> = self.pending.lock().drain().collect();
        if !pending.is_empty() {
            let closed = RpcError::connection_closed();
            for (id, _detached) in pending {
                debug!(session_id = %self.session, call_id = %id, error = %closed, "Dropping reply of pending call");
            }
        }
        if self.outbound.is_closed() {
            warn!(session_id = %self.session, "Transport dropped before connection close");
        }
        self.dispatcher.close_session(self.session).await;
    }
}
