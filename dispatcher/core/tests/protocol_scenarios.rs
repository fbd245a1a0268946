// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use dispatcher_core::application::plugin_loader::{Plugin, PluginContext};
use dispatcher_core::application::rpc_context::RpcService;
use dispatcher_core::domain::error::ErrorKind;
use dispatcher_core::domain::event::{Event, EventTypeSpec};
use dispatcher_core::domain::node_config::{DispatcherConfig, UserConfig};
use dispatcher_core::domain::service::{CallContext, MethodDescriptor};
use dispatcher_core::domain::task::{QueueClass, Task, TaskContext, TaskFailure, TaskHandler, TaskState};
use dispatcher_core::infrastructure::auth::StaticAuthenticator;
use dispatcher_core::infrastructure::datastore::InMemoryDatastore;
use dispatcher_core::presentation::{Connection, Frame, Outbound};
use dispatcher_core::{Dispatcher, DispatcherBuilder, RpcError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Sleep;

#[async_trait]
impl Task for Sleep {
    async fn run(&self, ctx: &TaskContext, _args: Value) -> Result<Value, TaskFailure> {
        for percent in [10.0, 50.0, 100.0] {
            tokio::time::sleep(Duration::from_millis(5)).await;
            ctx.set_progress(percent, format!("{}%", percent));
        }
        Ok(json!("ok"))
    }
}

/// Holds its disk until aborted or until `args[1]` milliseconds pass
struct DiskHold;

#[async_trait]
impl Task for DiskHold {
    fn queue_key(&self, args: &Value) -> Option<String> {
        args[0].as_str().map(str::to_string)
    }

    async fn run(&self, ctx: &TaskContext, args: Value) -> Result<Value, TaskFailure> {
        let millis = args[1].as_u64().unwrap_or(200);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => {}
            _ = ctx.aborted() => return Err(TaskFailure::message("aborted")),
        }
        ctx.set_progress(100.0, "done");
        Ok(json!(args[0]))
    }
}

/// Takes `args[1]` milliseconds to accept its arguments
struct SlowVerify;

#[async_trait]
impl Task for SlowVerify {
    async fn verify(&self, args: &Value) -> Result<(), TaskFailure> {
        let millis = args[1].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(())
    }

    fn queue_key(&self, args: &Value) -> Option<String> {
        args[0].as_str().map(str::to_string)
    }

    async fn run(&self, _ctx: &TaskContext, _args: Value) -> Result<Value, TaskFailure> {
        Ok(json!("verified"))
    }
}

struct TestPlugin;

#[async_trait]
impl Plugin for TestPlugin {
    fn name(&self) -> &str {
        "test"
    }

    async fn init(&self, ctx: &mut PluginContext) -> anyhow::Result<()> {
        ctx.register_task_handler(TaskHandler::new("test.sleep", || Arc::new(Sleep) as Arc<dyn Task>))?;
        ctx.register_task_handler(
            TaskHandler::new("disk.hold", || Arc::new(DiskHold) as Arc<dyn Task>)
                .with_queue_class(QueueClass::Disk),
        )?;
        ctx.register_task_handler(
            TaskHandler::new("disk.slow_verify", || Arc::new(SlowVerify) as Arc<dyn Task>)
                .with_queue_class(QueueClass::Disk),
        )?;
        ctx.register_event_type(EventTypeSpec::new("system.device.attached"))?;
        Ok(())
    }
}

struct Shares;

#[async_trait]
impl RpcService for Shares {
    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![MethodDescriptor::new("query")]
    }

    async fn call(&self, _method: &str, _args: Vec<Value>, _ctx: &CallContext) -> Result<Value, RpcError> {
        Ok(json!([]))
    }
}

struct BrokenPlugin;

#[async_trait]
impl Plugin for BrokenPlugin {
    fn name(&self) -> &str {
        "broken"
    }

    async fn init(&self, ctx: &mut PluginContext) -> anyhow::Result<()> {
        ctx.register_service("shares", Arc::new(Shares)).await?;
        anyhow::bail!("smb.conf is unreadable")
    }
}

fn config() -> DispatcherConfig {
    let mut config = DispatcherConfig::default();
    config.spec.auth.users = vec![
        UserConfig {
            username: "root".into(),
            password_sha256: StaticAuthenticator::hash_password("secret"),
            privileged: true,
        },
        UserConfig {
            username: "guest".into(),
            password_sha256: StaticAuthenticator::hash_password("guest"),
            privileged: false,
        },
    ];
    config
}

async fn dispatcher() -> Arc<Dispatcher> {
    dispatcher_with(config()).await
}

async fn dispatcher_with(config: DispatcherConfig) -> Arc<Dispatcher> {
    DispatcherBuilder::new(config)
        .with_datastore(Arc::new(InMemoryDatastore::new()))
        .plugin(Arc::new(TestPlugin))
        .plugin(Arc::new(BrokenPlugin))
        .build()
        .await
        .unwrap()
}

struct Client {
    connection: Connection,
    outbound: Outbound,
    next_id: u64,
}

impl Client {
    fn open(dispatcher: &Arc<Dispatcher>) -> Self {
        Self::open_from(dispatcher, "127.0.0.1:50000")
    }

    fn open_from(dispatcher: &Arc<Dispatcher>, address: &str) -> Self {
        let (connection, outbound) = Connection::open(dispatcher.clone(), Some(address.into()));
        Self {
            connection,
            outbound,
            next_id: 0,
        }
    }

    fn id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    async fn frame(&mut self) -> Frame {
        timeout(WAIT, self.outbound.frames.recv()).await.unwrap().unwrap()
    }

    async fn reply_to(&mut self, id: &str) -> Frame {
        loop {
            let frame = self.frame().await;
            if frame.id.as_deref() == Some(id) {
                return frame;
            }
        }
    }

    async fn request(&mut self, namespace: &str, name: &str, args: Value) -> Frame {
        let id = self.id();
        self.connection
            .handle_frame(Frame::new(namespace, name, Some(id.clone()), args))
            .await;
        self.reply_to(&id).await
    }

    async fn call(&mut self, method: &str, args: Value) -> Frame {
        let id = self.id();
        self.connection.handle_frame(Frame::rpc_call(id.clone(), method, args)).await;
        self.reply_to(&id).await
    }

    async fn login(&mut self, username: &str, password: &str) -> Frame {
        self.request("management", "login", json!({"username": username, "password": password}))
            .await
    }

    async fn event(&mut self) -> Event {
        timeout(WAIT, self.outbound.events.recv()).await.unwrap().unwrap()
    }

    /// Events about task `id` up to and including its terminal update
    async fn task_events(&mut self, id: u64) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            let event = self.event().await;
            if event.args["id"] != json!(id) {
                continue;
            }
            let terminal = event.name == "task.updated"
                && matches!(event.args["state"].as_str(), Some("FINISHED" | "FAILED" | "ABORTED"));
            events.push(event);
            if terminal {
                return events;
            }
        }
    }
}

fn code(frame: &Frame) -> i32 {
    frame.args["code"].as_i64().unwrap() as i32
}

#[tokio::test]
async fn echo_call_lists_builtin_services() {
    let dispatcher = dispatcher().await;
    let mut client = Client::open(&dispatcher);

    client
        .connection
        .handle_text(r#"{"namespace":"rpc","name":"call","id":"1","args":{"method":"discovery.get_services","args":[]}}"#)
        .await;
    let reply = client.frame().await;
    assert_eq!(reply.namespace, "rpc");
    assert_eq!(reply.name, "response");
    assert_eq!(reply.id.as_deref(), Some("1"));
    let services: Vec<String> = serde_json::from_value(reply.args).unwrap();
    for name in ["discovery", "management", "task"] {
        assert!(services.contains(&name.to_string()));
    }

    client.connection.close().await;
    dispatcher.stop().await;
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let dispatcher = dispatcher().await;
    let mut client = Client::open(&dispatcher);

    let reply = client.call("discovery.nope", json!([])).await;
    assert_eq!(reply.name, "error");
    assert_eq!(code(&reply), ErrorKind::MethodNotFound.code());

    client.connection.close().await;
    dispatcher.stop().await;
}

#[tokio::test]
async fn task_submit_reports_progress_in_order() {
    let dispatcher = dispatcher().await;
    let mut client = Client::open(&dispatcher);
    assert_eq!(client.login("guest", "guest").await.name, "response");
    let ack = client.request("events", "subscribe", json!(["task.*"])).await;
    assert_eq!(ack.name, "ack");

    let reply = client.call("task.submit", json!(["test.sleep", []])).await;
    assert_eq!(reply.name, "response");
    let id = reply.args.as_u64().unwrap();

    let events = client.task_events(id).await;
    let summary: Vec<String> = events
        .iter()
        .map(|e| match e.name.as_str() {
            "task.updated" => e.args["state"].as_str().unwrap().to_string(),
            _ => format!("{}", e.args["percent"].as_f64().unwrap()),
        })
        .collect();
    assert_eq!(summary, vec!["WAITING", "RUNNING", "10", "50", "100", "FINISHED"]);
    assert_eq!(events.last().unwrap().args["result"], json!("ok"));

    let status = client.call("task.status", json!([id])).await;
    assert_eq!(status.args["state"], json!("FINISHED"));

    client.connection.close().await;
    dispatcher.stop().await;
}

#[tokio::test]
async fn aborting_a_waiting_disk_task() {
    let dispatcher = dispatcher().await;
    let mut client = Client::open(&dispatcher);
    client.login("root", "secret").await;
    client.request("events", "subscribe", json!(["task.*"])).await;

    let first = client
        .request("task", "submit", json!({"name": "disk.hold", "args": ["ada0", 300]}))
        .await
        .args
        .as_u64()
        .unwrap();
    let second = client
        .request("task", "submit", json!({"name": "disk.hold", "args": ["ada0", 10]}))
        .await
        .args
        .as_u64()
        .unwrap();

    let aborted = client.request("task", "abort", json!({"id": second})).await;
    assert_eq!(aborted.name, "response");

    let second_events = client.task_events(second).await;
    assert_eq!(second_events.len(), 2, "{:?}", second_events);
    assert_eq!(second_events[1].args["state"], json!("ABORTED"));
    assert!(second_events.iter().all(|e| e.name != "task.progress"));

    let first_record = dispatcher.balancer().wait(first).await.unwrap();
    assert_eq!(first_record.result, Some(json!("ada0")));

    client.connection.close().await;
    dispatcher.stop().await;
}

#[tokio::test]
async fn subscription_masks_filter_events() {
    let dispatcher = dispatcher().await;
    let mut client = Client::open(&dispatcher);
    client.login("guest", "guest").await;
    client.request("events", "subscribe", json!(["task.*"])).await;

    dispatcher.emit_event("system.device.attached", json!({"name": "da3"}));
    let id = client
        .call("task.submit", json!(["test.sleep"]))
        .await
        .args
        .as_u64()
        .unwrap();
    let events = client.task_events(id).await;
    assert!(events.iter().all(|e| e.name.starts_with("task.")));
    assert!(client.outbound.events.try_recv().is_err());

    let ack = client.request("events", "unsubscribe", json!(["task.*"])).await;
    assert_eq!(ack.args, json!([]));

    client.connection.close().await;
    dispatcher.stop().await;
}

#[tokio::test]
async fn broken_plugin_is_isolated() {
    let dispatcher = dispatcher().await;
    let mut client = Client::open(&dispatcher);
    client.login("root", "secret").await;

    let reload = client.call("management.reload_plugins", json!([])).await;
    assert_eq!(reload.name, "response");

    let services = client.call("discovery.get_services", json!([])).await;
    assert!(!services.args.as_array().unwrap().contains(&json!("shares")));

    let status = client.call("management.status", json!([])).await;
    let plugins = status.args["plugins"].as_array().unwrap();
    let broken = plugins.iter().find(|p| p["name"] == json!("broken")).unwrap();
    assert_eq!(broken["state"], json!("ERROR"));

    client.connection.close().await;
    dispatcher.stop().await;
}

#[tokio::test]
async fn anonymous_sessions_only_reach_introspection() {
    let dispatcher = dispatcher().await;
    let mut client = Client::open(&dispatcher);

    assert_eq!(client.call("discovery.get_tasks", json!([])).await.name, "response");
    let denied = client.call("task.list_tasks", json!([])).await;
    assert_eq!(code(&denied), ErrorKind::PermissionDenied.code());
    let denied = client.request("events", "subscribe", json!(["*"])).await;
    assert_eq!(code(&denied), ErrorKind::PermissionDenied.code());

    let failed = client.login("root", "wrong").await;
    assert_eq!(code(&failed), ErrorKind::PermissionDenied.code());

    client.login("guest", "guest").await;
    let denied = client.call("management.status", json!([])).await;
    assert_eq!(code(&denied), ErrorKind::PermissionDenied.code());

    client.request("management", "logout", Value::Null).await;
    let denied = client.call("task.list_tasks", json!([])).await;
    assert_eq!(code(&denied), ErrorKind::PermissionDenied.code());

    client.connection.close().await;
    dispatcher.stop().await;
}

#[tokio::test]
async fn malformed_and_unknown_frames_are_rejected() {
    let dispatcher = dispatcher().await;
    let mut client = Client::open(&dispatcher);

    client.connection.handle_text("{not json").await;
    let reply = client.frame().await;
    assert_eq!(reply.name, "error");
    assert_eq!(code(&reply), ErrorKind::InvalidParameters.code());

    let reply = client.request("rpc", "teleport", json!({})).await;
    assert_eq!(reply.name, "error");
    assert_eq!(reply.args["message"], json!("Invalid request"));

    client.connection.close().await;
    dispatcher.stop().await;
}

#[tokio::test]
async fn login_records_a_session_row() {
    let dispatcher = dispatcher().await;
    let mut client = Client::open(&dispatcher);
    let reply = client.login("root", "secret").await;
    assert_eq!(reply.args["username"], json!("root"));
    assert_eq!(reply.args["privileged"], json!(true));

    let rows = dispatcher
        .datastore()
        .query("sessions", &[], &Default::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["active"], json!(true));

    client.connection.close().await;
    let rows = dispatcher
        .datastore()
        .query("sessions", &[], &Default::default())
        .await
        .unwrap();
    assert_eq!(rows[0]["active"], json!(false));
    assert!(rows[0].get("ended_at").is_some());
    dispatcher.stop().await;
}

#[tokio::test]
async fn privileged_clients_publish_events() {
    let dispatcher = dispatcher().await;
    let mut guest = Client::open(&dispatcher);
    guest.login("guest", "guest").await;
    guest.request("events", "subscribe", json!(["system.*"])).await;

    let denied = guest
        .request("events", "event", json!({"name": "system.device.attached", "args": {}}))
        .await;
    assert_eq!(code(&denied), ErrorKind::PermissionDenied.code());

    let mut root = Client::open(&dispatcher);
    root.login("root", "secret").await;
    let ack = root
        .request("events", "event", json!({"name": "system.device.attached", "args": {"name": "da0"}}))
        .await;
    assert_eq!(ack.name, "ack");

    let event = guest.event().await;
    assert_eq!(event.name, "system.device.attached");
    assert_eq!(event.args["name"], json!("da0"));

    guest.connection.close().await;
    root.connection.close().await;
    dispatcher.stop().await;
}

#[tokio::test]
async fn disconnect_during_verify_still_runs_the_task() {
    let dispatcher = dispatcher().await;
    let mut client = Client::open(&dispatcher);
    client.login("root", "secret").await;

    client
        .connection
        .handle_frame(Frame::new(
            "task",
            "submit",
            Some("t1".into()),
            json!({"name": "disk.slow_verify", "args": ["ada0", 150]}),
        ))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.connection.pending_calls(), 1);
    let waiting = dispatcher.balancer().get_tasks(TaskState::Waiting);
    assert_eq!(waiting.len(), 1);
    let id = waiting[0].id;

    client.connection.close().await;

    let record = timeout(WAIT, dispatcher.balancer().wait(id)).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Finished);
    assert_eq!(record.result, Some(json!("verified")));
    assert!(dispatcher.balancer().get_tasks(TaskState::Waiting).is_empty());
    dispatcher.stop().await;
}

#[tokio::test]
async fn token_login_resumes_on_a_new_connection() {
    let dispatcher = dispatcher().await;
    let mut first = Client::open(&dispatcher);
    let grant = first.login("root", "secret").await;
    assert_eq!(grant.args["username"], json!("root"));
    assert_eq!(grant.args["lifetime"], json!(300));
    let token = grant.args["token"].as_str().unwrap().to_string();
    first.connection.close().await;

    let mut second = Client::open(&dispatcher);
    let resumed = second.request("management", "login_token", json!({"token": token})).await;
    assert_eq!(resumed.name, "response");
    assert_eq!(resumed.args["username"], json!("root"));
    assert_eq!(resumed.args["privileged"], json!(true));
    let renewed = resumed.args["token"].as_str().unwrap().to_string();
    assert_ne!(renewed, token);
    assert_eq!(second.call("management.status", json!([])).await.name, "response");

    // The first token was spent by the resume
    let mut third = Client::open(&dispatcher);
    let reused = third.request("management", "login_token", json!([token])).await;
    assert_eq!(reused.name, "error");
    assert_eq!(code(&reused), ErrorKind::PermissionDenied.code());
    assert_eq!(reused.args["message"], json!("Incorrect or expired token"));

    // Logging out spends the renewed one
    second.request("management", "logout", Value::Null).await;
    let after_logout = third.request("management", "login_token", json!([renewed])).await;
    assert_eq!(code(&after_logout), ErrorKind::PermissionDenied.code());

    let missing = third.request("management", "login_token", json!({})).await;
    assert_eq!(code(&missing), ErrorKind::InvalidParameters.code());

    second.connection.close().await;
    third.connection.close().await;
    dispatcher.stop().await;
}

#[tokio::test]
async fn service_login_is_local_and_announced() {
    let mut config = config();
    config.spec.auth.services = vec!["nfsd".into()];
    let dispatcher = dispatcher_with(config).await;

    let mut watcher = Client::open(&dispatcher);
    watcher.login("root", "secret").await;
    watcher.request("events", "subscribe", json!(["server.service_logged"])).await;

    let mut service = Client::open(&dispatcher);
    let grant = service.request("management", "login_service", json!({"name": "nfsd"})).await;
    assert_eq!(grant.name, "response");
    assert_eq!(grant.args["username"], json!("nfsd"));
    assert_eq!(grant.args["privileged"], json!(true));
    assert!(grant.args.get("token").is_none());
    assert_eq!(service.call("management.status", json!([])).await.name, "response");

    let event = watcher.event().await;
    assert_eq!(event.name, "server.service_logged");
    assert_eq!(event.args["name"], json!("nfsd"));
    assert_eq!(event.args["address"], json!("127.0.0.1:50000"));

    let mut stranger = Client::open(&dispatcher);
    let unknown = stranger.request("management", "login_service", json!(["smbd"])).await;
    assert_eq!(code(&unknown), ErrorKind::PermissionDenied.code());

    let mut remote = Client::open_from(&dispatcher, "192.0.2.7:41000");
    let denied = remote.request("management", "login_service", json!(["nfsd"])).await;
    assert_eq!(code(&denied), ErrorKind::PermissionDenied.code());
    assert!(remote.connection.session().unwrap().principal.is_none());

    for client in [watcher, service, stranger, remote] {
        client.connection.close().await;
    }
    dispatcher.stop().await;
}

#[tokio::test]
async fn server_calls_reach_the_client() {
    let dispatcher = dispatcher().await;
    let mut client = Client::open(&dispatcher);
    client.login("root", "secret").await;
    let session = client.connection.session_id();

    let pending = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.call_client(session, "ui.confirm", json!(["Destroy pool tank?"])).await }
    });
    let call = client.frame().await;
    assert_eq!((call.namespace.as_str(), call.name.as_str()), ("rpc", "call"));
    assert_eq!(call.args["method"], json!("ui.confirm"));
    assert_eq!(call.args["args"], json!(["Destroy pool tank?"]));
    client
        .connection
        .handle_frame(Frame::response("rpc", call.id.clone(), json!(true)))
        .await;
    assert_eq!(timeout(WAIT, pending).await.unwrap().unwrap().unwrap(), json!(true));

    let pending = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.call_client(session, "ui.nope", Value::Null).await }
    });
    let call = client.frame().await;
    client
        .connection
        .handle_frame(Frame::error("rpc", call.id.clone(), &RpcError::method_not_found("ui", "nope")))
        .await;
    let err = timeout(WAIT, pending).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::MethodNotFound);

    client.connection.close().await;
    dispatcher.stop().await;
}

#[tokio::test]
async fn client_calls_fail_when_the_connection_closes() {
    let dispatcher = dispatcher().await;
    let mut client = Client::open(&dispatcher);
    let session = client.connection.session_id();

    let pending = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.call_client(session, "ui.confirm", json!([])).await }
    });
    let call = client.frame().await;
    assert_eq!(call.name, "call");

    client.connection.close().await;
    let err = timeout(WAIT, pending).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionClosed);

    let err = dispatcher.call_client(session, "ui.confirm", json!([])).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionClosed);
    dispatcher.stop().await;
}
