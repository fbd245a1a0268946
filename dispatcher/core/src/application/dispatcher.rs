// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Dispatcher
//!
//! Process root. Owns the datastore, the event bus, the balancer, the RPC
//! context and the plugin loader, and is the only way plugins register
//! anything.
//!
//! ```ignore
//! let dispatcher = DispatcherBuilder::new(config)
//!     .plugin(Arc::new(ZfsPlugin::default()))
//!     .build()
//!     .await?;
//! let reason = dispatcher.wait_for_shutdown().await;
//! dispatcher.stop().await;
//! ```
//!
//! Services never hold an `Arc<Dispatcher>`; they get a [`DispatcherRef`]
//! (weak) so that the dispatcher can be dropped after [`Dispatcher::stop`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::balancer::Balancer;
use crate::application::builtin::{DiscoveryService, ManagementService, TaskService};
use crate::application::hooks::{Hook, HookRegistry};
use crate::application::plugin_loader::{Plugin, PluginLoader};
use crate::application::rpc_context::{RpcContext, RpcService};
use crate::domain::error::RpcError;
use crate::domain::event::{names, EventTypeSpec};
use crate::domain::node_config::DispatcherConfig;
use crate::domain::repository::{collections, Datastore};
use crate::domain::schema::SchemaRegistry;
use crate::domain::service::{Caller, ServiceKind};
use crate::domain::session::{ClientChannel, LoginGrant, Principal, SessionId, SessionInfo};
use crate::domain::task::{TaskHandler, TaskRecord};
use crate::infrastructure::auth::{Authenticator, StaticAuthenticator};
use crate::infrastructure::datastore::open_datastore;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::event_log::spawn_event_logger;
use crate::infrastructure::event_source::{spawn_supervised, EventSource, EventSourceHandle};
use crate::infrastructure::token_store::TokenStore;

/// Why the runtime stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Boot a fresh runtime from the same configuration
    Restart,
    /// Exit the process
    Die,
}

/// Weak handle to the dispatcher held by services
#[derive(Clone)]
pub struct DispatcherRef(Weak<Dispatcher>);

impl DispatcherRef {
    pub fn get(&self) -> Result<Arc<Dispatcher>, RpcError> {
        self.0
            .upgrade()
            .ok_or_else(|| RpcError::invalid_state("Dispatcher is shutting down"))
    }
}

struct SessionEntry {
    info: SessionInfo,
    row: Option<Value>,
    token: Option<String>,
    client: Option<Arc<dyn ClientChannel>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginKind {
    User,
    Service,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    datastore: Arc<dyn Datastore>,
    bus: EventBus,
    balancer: Balancer,
    schemas: Arc<SchemaRegistry>,
    rpc: RpcContext,
    plugins: PluginLoader,
    sources: Mutex<BTreeMap<String, EventSourceHandle>>,
    authenticator: Arc<dyn Authenticator>,
    tokens: TokenStore,
    hooks: HookRegistry,
    sessions: DashMap<SessionId, SessionEntry>,
    started_at: DateTime<Utc>,
    shutdown: CancellationToken,
    shutdown_reason: Mutex<Option<ShutdownReason>>,
    event_logger: Mutex<Option<JoinHandle<()>>>,
    this: Weak<Dispatcher>,
}

pub struct DispatcherBuilder {
    config: DispatcherConfig,
    datastore: Option<Arc<dyn Datastore>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl DispatcherBuilder {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            datastore: None,
            authenticator: None,
            plugins: Vec::new(),
        }
    }

    /// Use this datastore instead of opening the configured driver
    pub fn with_datastore(mut self, datastore: Arc<dyn Datastore>) -> Self {
        self.datastore = Some(datastore);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn plugins(mut self, plugins: impl IntoIterator<Item = Arc<dyn Plugin>>) -> Self {
        self.plugins.extend(plugins);
        self
    }

    /// Open the datastore, start the runtime, bind the built-in services,
    /// load plugins and emit `server.ready`
    pub async fn build(self) -> anyhow::Result<Arc<Dispatcher>> {
        let config = self.config;
        let spec = &config.spec;

        let datastore = match self.datastore {
            Some(datastore) => datastore,
            None => open_datastore(&spec.datastore).await?,
        };
        for collection in collections::ALL {
            datastore.require_collection(collection).await?;
        }

        let bus = EventBus::with_default_capacity();
        for spec in builtin_event_types() {
            bus.register_event_type(spec)?;
        }

        let balancer = Balancer::new(datastore.clone(), bus.clone(), spec.balancer.abort_grace());
        balancer.start().await?;

        let schemas = Arc::new(SchemaRegistry::new());
        let authenticator = self
            .authenticator
            .unwrap_or_else(|| Arc::new(StaticAuthenticator::new(&spec.auth)));
        let plugins = PluginLoader::new(spec.plugins.directories.clone(), config.host_tags());
        for plugin in self.plugins {
            plugins.add(plugin)?;
        }

        let tokens = TokenStore::new(spec.auth.token_lifetime());
        let dispatcher = Arc::new_cyclic(|this| Dispatcher {
            rpc: RpcContext::new(schemas.clone()),
            schemas,
            datastore,
            bus,
            balancer,
            plugins,
            sources: Mutex::new(BTreeMap::new()),
            authenticator,
            tokens,
            hooks: HookRegistry::new(),
            sessions: DashMap::new(),
            started_at: Utc::now(),
            shutdown: CancellationToken::new(),
            shutdown_reason: Mutex::new(None),
            event_logger: Mutex::new(None),
            this: this.clone(),
            config,
        });

        *dispatcher.event_logger.lock() = Some(spawn_event_logger(
            &dispatcher.bus,
            dispatcher.datastore.clone(),
            dispatcher.config.spec.datastore.event_retention,
            dispatcher.shutdown.clone(),
        ));

        let handle = dispatcher.handle();
        dispatcher
            .register_service("discovery", Arc::new(DiscoveryService::new(handle.clone())))
            .await?;
        dispatcher
            .register_service("management", Arc::new(ManagementService::new(handle.clone())))
            .await?;
        dispatcher
            .register_service("task", Arc::new(TaskService::new(handle)))
            .await?;

        let loaded = dispatcher.discover_plugins().await;
        info!(
            name = %dispatcher.config.metadata.name,
            plugins = loaded.len(),
            services = dispatcher.rpc.get_services().len(),
            "Dispatcher ready"
        );
        dispatcher.emit_event(names::READY, json!({}));
        Ok(dispatcher)
    }
}

fn builtin_event_types() -> Vec<EventTypeSpec> {
    [
        (names::TASK_UPDATED, "Task state transition"),
        (names::TASK_PROGRESS, "Progress report of a running task"),
        (names::PLUGIN_LOADED, "A plugin finished init"),
        (names::PLUGIN_LOAD_ERROR, "A plugin or descriptor failed to load"),
        (names::CLIENT_CONNECTED, "A client connected"),
        (names::CLIENT_DISCONNECTED, "A client disconnected"),
        (names::CLIENT_LOGGED, "A client logged in"),
        (names::SERVICE_LOGGED, "A local service logged in"),
        (names::READY, "The dispatcher finished booting"),
        (names::SHUTDOWN, "The dispatcher is stopping"),
    ]
    .into_iter()
    .map(|(name, description)| {
        EventTypeSpec::new(name)
            .with_source("dispatcher")
            .with_description(description)
    })
    .collect()
}

impl Dispatcher {
    pub fn handle(&self) -> DispatcherRef {
        DispatcherRef(self.this.clone())
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    pub fn rpc(&self) -> &RpcContext {
        &self.rpc
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    pub fn plugins(&self) -> &PluginLoader {
        &self.plugins
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ---- registration ----

    pub async fn register_service(&self, name: &str, service: Arc<dyn RpcService>) -> Result<(), RpcError> {
        self.bind(name, ServiceKind::Service, service).await
    }

    pub async fn register_provider(&self, name: &str, provider: Arc<dyn RpcService>) -> Result<(), RpcError> {
        self.bind(name, ServiceKind::Provider, provider).await
    }

    async fn bind(&self, name: &str, kind: ServiceKind, service: Arc<dyn RpcService>) -> Result<(), RpcError> {
        self.rpc.register(name, kind, service.clone())?;
        if let Err(e) = service.initialize(&self.handle()).await {
            self.rpc.unregister(name);
            warn!(service = %name, error = %e, "Service initialize failed");
            return Err(e);
        }
        Ok(())
    }

    pub fn unregister_service(&self, name: &str) -> bool {
        self.rpc.unregister(name).is_some()
    }

    pub fn register_task_handler(&self, handler: TaskHandler) -> Result<(), RpcError> {
        self.balancer.register_handler(handler)
    }

    pub fn register_event_type(&self, spec: EventTypeSpec) -> Result<(), RpcError> {
        self.bus.register_event_type(spec)
    }

    /// Register the source's event types and start it under supervision
    pub fn register_event_source(&self, name: &str, source: Arc<dyn EventSource>) -> Result<(), RpcError> {
        let mut sources = self.sources.lock();
        if sources.contains_key(name) {
            return Err(RpcError::already_registered("Event source", name));
        }
        for spec in source.event_types() {
            let spec = match spec.source {
                Some(_) => spec,
                None => spec.with_source(name),
            };
            self.bus.register_event_type(spec)?;
        }

        let handle = spawn_supervised(
            name,
            source,
            self.bus.clone(),
            &self.config.spec.event_sources,
            &self.shutdown,
        );
        sources.insert(name.to_string(), handle);
        Ok(())
    }

    pub async fn unregister_event_source(&self, name: &str) -> bool {
        let handle = self.sources.lock().remove(name);
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn register_hook(&self, name: &str) {
        self.hooks.register(name);
    }

    pub fn attach_hook(&self, name: &str, hook: Arc<dyn Hook>) {
        self.hooks.attach(name, hook);
    }

    pub fn detach_hook(&self, name: &str, hook: &Arc<dyn Hook>) -> bool {
        self.hooks.detach(name, hook)
    }

    pub async fn run_hook(&self, name: &str, args: &Value) -> Result<Vec<Value>, RpcError> {
        self.hooks.run(name, args).await
    }

    pub fn event_source_names(&self) -> Vec<String> {
        self.sources.lock().keys().cloned().collect()
    }

    pub fn register_schema_definition(&self, name: &str, schema: Value) -> Result<(), RpcError> {
        self.schemas.register(name, schema)
    }

    /// Reload-safe: picks up new descriptors and loads plugins not LOADED yet
    pub async fn discover_plugins(&self) -> Vec<String> {
        match self.this.upgrade() {
            Some(this) => self.plugins.discover_and_load(&this).await,
            None => Vec::new(),
        }
    }

    // ---- events ----

    pub fn emit_event(&self, name: &str, args: Value) -> usize {
        self.bus.emit(name, args)
    }

    // ---- internal calls ----

    /// Call a method as an internal caller; private methods are allowed
    pub async fn call_sync(&self, method: &str, args: Value) -> Result<Value, RpcError> {
        self.rpc.dispatch_call(method, args, Caller::Internal).await
    }

    /// Submit a task and wait for its terminal record
    pub async fn call_task_sync(&self, name: &str, args: Value) -> Result<TaskRecord, RpcError> {
        let id = self.balancer.submit(name, args).await?;
        self.balancer.wait(id).await
    }

    // ---- sessions ----

    /// Track a new connection. With authentication disabled the session is
    /// logged in as a privileged local user right away.
    pub fn open_session(&self, address: Option<String>) -> SessionInfo {
        let mut info = SessionInfo::new(address);
        if !self.config.spec.auth.enabled {
            info.principal = Some(Principal {
                username: "local".to_string(),
                privileged: true,
            });
        }
        self.sessions.insert(
            info.id,
            SessionEntry {
                info: info.clone(),
                row: None,
                token: None,
                client: None,
            },
        );
        debug!(session_id = %info.id, address = ?info.address, "Session opened");
        self.emit_event(
            names::CLIENT_CONNECTED,
            json!({ "address": info.address, "session": info.id.to_string() }),
        );
        info
    }

    pub fn session(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.get(&id).map(|entry| entry.info.clone())
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|entry| entry.info.clone()).collect()
    }

    /// Log in with credentials. The grant carries a token for
    /// [`Dispatcher::login_token`].
    pub async fn login(&self, id: SessionId, username: &str, password: &str) -> Result<LoginGrant, RpcError> {
        if !self.sessions.contains_key(&id) {
            return Err(RpcError::connection_closed());
        }
        let Some(principal) = self.authenticator.authenticate(username, password).await else {
            warn!(session_id = %id, username = %username, "Login failed");
            return Err(RpcError::permission_denied("Invalid credentials"));
        };
        self.establish(id, principal, LoginKind::User).await
    }

    /// Resume a login with a token from an earlier grant. The presented
    /// token is spent; the new grant carries its replacement.
    pub async fn login_token(&self, id: SessionId, token: &str) -> Result<LoginGrant, RpcError> {
        if !self.sessions.contains_key(&id) {
            return Err(RpcError::connection_closed());
        }
        let Some(principal) = self.tokens.lookup(token) else {
            warn!(session_id = %id, "Token login failed");
            return Err(RpcError::permission_denied("Incorrect or expired token"));
        };
        self.tokens.revoke(token);
        self.establish(id, principal, LoginKind::User).await
    }

    /// Log in a local service by name. Only configured names are accepted,
    /// and only from loopback or in-process connections.
    pub async fn login_service(&self, id: SessionId, name: &str) -> Result<LoginGrant, RpcError> {
        let Some(address) = self.sessions.get(&id).map(|entry| entry.info.address.clone()) else {
            return Err(RpcError::connection_closed());
        };
        if !self.config.spec.auth.services.iter().any(|service| service == name) {
            warn!(session_id = %id, service = %name, "Login of unknown service");
            return Err(RpcError::permission_denied(format!("Unknown service {}", name)));
        }
        let local = match address.as_deref() {
            None => true,
            Some(address) => address.parse::<SocketAddr>().is_ok_and(|addr| addr.ip().is_loopback()),
        };
        if !local {
            warn!(session_id = %id, service = %name, address = ?address, "Service login from remote address");
            return Err(RpcError::permission_denied("Service logins are only accepted locally"));
        }
        let principal = Principal {
            username: name.to_string(),
            privileged: true,
        };
        self.establish(id, principal, LoginKind::Service).await
    }

    async fn establish(&self, id: SessionId, principal: Principal, kind: LoginKind) -> Result<LoginGrant, RpcError> {
        let Some(address) = self.sessions.get(&id).map(|entry| entry.info.address.clone()) else {
            return Err(RpcError::connection_closed());
        };

        let row = self
            .datastore
            .insert(
                collections::SESSIONS,
                json!({
                    "started_at": Utc::now().to_rfc3339(),
                    "address": address,
                    "username": principal.username,
                    "service": kind == LoginKind::Service,
                    "active": true,
                }),
            )
            .await
            .map_err(|e| {
                warn!(session_id = %id, error = %e, "Failed to record session");
                e
            })
            .ok();

        let token = match kind {
            LoginKind::User => Some(self.tokens.issue(principal.clone())),
            LoginKind::Service => None,
        };

        let (previous_row, previous_token) = {
            let Some(mut entry) = self.sessions.get_mut(&id) else {
                if let Some(token) = &token {
                    self.tokens.revoke(token);
                }
                return Err(RpcError::connection_closed());
            };
            entry.info.principal = Some(principal.clone());
            (
                std::mem::replace(&mut entry.row, row),
                std::mem::replace(&mut entry.token, token.clone()),
            )
        };
        if let Some(previous) = previous_token {
            self.tokens.revoke(&previous);
        }
        if let Some(previous) = previous_row {
            self.end_session_row(previous).await;
        }

        match kind {
            LoginKind::User => {
                info!(session_id = %id, username = %principal.username, privileged = principal.privileged, "Client logged in");
                self.emit_event(
                    names::CLIENT_LOGGED,
                    json!({ "address": address, "username": principal.username }),
                );
            }
            LoginKind::Service => {
                info!(session_id = %id, service = %principal.username, "Service logged in");
                self.emit_event(
                    names::SERVICE_LOGGED,
                    json!({
                        "address": address,
                        "name": principal.username,
                        "description": format!("Service {} logged in", principal.username),
                    }),
                );
            }
        }

        let lifetime = token.as_ref().map(|_| self.tokens.lifetime().as_secs());
        Ok(LoginGrant {
            principal,
            token,
            lifetime,
        })
    }

    /// Refresh the session's login token; called for every request it makes
    pub fn keepalive(&self, id: SessionId) {
        let Some(token) = self.sessions.get(&id).and_then(|entry| entry.token.clone()) else {
            return;
        };
        if !self.tokens.keepalive(&token) {
            debug!(session_id = %id, "Login token expired");
        }
    }

    /// Ends the login and spends its token
    pub async fn logout(&self, id: SessionId) -> Option<SessionInfo> {
        let (row, token) = {
            let mut entry = self.sessions.get_mut(&id)?;
            entry.info.principal = None;
            (entry.row.take(), entry.token.take())
        };
        if let Some(token) = token {
            self.tokens.revoke(&token);
        }
        if let Some(row) = row {
            self.end_session_row(row).await;
        }
        debug!(session_id = %id, "Client logged out");
        self.session(id)
    }

    /// Let the server call methods the session's client exposes
    pub fn bind_client(&self, id: SessionId, channel: Arc<dyn ClientChannel>) -> bool {
        match self.sessions.get_mut(&id) {
            Some(mut entry) => {
                entry.client = Some(channel);
                true
            }
            None => false,
        }
    }

    /// Call `method` on the client behind session `id`
    pub async fn call_client(&self, id: SessionId, method: &str, args: Value) -> Result<Value, RpcError> {
        let channel = match self.sessions.get(&id) {
            None => return Err(RpcError::connection_closed()),
            Some(entry) => entry.client.clone(),
        };
        let Some(channel) = channel else {
            return Err(RpcError::invalid_state(format!("Session {} does not take calls", id)));
        };
        debug!(session_id = %id, method = %method, "Calling client");
        channel.call(method, args).await
    }

    /// Login tokens survive the connection so the client can resume with
    /// [`Dispatcher::login_token`] after reconnecting.
    pub async fn close_session(&self, id: SessionId) {
        self.bus.detach(id);
        let Some((_, entry)) = self.sessions.remove(&id) else {
            return;
        };
        if let Some(row) = entry.row {
            self.end_session_row(row).await;
        }
        debug!(session_id = %id, "Session closed");
        self.emit_event(
            names::CLIENT_DISCONNECTED,
            json!({ "address": entry.info.address, "session": id.to_string() }),
        );
    }

    async fn end_session_row(&self, row: Value) {
        let patch = json!({ "active": false, "ended_at": Utc::now().to_rfc3339() });
        if let Err(e) = self.datastore.update(collections::SESSIONS, &row, patch).await {
            warn!(error = %e, "Failed to close session record");
        }
    }

    // ---- lifecycle ----

    /// Ask the runtime to stop. The first reason wins.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        {
            let mut current = self.shutdown_reason.lock();
            if current.is_some() {
                return;
            }
            *current = Some(reason);
        }
        info!(reason = ?reason, "Shutdown requested");
        self.emit_event(names::SHUTDOWN, json!({ "reason": format!("{:?}", reason).to_lowercase() }));
        self.shutdown.cancel();
    }

    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        self.shutdown.cancelled().await;
        self.shutdown_reason.lock().unwrap_or(ShutdownReason::Die)
    }

    /// Tear everything down: event sources, tasks, plugin cleanup, event log
    pub async fn stop(&self) {
        if self.shutdown_reason.lock().is_none() {
            self.request_shutdown(ShutdownReason::Die);
        }

        let sources: Vec<EventSourceHandle> = std::mem::take(&mut *self.sources.lock())
            .into_values()
            .collect();
        for source in sources {
            source.stop().await;
        }

        self.balancer.shutdown().await;

        if let Some(this) = self.this.upgrade() {
            self.plugins.cleanup_all(&this).await;
        }

        let logger = self.event_logger.lock().take();
        if let Some(logger) = logger {
            if let Err(e) = logger.await {
                warn!(error = %e, "Event logger did not exit cleanly");
            }
        }
        info!("Dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::plugin_loader::PluginContext;
    use crate::domain::error::ErrorKind;
    use crate::domain::plugin::PluginState;
    use crate::domain::service::{CallContext, MethodDescriptor};
    use crate::domain::task::{Task, TaskContext, TaskFailure, TaskState};
    use crate::infrastructure::datastore::InMemoryDatastore;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl RpcService for Echo {
        fn methods(&self) -> Vec<MethodDescriptor> {
            vec![MethodDescriptor::new("echo"), MethodDescriptor::new("secret").private()]
        }

        async fn call(&self, method: &str, args: Vec<Value>, _ctx: &CallContext) -> Result<Value, RpcError> {
            match method {
                "echo" => Ok(Value::Array(args)),
                _ => Ok(json!("hidden")),
            }
        }
    }

    struct Double;

    #[async_trait]
    impl Task for Double {
        async fn run(&self, _ctx: &TaskContext, args: Value) -> Result<Value, TaskFailure> {
            let n = args[0].as_i64().unwrap_or_default();
            Ok(json!(n * 2))
        }
    }

    struct EchoPlugin;

    #[async_trait]
    impl Plugin for EchoPlugin {
        fn name(&self) -> &str {
            "echo"
        }

        async fn init(&self, ctx: &mut PluginContext) -> anyhow::Result<()> {
            ctx.register_service("echo", Arc::new(Echo)).await?;
            ctx.register_task_handler(TaskHandler::new("math.double", || Arc::new(Double) as Arc<dyn Task>))?;
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Plugin for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn init(&self, ctx: &mut PluginContext) -> anyhow::Result<()> {
            ctx.register_service("broken", Arc::new(Echo)).await?;
            ctx.register_schema_definition("broken-schema", json!({"type": "string"}))?;
            anyhow::bail!("missing kernel module")
        }
    }

    async fn dispatcher() -> Arc<Dispatcher> {
        DispatcherBuilder::new(DispatcherConfig::default())
            .with_datastore(Arc::new(InMemoryDatastore::new()))
            .plugin(Arc::new(EchoPlugin))
            .plugin(Arc::new(Broken))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_builtins_and_plugins_are_registered() {
        let dispatcher = dispatcher().await;
        let services = dispatcher.rpc().get_services();
        for name in ["discovery", "management", "task", "echo"] {
            assert!(services.contains(&name.to_string()), "missing {}", name);
        }
        assert!(!services.contains(&"broken".to_string()));
        assert!(dispatcher.schemas().get("broken-schema").is_none());
        assert_eq!(dispatcher.plugins().state("echo"), Some(PluginState::Loaded));
        assert_eq!(dispatcher.plugins().state("broken"), Some(PluginState::Error));
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_call_sync_reaches_private_methods() {
        let dispatcher = dispatcher().await;
        let result = dispatcher.call_sync("echo.secret", json!([])).await.unwrap();
        assert_eq!(result, json!("hidden"));
        let result = dispatcher.call_sync("echo.echo", json!([1, 2])).await.unwrap();
        assert_eq!(result, json!([1, 2]));
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_call_task_sync_returns_terminal_record() {
        let dispatcher = dispatcher().await;
        let record = dispatcher.call_task_sync("math.double", json!([21])).await.unwrap();
        assert_eq!(record.state, TaskState::Finished);
        assert_eq!(record.result, Some(json!(42)));
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_service_is_rejected() {
        let dispatcher = dispatcher().await;
        let err = dispatcher.register_service("task", Arc::new(Echo)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyRegistered);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_reason_first_wins() {
        let dispatcher = dispatcher().await;
        dispatcher.request_shutdown(ShutdownReason::Restart);
        dispatcher.request_shutdown(ShutdownReason::Die);
        assert_eq!(dispatcher.wait_for_shutdown().await, ShutdownReason::Restart);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_auth_disabled_sessions_are_privileged() {
        let mut config = DispatcherConfig::default();
        config.spec.auth.enabled = false;
        let dispatcher = DispatcherBuilder::new(config)
            .with_datastore(Arc::new(InMemoryDatastore::new()))
            .build()
            .await
            .unwrap();
        let session = dispatcher.open_session(Some("127.0.0.1:4000".into()));
        assert!(session.is_privileged());
        dispatcher.close_session(session.id).await;
        assert!(dispatcher.session(session.id).is_none());
        dispatcher.stop().await;
    }
}
