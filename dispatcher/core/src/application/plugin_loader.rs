// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Plugin Loader
//!
//! Plugins are compiled-in factories handed to the [`DispatcherBuilder`]
//! (`crate::DispatcherBuilder`). Descriptor files (`*.yaml`) in the
//! configured plugin directories enable, disable and configure them.
//!
//! Loading is reload-safe: every pass initialises the enabled, compatible
//! plugins that are not LOADED yet, in dependency order. A plugin whose
//! `init` fails has everything it registered rolled back and is left in
//! ERROR; the pass continues with the rest.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::application::dispatcher::Dispatcher;
use crate::application::hooks::Hook;
use crate::application::rpc_context::RpcService;
use crate::domain::error::RpcError;
use crate::domain::event::names::{PLUGIN_LOADED, PLUGIN_LOAD_ERROR};
use crate::domain::event::EventTypeSpec;
use crate::domain::plugin::{is_compatible, PluginDescriptor, PluginError, PluginInfo, PluginState};
use crate::domain::task::TaskHandler;
use crate::infrastructure::event_source::EventSource;

/// A unit of functionality registered into the running dispatcher
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Plugins that must be LOADED before this one
    fn depends(&self) -> Vec<String> {
        Vec::new()
    }

    /// Host tag globs (e.g. `FreeBSD:*`); empty means any host
    fn compatible(&self) -> Vec<String> {
        Vec::new()
    }

    fn metadata(&self) -> Value {
        Value::Null
    }

    /// The only place a plugin registers services, handlers, sources and schemas
    async fn init(&self, ctx: &mut PluginContext) -> anyhow::Result<()>;

    /// Runs at shutdown for LOADED plugins
    async fn cleanup(&self, _dispatcher: &Arc<Dispatcher>) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Registration {
    Service(String),
    TaskHandler(String),
    EventType(String),
    EventSource(String),
    Schema(String),
    Hook(String),
}

/// Registration surface handed to [`Plugin::init`]. Everything registered
/// through it is undone if `init` fails.
pub struct PluginContext {
    dispatcher: Arc<Dispatcher>,
    plugin: String,
    settings: Value,
    registered: Vec<Registration>,
    attached: Vec<(String, Arc<dyn Hook>)>,
}

impl PluginContext {
    fn new(dispatcher: Arc<Dispatcher>, plugin: impl Into<String>, settings: Value) -> Self {
        Self {
            dispatcher,
            plugin: plugin.into(),
            settings,
            registered: Vec::new(),
            attached: Vec::new(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin
    }

    /// `settings` from the plugin's descriptor, `null` without one
    pub fn settings(&self) -> &Value {
        &self.settings
    }

    pub async fn register_service(
        &mut self,
        name: &str,
        service: Arc<dyn RpcService>,
    ) -> Result<(), RpcError> {
        self.dispatcher.register_service(name, service).await?;
        self.registered.push(Registration::Service(name.to_string()));
        Ok(())
    }

    pub async fn register_provider(
        &mut self,
        name: &str,
        provider: Arc<dyn RpcService>,
    ) -> Result<(), RpcError> {
        self.dispatcher.register_provider(name, provider).await?;
        self.registered.push(Registration::Service(name.to_string()));
        Ok(())
    }

    pub fn register_task_handler(&mut self, handler: TaskHandler) -> Result<(), RpcError> {
        let name = handler.name.clone();
        self.dispatcher.register_task_handler(handler)?;
        self.registered.push(Registration::TaskHandler(name));
        Ok(())
    }

    pub fn register_event_type(&mut self, spec: EventTypeSpec) -> Result<(), RpcError> {
        let name = spec.name.clone();
        let existed = self.dispatcher.event_bus().is_registered(&name);
        self.dispatcher.register_event_type(spec)?;
        if !existed {
            self.registered.push(Registration::EventType(name));
        }
        Ok(())
    }

    pub fn register_event_source(
        &mut self,
        name: &str,
        source: Arc<dyn EventSource>,
    ) -> Result<(), RpcError> {
        let bus = self.dispatcher.event_bus();
        let new_types: Vec<String> = source
            .event_types()
            .into_iter()
            .map(|spec| spec.name)
            .filter(|t| !bus.is_registered(t))
            .collect();
        self.dispatcher.register_event_source(name, source)?;
        self.registered
            .extend(new_types.into_iter().map(Registration::EventType));
        self.registered.push(Registration::EventSource(name.to_string()));
        Ok(())
    }

    pub fn register_schema_definition(&mut self, name: &str, schema: Value) -> Result<(), RpcError> {
        self.dispatcher.register_schema_definition(name, schema)?;
        self.registered.push(Registration::Schema(name.to_string()));
        Ok(())
    }

    /// Declare a hook other plugins can attach to
    pub fn register_hook(&mut self, name: &str) {
        let hooks = self.dispatcher.hooks();
        if !hooks.is_registered(name) {
            hooks.register(name);
            self.registered.push(Registration::Hook(name.to_string()));
        }
    }

    pub fn attach_hook(&mut self, name: &str, hook: Arc<dyn Hook>) {
        self.dispatcher.attach_hook(name, hook.clone());
        self.attached.push((name.to_string(), hook));
    }

    /// Undo every registration, newest first
    async fn rollback(self) {
        for (name, hook) in self.attached.iter().rev() {
            debug!(plugin = %self.plugin, hook = %name, "Detaching hook handler");
            self.dispatcher.detach_hook(name, hook);
        }
        for registration in self.registered.into_iter().rev() {
            debug!(plugin = %self.plugin, registration = ?registration, "Rolling back registration");
            match registration {
                Registration::Service(name) => {
                    self.dispatcher.unregister_service(&name);
                }
                Registration::TaskHandler(name) => {
                    self.dispatcher.balancer().unregister_handler(&name);
                }
                Registration::EventType(name) => {
                    self.dispatcher.event_bus().unregister_event_type(&name);
                }
                Registration::EventSource(name) => {
                    self.dispatcher.unregister_event_source(&name).await;
                }
                Registration::Schema(name) => {
                    self.dispatcher.schemas().unregister(&name);
                }
                Registration::Hook(name) => {
                    self.dispatcher.hooks().unregister(&name);
                }
            }
        }
    }
}

struct Slot {
    plugin: Arc<dyn Plugin>,
    state: PluginState,
    enabled: bool,
    settings: Value,
    error: Option<String>,
}

pub struct PluginLoader {
    slots: Mutex<BTreeMap<String, Slot>>,
    load_order: Mutex<Vec<String>>,
    directories: Vec<PathBuf>,
    host_tags: Vec<String>,
}

impl PluginLoader {
    pub fn new(directories: Vec<PathBuf>, host_tags: Vec<String>) -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
            load_order: Mutex::new(Vec::new()),
            directories,
            host_tags,
        }
    }

    pub fn add(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        let name = plugin.name().to_string();
        let mut slots = self.slots.lock();
        if slots.contains_key(&name) {
            return Err(PluginError::AlreadyRegistered(name));
        }
        slots.insert(
            name,
            Slot {
                plugin,
                state: PluginState::Unloaded,
                enabled: true,
                settings: Value::Null,
                error: None,
            },
        );
        Ok(())
    }

    pub fn host_tags(&self) -> &[String] {
        &self.host_tags
    }

    pub fn infos(&self) -> Vec<PluginInfo> {
        self.slots
            .lock()
            .iter()
            .map(|(name, slot)| PluginInfo {
                name: name.clone(),
                state: slot.state,
                depends: slot.plugin.depends(),
                metadata: slot.plugin.metadata(),
                error: slot.error.clone(),
            })
            .collect()
    }

    pub fn state(&self, name: &str) -> Option<PluginState> {
        self.slots.lock().get(name).map(|slot| slot.state)
    }

    /// Read descriptor files from the plugin directories. Returns the
    /// descriptors that named unknown plugins or failed to parse.
    pub fn read_descriptors(&self) -> Vec<(String, String)> {
        let mut problems = Vec::new();
        for dir in &self.directories {
            let pattern = dir.join("*.yaml");
            let Some(pattern) = pattern.to_str() else {
                warn!(directory = ?dir, "Plugin directory is not valid UTF-8");
                continue;
            };
            let paths = match glob::glob(pattern) {
                Ok(paths) => paths,
                Err(e) => {
                    warn!(directory = ?dir, error = %e, "Cannot scan plugin directory");
                    continue;
                }
            };

            let mut paths: Vec<PathBuf> = paths.filter_map(Result::ok).collect();
            paths.sort();
            for path in paths {
                match PluginDescriptor::from_yaml_file(&path) {
                    Ok(descriptor) => {
                        let mut slots = self.slots.lock();
                        match slots.get_mut(&descriptor.name) {
                            Some(slot) => {
                                debug!(plugin = %descriptor.name, path = ?path, "Applied plugin descriptor");
                                slot.enabled = descriptor.enabled;
                                slot.settings = descriptor.settings;
                            }
                            None => {
                                warn!(plugin = %descriptor.name, path = ?path, "Descriptor names an unknown plugin");
                                problems.push((
                                    descriptor.name.clone(),
                                    format!("Unknown plugin {} in {}", descriptor.name, path.display()),
                                ));
                            }
                        }
                    }
                    Err(e) => {
                        warn!(path = ?path, error = %e, "Skipping plugin descriptor");
                        let name = path
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        problems.push((name, e.to_string()));
                    }
                }
            }
        }
        problems
    }

    /// Read descriptors, then initialise every enabled, compatible plugin
    /// that is not LOADED yet. Returns the names loaded in this pass.
    pub async fn discover_and_load(&self, dispatcher: &Arc<Dispatcher>) -> Vec<String> {
        for (name, message) in self.read_descriptors() {
            dispatcher.emit_event(PLUGIN_LOAD_ERROR, json!({ "name": name, "error": message }));
        }

        let (order, failures) = {
            let mut slots = self.slots.lock();
            let loaded: HashSet<String> = slots
                .iter()
                .filter(|(_, s)| s.state == PluginState::Loaded)
                .map(|(n, _)| n.clone())
                .collect();

            let mut graph = BTreeMap::new();
            for (name, slot) in slots.iter_mut() {
                if slot.state == PluginState::Loaded || !slot.enabled {
                    continue;
                }
                if !is_compatible(&slot.plugin.compatible(), &self.host_tags) {
                    debug!(plugin = %name, host_tags = ?self.host_tags, "Skipping incompatible plugin");
                    slot.error = Some(PluginError::Incompatible(name.clone()).to_string());
                    continue;
                }
                graph.insert(name.clone(), slot.plugin.depends());
            }
            let (order, failures) = load_order(&graph, &loaded);
            for (name, err) in &failures {
                if let Some(slot) = slots.get_mut(name) {
                    slot.state = PluginState::Error;
                    slot.error = Some(err.to_string());
                }
            }
            (order, failures)
        };

        for (name, err) in failures {
            warn!(plugin = %name, error = %err, "Plugin cannot be loaded");
            dispatcher.emit_event(PLUGIN_LOAD_ERROR, json!({ "name": name, "error": err.to_string() }));
        }

        let mut loaded_now = Vec::new();
        for name in order {
            let Some((plugin, settings, depends)) = self.slots.lock().get(&name).map(|slot| {
                (slot.plugin.clone(), slot.settings.clone(), slot.plugin.depends())
            }) else {
                continue;
            };

            if let Some(failed) = depends
                .iter()
                .find(|dep| self.state(dep) != Some(PluginState::Loaded))
            {
                let message = format!("dependency {} is not loaded", failed);
                self.mark_error(dispatcher, &name, message);
                continue;
            }

            let mut ctx = PluginContext::new(dispatcher.clone(), name.clone(), settings);
            let outcome = AssertUnwindSafe(plugin.init(&mut ctx)).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => {
                    {
                        let mut slots = self.slots.lock();
                        if let Some(slot) = slots.get_mut(&name) {
                            slot.state = PluginState::Loaded;
                            slot.error = None;
                        }
                    }
                    self.load_order.lock().push(name.clone());
                    info!(plugin = %name, "Plugin loaded");
                    dispatcher.emit_event(PLUGIN_LOADED, json!({ "name": name }));
                    loaded_now.push(name);
                }
                Ok(Err(e)) => {
                    ctx.rollback().await;
                    self.mark_error(dispatcher, &name, format!("{:#}", e));
                }
                Err(_) => {
                    ctx.rollback().await;
                    self.mark_error(dispatcher, &name, "init panicked".to_string());
                }
            }
        }
        loaded_now
    }

    fn mark_error(&self, dispatcher: &Arc<Dispatcher>, name: &str, message: String) {
        error!(plugin = %name, error = %message, "Plugin failed to load");
        if let Some(slot) = self.slots.lock().get_mut(name) {
            slot.state = PluginState::Error;
            slot.error = Some(message.clone());
        }
        dispatcher.emit_event(PLUGIN_LOAD_ERROR, json!({ "name": name, "error": message }));
    }

    /// Run `cleanup` of LOADED plugins, newest first
    pub async fn cleanup_all(&self, dispatcher: &Arc<Dispatcher>) {
        let order: Vec<String> = std::mem::take(&mut *self.load_order.lock());
        for name in order.into_iter().rev() {
            let Some(plugin) = self.slots.lock().get(&name).map(|s| s.plugin.clone()) else {
                continue;
            };
            if let Err(e) = plugin.cleanup(dispatcher).await {
                warn!(plugin = %name, error = %e, "Plugin cleanup failed");
            }
            if let Some(slot) = self.slots.lock().get_mut(&name) {
                slot.state = PluginState::Unloaded;
            }
            debug!(plugin = %name, "Plugin unloaded");
        }
    }
}

/// Dependency-ordered load sequence for `graph` (plugin → dependencies).
/// Dependencies may also be satisfied by `loaded`. Plugins with a missing
/// dependency or on a cycle, and everything depending on them, are returned
/// as failures.
fn load_order(
    graph: &BTreeMap<String, Vec<String>>,
    loaded: &HashSet<String>,
) -> (Vec<String>, Vec<(String, PluginError)>) {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
        Failed,
    }

    fn visit(
        name: &str,
        graph: &BTreeMap<String, Vec<String>>,
        loaded: &HashSet<String>,
        marks: &mut HashMap<String, Mark>,
        order: &mut Vec<String>,
        failures: &mut Vec<(String, PluginError)>,
    ) -> bool {
        match marks.get(name) {
            Some(Mark::Done) => return true,
            Some(Mark::Failed) => return false,
            Some(Mark::Visiting) => {
                marks.insert(name.to_string(), Mark::Failed);
                failures.push((name.to_string(), PluginError::DependencyCycle(name.to_string())));
                return false;
            }
            None => {}
        }

        marks.insert(name.to_string(), Mark::Visiting);
        for dependency in &graph[name] {
            if loaded.contains(dependency) {
                continue;
            }
            let ok = if graph.contains_key(dependency) {
                visit(dependency, graph, loaded, marks, order, failures)
            } else {
                failures.push((
                    name.to_string(),
                    PluginError::MissingDependency {
                        plugin: name.to_string(),
                        dependency: dependency.clone(),
                    },
                ));
                marks.insert(name.to_string(), Mark::Failed);
                return false;
            };
            if !ok {
                if marks.get(name) != Some(&Mark::Failed) {
                    marks.insert(name.to_string(), Mark::Failed);
                    failures.push((
                        name.to_string(),
                        PluginError::InitFailed {
                            plugin: name.to_string(),
                            message: format!("dependency {} cannot be loaded", dependency),
                        },
                    ));
                }
                return false;
            }
        }

        marks.insert(name.to_string(), Mark::Done);
        order.push(name.to_string());
        true
    }

    let mut marks = HashMap::new();
    let mut order = Vec::new();
    let mut failures = Vec::new();
    for name in graph.keys() {
        visit(name, graph, loaded, &mut marks, &mut order, &mut failures);
    }

    // A cycle member can be reported twice (cycle, then failed dependency)
    let mut seen = BTreeSet::new();
    failures.retain(|(name, _)| seen.insert(name.clone()));
    (order, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::dispatcher::DispatcherBuilder;
    use crate::domain::node_config::DispatcherConfig;
    use crate::infrastructure::datastore::InMemoryDatastore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(name, deps)| (name.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_dependencies_load_first() {
        let g = graph(&[("zfs", &[]), ("shares", &["zfs", "network"]), ("network", &[])]);
        let (order, failures) = load_order(&g, &HashSet::new());
        assert!(failures.is_empty());
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("zfs") < pos("shares"));
        assert!(pos("network") < pos("shares"));
    }

    #[test]
    fn test_already_loaded_dependency_is_satisfied() {
        let g = graph(&[("shares", &["zfs"])]);
        let loaded: HashSet<String> = ["zfs".to_string()].into_iter().collect();
        let (order, failures) = load_order(&g, &loaded);
        assert_eq!(order, vec!["shares".to_string()]);
        assert!(failures.is_empty());
    }

    #[test]
    fn test_missing_dependency_fails_dependents_only() {
        let g = graph(&[("alerts", &["mail"]), ("ui", &["alerts"]), ("disks", &[])]);
        let (order, failures) = load_order(&g, &HashSet::new());
        assert_eq!(order, vec!["disks".to_string()]);
        let failed: BTreeSet<_> = failures.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(failed, ["alerts", "ui"].into_iter().collect());
    }

    #[test]
    fn test_cycle_is_reported() {
        let g = graph(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);
        let (order, failures) = load_order(&g, &HashSet::new());
        assert_eq!(order, vec!["c".to_string()]);
        assert!(failures
            .iter()
            .any(|(_, e)| matches!(e, PluginError::DependencyCycle(_))));
        let failed: BTreeSet<_> = failures.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(failed, ["a", "b"].into_iter().collect());
    }

    #[derive(Default)]
    struct Nfs {
        settings: Mutex<Option<Value>>,
    }

    #[async_trait]
    impl Plugin for Nfs {
        fn name(&self) -> &str {
            "nfs"
        }

        async fn init(&self, ctx: &mut PluginContext) -> anyhow::Result<()> {
            *self.settings.lock() = Some(ctx.settings().clone());
            Ok(())
        }
    }

    /// Counts `init` calls
    struct Counted {
        name: &'static str,
        compatible: Vec<String>,
        inits: AtomicUsize,
    }

    impl Counted {
        fn new(name: &'static str, compatible: &[&str]) -> Self {
            Self {
                name,
                compatible: compatible.iter().map(|c| c.to_string()).collect(),
                inits: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Plugin for Counted {
        fn name(&self) -> &str {
            self.name
        }

        fn compatible(&self) -> Vec<String> {
            self.compatible.clone()
        }

        async fn init(&self, _ctx: &mut PluginContext) -> anyhow::Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Veto;

    #[async_trait]
    impl Hook for Veto {
        async fn run(&self, _args: &Value) -> anyhow::Result<Value> {
            Ok(json!("veto"))
        }
    }

    struct Pools;

    #[async_trait]
    impl Plugin for Pools {
        fn name(&self) -> &str {
            "pools"
        }

        async fn init(&self, ctx: &mut PluginContext) -> anyhow::Result<()> {
            ctx.register_hook("pool.pre_destroy");
            ctx.attach_hook("pool.pre_destroy", Arc::new(Veto));
            Ok(())
        }
    }

    struct Snapshots;

    #[async_trait]
    impl Plugin for Snapshots {
        fn name(&self) -> &str {
            "snapshots"
        }

        fn depends(&self) -> Vec<String> {
            vec!["pools".to_string()]
        }

        async fn init(&self, ctx: &mut PluginContext) -> anyhow::Result<()> {
            ctx.attach_hook("pool.pre_destroy", Arc::new(Veto));
            ctx.register_hook("snapshot.pre_delete");
            anyhow::bail!("snapshot schedule is corrupt")
        }
    }

    fn write(dir: &std::path::Path, file: &str, content: &str) {
        std::fs::write(dir.join(file), content).unwrap();
    }

    #[tokio::test]
    async fn test_descriptors_configure_plugins() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "nfs.yaml", "name: nfs\nsettings:\n  threads: 8\n");
        write(dir.path(), "smb.yaml", "name: smb\nenabled: false\n");
        write(dir.path(), "ghost.yaml", "name: ghost\n");
        write(dir.path(), "garbage.yaml", "[unclosed\n");

        let mut config = DispatcherConfig::default();
        config.spec.plugins.directories = vec![dir.path().to_path_buf()];
        config.spec.plugins.host_tags = vec!["FreeBSD:amd64".to_string()];
        let nfs = Arc::new(Nfs::default());
        let smb = Arc::new(Counted::new("smb", &[]));
        let bhyve = Arc::new(Counted::new("bhyve", &["Linux:*"]));
        let dispatcher = DispatcherBuilder::new(config)
            .with_datastore(Arc::new(InMemoryDatastore::new()))
            .plugin(nfs.clone())
            .plugin(smb.clone())
            .plugin(bhyve.clone())
            .build()
            .await
            .unwrap();
        let plugins = dispatcher.plugins();

        assert_eq!(*nfs.settings.lock(), Some(json!({ "threads": 8 })));
        assert_eq!(plugins.state("nfs"), Some(PluginState::Loaded));

        assert_eq!(plugins.state("smb"), Some(PluginState::Unloaded));
        assert_eq!(smb.inits.load(Ordering::SeqCst), 0);

        assert_eq!(plugins.state("bhyve"), Some(PluginState::Unloaded));
        assert_eq!(bhyve.inits.load(Ordering::SeqCst), 0);
        let info = plugins.infos().into_iter().find(|i| i.name == "bhyve").unwrap();
        assert!(info.error.is_some());

        let problems = plugins.read_descriptors();
        let names: BTreeSet<&str> = problems.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["garbage", "ghost"].into_iter().collect());
        let ghost = problems.iter().find(|(n, _)| n == "ghost").unwrap();
        assert!(ghost.1.contains("Unknown plugin ghost"));

        let mut events = dispatcher.event_bus().subscribe_all();
        assert!(dispatcher.discover_plugins().await.is_empty());
        let mut failed = BTreeSet::new();
        while let Ok(event) = events.try_recv() {
            if event.name == PLUGIN_LOAD_ERROR {
                failed.insert(event.args["name"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(failed, ["garbage".to_string(), "ghost".to_string()].into_iter().collect());
        assert_eq!(smb.inits.load(Ordering::SeqCst), 0);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_failed_init_detaches_its_hooks() {
        let dispatcher = DispatcherBuilder::new(DispatcherConfig::default())
            .with_datastore(Arc::new(InMemoryDatastore::new()))
            .plugin(Arc::new(Pools))
            .plugin(Arc::new(Snapshots))
            .build()
            .await
            .unwrap();

        assert_eq!(dispatcher.plugins().state("snapshots"), Some(PluginState::Error));
        let hooks = dispatcher.hooks();
        assert_eq!(hooks.attached("pool.pre_destroy"), 1);
        assert!(!hooks.is_registered("snapshot.pre_delete"));
        let results = dispatcher.run_hook("pool.pre_destroy", &json!({ "pool": "tank" })).await.unwrap();
        assert_eq!(results, vec![json!("veto")]);
        dispatcher.stop().await;
    }
}
