// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Dispatcher Configuration Types
//
// Defines the configuration schema of a dispatcher process, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - WebSocket listener settings
// - Datastore driver selection
// - Plugin directories and host tags
// - Event source restart backoff
// - Static users for session login
// - Logging settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "DispatcherConfig";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level Kubernetes-style dispatcher configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "DispatcherConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: DispatcherSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Body of the manifest (content under `spec:`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherSpec {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub datastore: DatastoreConfig,

    #[serde(default)]
    pub plugins: PluginsConfig,

    #[serde(default)]
    pub balancer: BalancerConfig,

    #[serde(default)]
    pub event_sources: EventSourcesConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Written by the daemon on start, removed on exit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pidfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket route
    #[serde(default = "default_path")]
    pub path: String,

    /// Seconds a client gets to answer a call made by the server
    #[serde(default = "default_client_call_timeout_secs")]
    pub client_call_timeout_secs: u64,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_path() -> String {
    "/socket".to_string()
}

fn default_client_call_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            path: default_path(),
            client_call_timeout_secs: default_client_call_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn client_call_timeout(&self) -> Duration {
        Duration::from_secs(self.client_call_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatastoreDriver {
    Memory,
    File,
}

impl DatastoreDriver {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(DatastoreDriver::Memory),
            "file" => Some(DatastoreDriver::File),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatastoreConfig {
    /// "memory" or "file"
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Snapshot file used by the "file" driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Newest rows kept in the `events` collection; 0 keeps everything
    #[serde(default = "default_event_retention")]
    pub event_retention: usize,
}

fn default_event_retention() -> usize {
    10_000
}

fn default_driver() -> String {
    "memory".to_string()
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            path: None,
            event_retention: default_event_retention(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Directories scanned for `*.yaml` plugin descriptors
    #[serde(default)]
    pub directories: Vec<PathBuf>,

    /// Overrides the detected host tags (e.g. `["FreeBSD:amd64"]`)
    #[serde(default)]
    pub host_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// How long a RUNNING task may take to unwind after its abort hook
    #[serde(default = "default_abort_grace_ms")]
    pub abort_grace_ms: u64,
}

fn default_abort_grace_ms() -> u64 {
    5000
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            abort_grace_ms: default_abort_grace_ms(),
        }
    }
}

impl BalancerConfig {
    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSourcesConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for EventSourcesConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// When false every connection is treated as a privileged local user
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Allow `discovery.*` before login
    #[serde(default = "default_true")]
    pub anonymous_introspection: bool,

    #[serde(default)]
    pub users: Vec<UserConfig>,

    /// Seconds a login token survives without being used
    #[serde(default = "default_token_lifetime_secs")]
    pub token_lifetime_secs: u64,

    /// Names allowed to log in with `management.login_service`. Service
    /// logins are privileged and only accepted from loopback addresses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_token_lifetime_secs() -> u64 {
    300
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            anonymous_introspection: true,
            users: Vec::new(),
            token_lifetime_secs: default_token_lifetime_secs(),
            services: Vec::new(),
        }
    }
}

impl AuthConfig {
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,

    /// Hex encoded SHA-256 of the password
    pub password_sha256: String,

    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "dispatcher".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: DispatcherSpec::default(),
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let yaml = self.to_yaml_string()?;
        std::fs::write(path, yaml).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover configuration file using precedence order
    /// 1. DISPATCHER_CONFIG_PATH environment variable
    /// 2. ./dispatcher.yaml (working directory)
    /// 3. ~/.config/dispatcher/config.yaml (user home)
    /// 4. /usr/local/etc/middleware.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("DISPATCHER_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./dispatcher.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".config").join("dispatcher").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/usr/local/etc/middleware.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    pub fn load_or_default(cli_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        // Explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = match Self::discover_config() {
            Some(config_path) => {
                tracing::info!("Loading configuration from discovered path: {:?}", config_path);
                Self::from_yaml_file(config_path)?
            }
            None => {
                tracing::warn!("No configuration file found in standard locations. Using defaults.");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("DISPATCHER_PORT") {
            match val.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Environment override: DISPATCHER_PORT={}", port);
                    self.spec.server.port = port;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for DISPATCHER_PORT: '{}'. Expected a port number. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("DISPATCHER_DATASTORE_PATH") {
            tracing::info!("Environment override: DISPATCHER_DATASTORE_PATH={}", val);
            self.spec.datastore.driver = "file".to_string();
            self.spec.datastore.path = Some(PathBuf::from(val));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_version != API_VERSION {
            return Err(ConfigError::Invalid(format!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version, API_VERSION
            )));
        }

        if self.kind != KIND {
            return Err(ConfigError::Invalid(format!(
                "Invalid kind: '{}'. Must be '{}'",
                self.kind, KIND
            )));
        }

        if self.metadata.name.is_empty() {
            return Err(ConfigError::Invalid("metadata.name cannot be empty".into()));
        }

        let server = &self.spec.server;
        if server.port == 0 {
            return Err(ConfigError::Invalid("spec.server.port cannot be 0".into()));
        }
        if !server.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "spec.server.path must start with '/': '{}'",
                server.path
            )));
        }

        match DatastoreDriver::parse(&self.spec.datastore.driver) {
            None => {
                return Err(ConfigError::Invalid(format!(
                    "Unknown datastore driver: '{}'. Expected 'memory' or 'file'",
                    self.spec.datastore.driver
                )))
            }
            Some(DatastoreDriver::File) if self.spec.datastore.path.is_none() => {
                return Err(ConfigError::Invalid(
                    "spec.datastore.path is required for the 'file' driver".into(),
                ))
            }
            Some(_) => {}
        }

        let sources = &self.spec.event_sources;
        if sources.initial_backoff_ms > sources.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "spec.event_sources.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                sources.initial_backoff_ms, sources.max_backoff_ms
            )));
        }

        if self.spec.auth.token_lifetime_secs == 0 {
            return Err(ConfigError::Invalid("spec.auth.token_lifetime_secs must be positive".into()));
        }
        if self.spec.server.client_call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "spec.server.client_call_timeout_secs must be positive".into(),
            ));
        }

        for user in &self.spec.auth.users {
            if user.username.is_empty() {
                return Err(ConfigError::Invalid("auth user name cannot be empty".into()));
            }
            if !matches!(hex::decode(&user.password_sha256), Ok(digest) if digest.len() == 32) {
                return Err(ConfigError::Invalid(format!(
                    "password_sha256 of user '{}' is not a hex SHA-256 digest",
                    user.username
                )));
            }
        }

        Ok(())
    }

    /// Host tags matched against plugin compatibility globs
    pub fn host_tags(&self) -> Vec<String> {
        if self.spec.plugins.host_tags.is_empty() {
            vec![detected_host_tag()]
        } else {
            self.spec.plugins.host_tags.clone()
        }
    }
}

/// `"<OS>:<ARCH>"` of the running host, e.g. `Linux:x86_64`
pub fn detected_host_tag() -> String {
    let os = match std::env::consts::OS {
        "linux" => "Linux",
        "freebsd" => "FreeBSD",
        "macos" => "Darwin",
        "netbsd" => "NetBSD",
        "openbsd" => "OpenBSD",
        other => other,
    };
    format!("{}:{}", os, std::env::consts::ARCH)
}
