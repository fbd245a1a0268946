// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Plugin records, on-disk descriptors and host compatibility matching.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PluginState {
    Unloaded,
    Loaded,
    Error,
}

/// Reported by `management.status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub state: PluginState,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin {0} is already registered")]
    AlreadyRegistered(String),
    #[error("Plugin {0} is not compatible with this host")]
    Incompatible(String),
    #[error("Plugin {plugin} depends on unknown plugin {dependency}")]
    MissingDependency { plugin: String, dependency: String },
    #[error("Dependency cycle involving plugin {0}")]
    DependencyCycle(String),
    #[error("Plugin {plugin} failed to initialize: {message}")]
    InitFailed { plugin: String, message: String },
    #[error("Invalid plugin descriptor {path:?}: {message}")]
    InvalidDescriptor { path: PathBuf, message: String },
}

/// `*.yaml` file in a plugin directory enabling and configuring a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub settings: Value,
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

impl PluginDescriptor {
    pub fn from_yaml_file(path: &Path) -> Result<Self, PluginError> {
        let invalid = |message: String| PluginError::InvalidDescriptor {
            path: path.to_path_buf(),
            message,
        };
        let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let mut descriptor: PluginDescriptor =
            serde_yaml::from_str(&content).map_err(|e| invalid(e.to_string()))?;
        if descriptor.name.is_empty() {
            return Err(invalid("name cannot be empty".to_string()));
        }
        descriptor.path = Some(path.to_path_buf());
        Ok(descriptor)
    }
}

/// True when any host tag matches any of the plugin's compatibility globs.
/// An empty list means the plugin runs everywhere.
pub fn is_compatible(patterns: &[String], host_tags: &[String]) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|pattern| match glob::Pattern::new(pattern) {
        Ok(pattern) => host_tags.iter().any(|tag| pattern.matches(tag)),
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "Ignoring malformed compatibility pattern");
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_globs() {
        let host = vec!["FreeBSD:amd64".to_string()];
        assert!(is_compatible(&[], &host));
        assert!(is_compatible(&["FreeBSD:*".to_string()], &host));
        assert!(!is_compatible(&["Linux:*".to_string()], &host));
        assert!(is_compatible(
            &["Linux:*".to_string(), "*:amd64".to_string()],
            &host
        ));
    }

    #[test]
    fn test_descriptor_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smart.yaml");
        std::fs::write(&path, "name: smart\nsettings:\n  interval: 30\n").unwrap();

        let descriptor = PluginDescriptor::from_yaml_file(&path).unwrap();
        assert_eq!(descriptor.name, "smart");
        assert!(descriptor.enabled);
        assert_eq!(descriptor.settings["interval"], 30);
        assert_eq!(descriptor.path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_descriptor_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "enabled: [").unwrap();
        assert!(matches!(
            PluginDescriptor::from_yaml_file(&path),
            Err(PluginError::InvalidDescriptor { .. })
        ));
    }
}
