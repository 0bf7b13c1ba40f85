//! Settings store: control server definitions and file-to-component
//! mappings.
//!
//! Settings live in a JSON file with camelCase keys:
//!
//! ```json
//! {
//!   "hosts": [
//!     {"name": "core1", "address": "10.0.0.5", "port": 1710,
//!      "username": "admin", "password": "secret"}
//!   ],
//!   "mappings": [
//!     {"file": "scripts/main.lua", "host": "core1", "component": "MainScript"}
//!   ],
//!   "client": {"connectTimeoutSecs": 10, "maxBufferedBytes": 16777216}
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::protocol::framing::DEFAULT_MAX_BUFFERED_BYTES;
use crate::protocol::{ClientConfig, DEFAULT_PORT};

/// Environment variable that overrides the settings file location.
pub const CONFIG_ENV_VAR: &str = "CONTROLRPC_CONFIG";

/// Control that receives deployed script text unless a mapping says otherwise.
pub const DEFAULT_CONTROL: &str = "code";

/// Errors loading or saving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read settings from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write settings to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Host '{0}' is defined more than once")]
    DuplicateHost(String),

    #[error("Mapping for {file} refers to unknown host '{host}'")]
    UnknownHost { file: PathBuf, host: String },
}

/// One control server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    pub name: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl HostConfig {
    /// Parse an ad-hoc `address[:port]` string into an unnamed host.
    pub fn from_address(target: &str) -> Self {
        let (address, port) = match target.rsplit_once(':') {
            Some((address, port)) if !address.contains(':') => match port.parse() {
                Ok(port) => (address.to_string(), port),
                Err(_) => (target.to_string(), DEFAULT_PORT),
            },
            _ => (target.to_string(), DEFAULT_PORT),
        };

        Self {
            name: target.to_string(),
            address,
            port,
            username: None,
            password: None,
        }
    }

    /// Logon credentials, if a username is configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.username
            .as_deref()
            .map(|user| (user, self.password.as_deref().unwrap_or("")))
    }
}

/// Binds a local script file to a control on a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptMapping {
    pub file: PathBuf,
    pub host: String,
    pub component: String,
    #[serde(default = "default_control")]
    pub control: String,
}

fn default_control() -> String {
    DEFAULT_CONTROL.to_string()
}

/// Client tunables as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_buffered_bytes() -> usize {
    DEFAULT_MAX_BUFFERED_BYTES
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            max_buffered_bytes: default_max_buffered_bytes(),
        }
    }
}

/// Complete settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub mappings: Vec<ScriptMapping>,
    #[serde(default)]
    pub client: ClientSettings,
}

impl Settings {
    /// Resolve the default settings path.
    ///
    /// Resolution order:
    /// 1. `$CONTROLRPC_CONFIG`
    /// 2. `<config_dir>/controlrpc/settings.json` (XDG on Linux,
    ///    `~/Library/Application Support` on macOS)
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("controlrpc").join("settings.json"))
    }

    /// Parse and validate settings from a JSON string.
    pub fn from_json(json: &str, origin: &Path) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded settings from {}", path.display());
        Self::from_json(&json, path)
    }

    /// Load settings, treating a missing file as empty settings.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("No settings at {}; using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Write settings as pretty-printed JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| write_err(e.into()))?;
        std::fs::write(path, json).map_err(write_err)
    }

    /// Check host names are unique and every mapping names a known host.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for host in &self.hosts {
            if !names.insert(host.name.as_str()) {
                return Err(ConfigError::DuplicateHost(host.name.clone()));
            }
        }

        for mapping in &self.mappings {
            if !names.contains(mapping.host.as_str()) {
                return Err(ConfigError::UnknownHost {
                    file: mapping.file.clone(),
                    host: mapping.host.clone(),
                });
            }
        }

        Ok(())
    }

    /// Look up a host by name.
    pub fn host(&self, name: &str) -> Option<&HostConfig> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Mappings for `file`. A relative mapping path matches any file path
    /// that ends with it.
    pub fn mappings_for(&self, file: &Path) -> Vec<&ScriptMapping> {
        self.mappings
            .iter()
            .filter(|m| m.file == file || file.ends_with(&m.file))
            .collect()
    }

    /// Build the protocol client configuration.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_secs(self.client.connect_timeout_secs),
            max_buffered_bytes: self.client.max_buffered_bytes,
            ..ClientConfig::default()
        }
    }
}
