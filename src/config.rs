//! Configuration management for conduit.
//!
//! Handles loading configuration from TOML files, with named backend
//! definitions and engine-wide tuning knobs.

use crate::connection::SessionProperty;
use crate::db::BackendKind;
use crate::error::{ConduitError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Engine-wide settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Named backend definitions.
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Length of one poll backoff unit, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum number of rows written by a bulk export.
    #[serde(default = "default_download_row_limit")]
    pub download_row_limit: usize,

    /// Lifetime of the download marker, in seconds.
    #[serde(default = "default_download_marker_max_age_secs")]
    pub download_marker_max_age_secs: u64,

    /// Rows buffered ahead of the consumer by streaming SQL cursors.
    #[serde(default = "default_fetch_buffer_rows")]
    pub fetch_buffer_rows: usize,

    /// Timeout for establishing a backend connection, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_download_row_limit() -> usize {
    100_000
}

fn default_download_marker_max_age_secs() -> u64 {
    60
}

fn default_fetch_buffer_rows() -> usize {
    1024
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            download_row_limit: default_download_row_limit(),
            download_marker_max_age_secs: default_download_marker_max_age_secs(),
            fetch_buffer_rows: default_fetch_buffer_rows(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl EngineConfig {
    /// One poll backoff unit.
    pub fn poll_unit(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Lifetime of the download marker.
    pub fn download_marker_max_age(&self) -> Duration {
        Duration::from_secs(self.download_marker_max_age_secs)
    }

    /// Connection establishment timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Definition of one backend.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendConfig {
    /// Backend family.
    #[serde(default)]
    pub kind: BackendKind,

    /// Connection URL; may contain `${USER}` / `${PASSWORD}` placeholders.
    pub url: Option<String>,

    /// Coordinator host (presto).
    pub host: Option<String>,

    /// Coordinator port (presto).
    pub port: Option<u16>,

    /// Default catalog.
    pub catalog: Option<String>,

    /// Default schema.
    pub schema: Option<String>,

    /// Service account user for basic authentication.
    pub auth_username: Option<String>,

    /// Service account password (not recommended to store in config).
    pub auth_password: Option<String>,

    /// Run statements as the requesting principal.
    #[serde(default)]
    pub has_impersonation: bool,

    /// Default session properties, merged under the caller's own.
    #[serde(default)]
    pub session: SessionConfig,

    /// Table-name substitutions applied before submission.
    #[serde(default)]
    pub rewrites: Vec<TableRewrite>,

    /// Strip trailing statement terminators before submission.
    pub strip_terminator: Option<bool>,
}

/// Session properties block of a backend.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub properties: Vec<SessionProperty>,
}

/// A literal table-name substitution, e.g. `stg_stream` → `kudu.stg_stream`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRewrite {
    pub from: String,
    pub to: String,
}

impl BackendConfig {
    /// Whether trailing `;` should be stripped (defaults on for presto).
    pub fn strips_terminator(&self) -> bool {
        self.strip_terminator
            .unwrap_or(self.kind == BackendKind::Presto)
    }

    /// Returns the configured port or the backend default.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| self.kind.default_port())
    }

    /// Returns a display-safe string (no password) for logs.
    pub fn display_string(&self) -> String {
        if let Some(url) = &self.url {
            return mask_password(url);
        }
        let host = self.host.as_deref().unwrap_or("localhost");
        let catalog = self.catalog.as_deref().unwrap_or("-");
        let schema = self.schema.as_deref().unwrap_or("-");
        format!(
            "{} {host}:{} ({catalog}.{schema})",
            self.kind.as_str(),
            self.port_or_default()
        )
    }
}

/// Masks the password component of a URL; unparsable templates are returned as-is.
pub fn mask_password(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            if url.set_password(Some("***")).is_ok() {
                url.to_string()
            } else {
                raw.to_string()
            }
        }
        _ => raw.to_string(),
    }
}

impl Config {
    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("db-conduit")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConduitError::config(format!("Failed to read config file: {e}")))?;

        Self::parse_toml(&content, path)
    }

    /// Parses configuration from a TOML string.
    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            ConduitError::config(format!(
                "Configuration error in {}:\n  {}",
                path.display(),
                e
            ))
        })
    }

    /// Gets a named backend.
    pub fn backend(&self, name: &str) -> Result<&BackendConfig> {
        self.backends
            .get(name)
            .ok_or_else(|| ConduitError::config(format!("Backend '{name}' not found in config")))
    }

    /// Adds or replaces a named backend.
    pub fn with_backend(mut self, name: impl Into<String>, backend: BackendConfig) -> Self {
        self.backends.insert(name.into(), backend);
        self
    }
}
