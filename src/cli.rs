//! Command-line argument parsing for conduit.

use std::path::PathBuf;

use clap::Parser;
use db_conduit::config::{BackendConfig, Config};
use db_conduit::connection::Principal;
use db_conduit::db::BackendKind;
use db_conduit::error::{ConduitError, Result};
use db_conduit::query::ExportFormat;

/// Name of the backend registered by `--mock-db`.
pub const MOCK_BACKEND: &str = "mock";

/// Run a statement against a remote engine and print or export its result.
#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Statement to execute
    #[arg(value_name = "STATEMENT")]
    pub statement: String,

    /// Config file path
    #[arg(long, value_name = "PATH", env = "CONDUIT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Backend name from the config file
    #[arg(short = 'b', long, value_name = "NAME")]
    pub backend: Option<String>,

    /// Principal to run the statement as
    #[arg(short = 'u', long, value_name = "NAME", env = "CONDUIT_USER")]
    pub user: Option<String>,

    /// Session property (repeatable), e.g. --property password=secret
    #[arg(short = 'P', long = "property", value_name = "KEY=VALUE", value_parser = parse_property)]
    pub properties: Vec<(String, String)>,

    /// Rows per page
    #[arg(short = 'n', long, value_name = "N", default_value = "100")]
    pub rows: usize,

    /// Export the result to a file instead of printing pages
    #[arg(long, value_name = "PATH")]
    pub export: Option<PathBuf>,

    /// Export format
    #[arg(long, value_name = "FORMAT", default_value = "csv")]
    pub format: ExportFormat,

    /// Use the in-memory mock backend (for testing)
    #[arg(long)]
    pub mock_db: bool,
}

fn parse_property(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("Invalid property '{s}'. Expected KEY=VALUE")),
    }
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }

    /// Loads the config file, adding the mock backend when requested.
    pub fn load_config(&self) -> Result<Config> {
        let config = Config::load_from_file(&self.config_path())?;
        Ok(self.apply_mock(config))
    }

    fn apply_mock(&self, config: Config) -> Config {
        if !self.mock_db {
            return config;
        }
        config.with_backend(
            MOCK_BACKEND,
            BackendConfig {
                kind: BackendKind::Mock,
                ..Default::default()
            },
        )
    }

    /// Picks the backend: `--backend`, then `mock` with `--mock-db`, then
    /// the only configured backend.
    pub fn backend_name(&self, config: &Config) -> Result<String> {
        if let Some(name) = &self.backend {
            return Ok(name.clone());
        }
        if self.mock_db {
            return Ok(MOCK_BACKEND.to_string());
        }
        let mut names = config.backends.keys();
        match (names.next(), names.next()) {
            (Some(only), None) => Ok(only.clone()),
            (None, _) => Err(ConduitError::config(
                "No backends configured. Add one to the config file or use --mock-db",
            )),
            _ => Err(ConduitError::config(
                "Several backends configured; choose one with --backend",
            )),
        }
    }

    /// Builds the principal from `--user` (or `$USER`) and `--property`.
    pub fn principal(&self) -> Principal {
        let username = self
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "anonymous".to_string());
        self.properties
            .iter()
            .fold(Principal::new(username), |p, (k, v)| p.with_property(k, v))
    }
}
