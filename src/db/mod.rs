//! Backend abstraction layer.
//!
//! Every remote engine is reached through the same small capability
//! interface: a [`Connection`] hands out [`Cursor`]s, and a cursor can
//! execute, report status, fetch and describe its columns. The executor and
//! fetcher never branch on backend identity; that knowledge stays inside the
//! adapters in this module.

mod mock;
mod presto;
mod sql;
mod types;

pub use mock::{MockConnection, MockConnector, MockDatabase, MockResult};
pub use presto::{PrestoConnection, PrestoCursor};
pub use sql::{SqlConnection, SqlCursor};
pub use types::{
    ColumnMeta, FetchBatch, LogicalType, PollState, ResultKind, Row, Submission, Value,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use crate::config::BackendConfig;
use crate::connection::Principal;
use crate::error::Result;

/// Supported backend families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Presto-compatible engines over the REST statement protocol.
    Presto,
    /// Generic SQL dialect engines (postgres, mysql, sqlite) via sqlx.
    #[default]
    Sql,
    /// In-memory scripted backend.
    Mock,
}

impl BackendKind {
    /// Returns the backend as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Presto => "presto",
            Self::Sql => "sql",
            Self::Mock => "mock",
        }
    }

    /// Parses a backend from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "presto" | "trino" => Some(Self::Presto),
            "sql" | "jdbc" | "sqlalchemy" => Some(Self::Sql),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }

    /// Returns the default port for this backend.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Presto => 8080,
            Self::Sql | Self::Mock => 0,
        }
    }
}

/// Backend-specific statement rewriting applied before submission.
#[derive(Debug, Clone, Default)]
pub struct StatementPolicy {
    strip_terminator: bool,
    rewrites: Vec<(Regex, String)>,
}

impl StatementPolicy {
    /// Builds the policy configured for `backend`.
    pub fn from_backend(backend: &BackendConfig) -> Self {
        let rewrites = backend
            .rewrites
            .iter()
            .filter_map(|rw| {
                let pattern = format!(r"(^|[^\w.]){}\b", regex::escape(&rw.from));
                match Regex::new(&pattern) {
                    Ok(re) => Some((re, rw.to.clone())),
                    Err(e) => {
                        warn!("Ignoring table rewrite '{}': {}", rw.from, e);
                        None
                    }
                }
            })
            .collect();

        Self {
            strip_terminator: backend.strips_terminator(),
            rewrites,
        }
    }

    /// Rewrites a statement: unqualified table names first, then trailing `;`.
    pub fn apply(&self, statement: &str) -> String {
        let mut out = statement.to_string();
        for (re, to) in &self.rewrites {
            out = re
                .replace_all(&out, |caps: &regex::Captures| format!("{}{}", &caps[1], to))
                .into_owned();
        }
        if self.strip_terminator {
            out = out.trim_end().trim_end_matches(';').trim_end().to_string();
        }
        out
    }
}

/// A live connection (or engine) to one backend, shared by all cursors
/// opened for the same principal.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a fresh cursor on this connection.
    async fn open_cursor(&self) -> Result<Box<dyn Cursor>>;

    /// Applies backend-specific rewriting to a statement before submission.
    fn prepare_statement(&self, statement: &str) -> String {
        statement.to_string()
    }

    /// Returns false once the connection can no longer serve cursors.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Closes the connection.
    async fn close(&self) -> Result<()>;
}

/// A cursor over one statement's result set.
#[async_trait]
pub trait Cursor: Send {
    /// Submits a statement.
    async fn execute(&mut self, statement: &str) -> Result<Submission>;

    /// Reports the remote execution state.
    async fn status(&mut self) -> Result<PollState>;

    /// Fetches up to `n` rows, advancing the cursor.
    async fn fetch_many(&mut self, n: usize) -> Result<Vec<Row>>;

    /// Fetches a single row, or `None` once the result set is exhausted.
    async fn fetch_one(&mut self) -> Result<Option<Row>> {
        Ok(self.fetch_many(1).await?.into_iter().next())
    }

    /// Column metadata normalised from the driver's description.
    fn describe(&self) -> Vec<ColumnMeta>;

    /// Execution log text starting at `start_from`.
    async fn log(&mut self, _start_from: usize) -> Result<String> {
        Ok(String::new())
    }

    /// Whether [`Cursor::log`] always returns the full log rather than a tail.
    fn log_is_full(&self) -> bool {
        true
    }

    /// Releases the cursor and any remote resources behind it.
    async fn close(&mut self) -> Result<()>;
}

/// Constructs connections from backend configuration.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        backend: &BackendConfig,
        principal: &Principal,
    ) -> Result<Arc<dyn Connection>>;
}

/// Default connector dispatching on [`BackendKind`].
#[derive(Debug, Clone)]
pub struct DriverConnector {
    connect_timeout: Duration,
    fetch_buffer_rows: usize,
}

impl DriverConnector {
    /// Creates a connector with the given connect timeout and cursor buffer size.
    pub fn new(connect_timeout: Duration, fetch_buffer_rows: usize) -> Self {
        Self {
            connect_timeout,
            fetch_buffer_rows: fetch_buffer_rows.max(1),
        }
    }
}

#[async_trait]
impl Connector for DriverConnector {
    async fn connect(
        &self,
        backend: &BackendConfig,
        principal: &Principal,
    ) -> Result<Arc<dyn Connection>> {
        match backend.kind {
            BackendKind::Sql => {
                let conn = SqlConnection::connect(
                    backend,
                    principal,
                    self.connect_timeout,
                    self.fetch_buffer_rows,
                )
                .await?;
                Ok(Arc::new(conn))
            }
            BackendKind::Presto => {
                let conn = PrestoConnection::new(backend, principal, self.connect_timeout)?;
                Ok(Arc::new(conn))
            }
            BackendKind::Mock => Ok(Arc::new(MockConnection::new(Arc::new(
                MockDatabase::new(),
            )))),
        }
    }
}
