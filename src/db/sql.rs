//! Generic SQL dialect backend.
//!
//! Reaches postgres, mysql and sqlite engines through `sqlx::any`. A cursor
//! streams rows from a background task into a bounded channel, so fetching
//! a page only pulls that page (plus the channel's read-ahead) off the wire.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column as SqlxColumn, Executor, Row as SqlxRow, TypeInfo};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    ColumnMeta, Connection, Cursor, PollState, Row, StatementPolicy, Submission, Value,
};
use crate::config::{mask_password, BackendConfig};
use crate::connection::{connection_url, Principal};
use crate::error::{ConduitError, Result};

/// Maximum pooled connections per (principal, backend).
const MAX_POOL_CONNECTIONS: u32 = 5;

fn install_drivers() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(sqlx::any::install_default_drivers);
}

/// A pooled connection to a SQL engine.
#[derive(Debug)]
pub struct SqlConnection {
    pool: AnyPool,
    policy: StatementPolicy,
    fetch_buffer_rows: usize,
}

impl SqlConnection {
    /// Resolves the backend URL for `principal` and opens a pool.
    pub async fn connect(
        backend: &BackendConfig,
        principal: &Principal,
        connect_timeout: Duration,
        fetch_buffer_rows: usize,
    ) -> Result<Self> {
        let url = connection_url(backend, principal)?;
        install_drivers();

        debug!("Opening SQL pool for {}", mask_password(&url));
        let pool = AnyPoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .acquire_timeout(connect_timeout)
            .connect(&url)
            .await
            .map_err(|e| map_connection_error(e, &url))?;

        Ok(Self::from_pool(
            pool,
            StatementPolicy::from_backend(backend),
            fetch_buffer_rows,
        ))
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: AnyPool, policy: StatementPolicy, fetch_buffer_rows: usize) -> Self {
        Self {
            pool,
            policy,
            fetch_buffer_rows: fetch_buffer_rows.max(1),
        }
    }
}

#[async_trait]
impl Connection for SqlConnection {
    async fn open_cursor(&self) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(SqlCursor::new(
            self.pool.clone(),
            self.fetch_buffer_rows,
        )))
    }

    fn prepare_statement(&self, statement: &str) -> String {
        self.policy.apply(statement)
    }

    fn is_healthy(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Messages sent from the streaming task to the cursor.
enum Frame {
    Columns(Vec<ColumnMeta>),
    Row(Row),
}

/// Streaming cursor over one statement.
pub struct SqlCursor {
    pool: AnyPool,
    buffer_rows: usize,
    statement: Option<String>,
    rx: Option<mpsc::Receiver<Result<Frame>>>,
    task: Option<JoinHandle<()>>,
    columns: Vec<ColumnMeta>,
    described: bool,
}

impl SqlCursor {
    fn new(pool: AnyPool, buffer_rows: usize) -> Self {
        Self {
            pool,
            buffer_rows,
            statement: None,
            rx: None,
            task: None,
            columns: Vec::new(),
            described: false,
        }
    }

    fn stop_stream(&mut self) {
        self.rx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Best-effort column metadata for statements that produced no rows.
    async fn describe_statement(&mut self) {
        self.described = true;
        let Some(statement) = self.statement.as_deref() else {
            return;
        };
        match (&self.pool).describe(statement).await {
            Ok(description) => {
                self.columns = description
                    .columns()
                    .iter()
                    .map(|col| ColumnMeta::new(col.name()))
                    .collect();
            }
            Err(e) => debug!("Could not describe empty result: {}", e),
        }
    }
}

#[async_trait]
impl Cursor for SqlCursor {
    async fn execute(&mut self, statement: &str) -> Result<Submission> {
        self.stop_stream();
        self.columns.clear();
        self.described = false;
        self.statement = Some(statement.to_string());

        let (tx, rx) = mpsc::channel(self.buffer_rows);
        let pool = self.pool.clone();
        let sql = statement.to_string();
        self.task = Some(tokio::spawn(stream_rows(pool, sql, tx)));
        self.rx = Some(rx);

        // Errors surface on the first fetch; the statement is already running.
        Ok(Submission::Finished)
    }

    async fn status(&mut self) -> Result<PollState> {
        Ok(PollState::Available)
    }

    async fn fetch_many(&mut self, n: usize) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(n.min(self.buffer_rows));

        while rows.len() < n {
            let Some(rx) = self.rx.as_mut() else {
                break;
            };
            match rx.recv().await {
                Some(Ok(Frame::Columns(columns))) => self.columns = columns,
                Some(Ok(Frame::Row(row))) => rows.push(row),
                Some(Err(e)) => {
                    self.stop_stream();
                    return Err(e);
                }
                None => {
                    self.rx = None;
                    self.task = None;
                }
            }
        }

        if self.rx.is_none() && self.columns.is_empty() && !self.described {
            self.describe_statement().await;
        }

        Ok(rows)
    }

    fn describe(&self) -> Vec<ColumnMeta> {
        self.columns.clone()
    }

    async fn close(&mut self) -> Result<()> {
        self.stop_stream();
        Ok(())
    }
}

impl Drop for SqlCursor {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

/// Streams the statement's rows into `tx` until exhausted, failed, or the
/// receiving cursor goes away.
async fn stream_rows(pool: AnyPool, sql: String, tx: mpsc::Sender<Result<Frame>>) {
    let mut stream = sqlx::query(&sql).fetch(&pool);
    let mut first = true;

    while let Some(item) = stream.next().await {
        let frame = match item {
            Ok(row) => {
                if first {
                    first = false;
                    if tx.send(Ok(Frame::Columns(columns_of(&row)))).await.is_err() {
                        return;
                    }
                }
                Ok(Frame::Row(convert_row(&row)))
            }
            Err(e) => Err(ConduitError::query(format_query_error(&e))),
        };

        let failed = frame.is_err();
        if tx.send(frame).await.is_err() || failed {
            return;
        }
    }
}

fn columns_of(row: &AnyRow) -> Vec<ColumnMeta> {
    row.columns()
        .iter()
        .map(|col| ColumnMeta::new(col.name()))
        .collect()
}

/// Converts a sqlx AnyRow to our Row type.
fn convert_row(row: &AnyRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

fn decode_integer(row: &AnyRow, index: usize) -> Option<i64> {
    row.try_get::<Option<i64>, _>(index)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<i32>, _>(index)
                .ok()
                .flatten()
                .map(i64::from)
        })
        .or_else(|| {
            row.try_get::<Option<i16>, _>(index)
                .ok()
                .flatten()
                .map(i64::from)
        })
}

fn decode_text(row: &AnyRow, index: usize) -> Option<String> {
    row.try_get::<Option<String>, _>(index).ok().flatten()
}

/// Decodes a column whose declared type is unknown (sqlite expressions).
fn decode_dynamic(row: &AnyRow, index: usize) -> Value {
    if let Some(v) = row.try_get::<Option<i64>, _>(index).ok().flatten() {
        return Value::BigInt(v);
    }
    if let Some(v) = row.try_get::<Option<f64>, _>(index).ok().flatten() {
        return Value::Float(v);
    }
    if let Some(v) = row.try_get::<Option<bool>, _>(index).ok().flatten() {
        return Value::Bool(v);
    }
    decode_text(row, index)
        .map(Value::String)
        .unwrap_or(Value::Null)
}

/// Converts a single column value from an AnyRow to our Value type.
fn convert_value(row: &AnyRow, index: usize, type_name: &str) -> Value {
    let type_name = type_name.to_uppercase();
    match type_name.as_str() {
        "NULL" => decode_dynamic(row, index),

        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "TINYINT" | "SMALLINT" | "INT2" | "MEDIUMINT" | "INT" | "INT4" | "INTEGER" => {
            match decode_integer(row, index) {
                Some(v) => i32::try_from(v)
                    .map(Value::Int)
                    .unwrap_or(Value::BigInt(v)),
                None => Value::Null,
            }
        }

        "BIGINT" | "INT8" => decode_integer(row, index)
            .map(Value::BigInt)
            .unwrap_or(Value::Null),

        "REAL" | "FLOAT" | "FLOAT4" | "DOUBLE" | "FLOAT8" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .or_else(|| {
                row.try_get::<Option<f32>, _>(index)
                    .ok()
                    .flatten()
                    .map(f64::from)
            })
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BLOB" | "BYTEA" | "BINARY" | "VARBINARY" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        name if name.contains("DATE") || name.contains("TIME") => decode_text(row, index)
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),

        _ => match decode_text(row, index) {
            Some(text) => Value::String(text),
            None => decode_dynamic(row, index),
        },
    }
}

/// Maps sqlx connection errors to readable messages.
fn map_connection_error(error: sqlx::Error, url: &str) -> ConduitError {
    let target = mask_password(url);
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("password authentication failed")
        || error_str.contains("access denied")
        || error_str.contains("authentication failed")
    {
        ConduitError::auth(format!("Authentication failed for {target}: {error}"))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        ConduitError::connection(format!("Connection to {target} timed out"))
    } else {
        warn!("Connection to {} failed: {}", target, error);
        ConduitError::connection(error.to_string())
    }
}

/// Formats a query error, preferring the database's own message.
fn format_query_error(error: &sqlx::Error) -> String {
    match error.as_database_error() {
        Some(db_error) => match db_error.code() {
            Some(code) => format!("({code}) {}", db_error.message()),
            None => db_error.message().to_string(),
        },
        None => error.to_string(),
    }
}
