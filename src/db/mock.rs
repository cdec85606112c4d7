//! Mock backend for testing.
//!
//! Provides an in-memory, scripted backend for headless testing. Results are
//! registered per statement; unknown statements echo themselves back as a
//! single-row result. The database records what cursors were asked to do so
//! tests can assert on fetch sizes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{
    ColumnMeta, Connection, Connector, Cursor, PollState, Row, Submission, Value,
};
use crate::config::BackendConfig;
use crate::connection::Principal;
use crate::error::{ConduitError, Result};

/// Scripted result of one statement.
#[derive(Debug, Clone, Default)]
pub struct MockResult {
    columns: Vec<String>,
    rows: Vec<Row>,
    pending_polls: usize,
    final_state: Option<PollState>,
    hangs: bool,
    log: Vec<String>,
    execute_error: Option<String>,
    fetch_error: Option<String>,
}

impl MockResult {
    /// Creates a result with the given column names and rows.
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>, rows: Vec<Row>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows,
            ..Default::default()
        }
    }

    /// Makes the statement complete asynchronously after `polls` status checks.
    pub fn with_pending_polls(mut self, polls: usize) -> Self {
        self.pending_polls = polls;
        self
    }

    /// State reported once the pending polls are used up, instead of
    /// `Available`. The statement is always submitted asynchronously.
    pub fn with_final_state(mut self, state: PollState) -> Self {
        self.final_state = Some(state);
        self
    }

    /// Makes status and log requests never complete, like a backend that
    /// stopped answering. The statement is submitted asynchronously.
    pub fn hanging(mut self) -> Self {
        self.hangs = true;
        self
    }

    /// Log lines revealed one per status check.
    pub fn with_log<S: Into<String>>(mut self, lines: impl IntoIterator<Item = S>) -> Self {
        self.log = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Fails the statement at submission with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            execute_error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Fails every fetch after submission with `message`.
    pub fn with_fetch_error(mut self, message: impl Into<String>) -> Self {
        self.fetch_error = Some(message.into());
        self
    }
}

/// In-memory database shared by every mock connection built from it.
#[derive(Debug, Default)]
pub struct MockDatabase {
    results: HashMap<String, MockResult>,
    executed: Mutex<Vec<String>>,
    fetch_requests: Mutex<Vec<usize>>,
    closed_cursors: AtomicUsize,
}

impl MockDatabase {
    /// Creates a mock database with no scripted results.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the result returned for `statement`.
    pub fn with_result(mut self, statement: impl Into<String>, result: MockResult) -> Self {
        self.results.insert(statement.into().trim().to_string(), result);
        self
    }

    /// Statements submitted so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Row counts requested from `fetch_many`, in order.
    pub fn fetch_requests(&self) -> Vec<usize> {
        self.fetch_requests
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    /// Number of cursors that have been closed.
    pub fn closed_cursors(&self) -> usize {
        self.closed_cursors.load(Ordering::SeqCst)
    }

    fn lookup(&self, statement: &str) -> MockResult {
        self.results
            .get(statement.trim())
            .cloned()
            .unwrap_or_else(|| {
                MockResult::new(
                    ["result"],
                    vec![vec![Value::String(format!("Mock result for: {statement}"))]],
                )
            })
    }
}

fn record<T>(log: &Mutex<Vec<T>>, item: T) {
    if let Ok(mut guard) = log.lock() {
        guard.push(item);
    }
}

/// Connector producing mock connections over one shared database.
#[derive(Debug)]
pub struct MockConnector {
    db: Arc<MockDatabase>,
    connects: AtomicUsize,
    fail_with: Option<String>,
}

impl MockConnector {
    /// Creates a connector over `db`.
    pub fn new(db: Arc<MockDatabase>) -> Self {
        Self {
            db,
            connects: AtomicUsize::new(0),
            fail_with: None,
        }
    }

    /// Creates a connector whose every connection attempt fails.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            db: Arc::new(MockDatabase::new()),
            connects: AtomicUsize::new(0),
            fail_with: Some(message.into()),
        }
    }

    /// Number of connection attempts made.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _backend: &BackendConfig,
        _principal: &Principal,
    ) -> Result<Arc<dyn Connection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            return Err(ConduitError::connection(message.clone()));
        }
        Ok(Arc::new(MockConnection::new(self.db.clone())))
    }
}

/// A mock connection.
#[derive(Debug)]
pub struct MockConnection {
    db: Arc<MockDatabase>,
}

impl MockConnection {
    pub fn new(db: Arc<MockDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn open_cursor(&self) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(MockCursor {
            db: self.db.clone(),
            result: MockResult::default(),
            position: 0,
            status_checks: 0,
            closed: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MockCursor {
    db: Arc<MockDatabase>,
    result: MockResult,
    position: usize,
    status_checks: usize,
    closed: bool,
}

impl MockCursor {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ConduitError::query("Invalid query handle: cursor is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Cursor for MockCursor {
    async fn execute(&mut self, statement: &str) -> Result<Submission> {
        self.ensure_open()?;
        record(&self.db.executed, statement.to_string());

        let result = self.db.lookup(statement);
        if let Some(message) = &result.execute_error {
            return Err(ConduitError::query(message.clone()));
        }

        let submission = if result.pending_polls > 0 || result.final_state.is_some() || result.hangs {
            Submission::Pending
        } else {
            Submission::Finished
        };
        self.result = result;
        self.position = 0;
        self.status_checks = 0;
        Ok(submission)
    }

    async fn status(&mut self) -> Result<PollState> {
        self.ensure_open()?;
        if self.result.hangs {
            std::future::pending::<()>().await;
        }
        self.status_checks += 1;
        if self.status_checks <= self.result.pending_polls {
            Ok(PollState::Running)
        } else {
            Ok(self.result.final_state.unwrap_or(PollState::Available))
        }
    }

    async fn fetch_many(&mut self, n: usize) -> Result<Vec<Row>> {
        self.ensure_open()?;
        record(&self.db.fetch_requests, n);
        if let Some(message) = &self.result.fetch_error {
            return Err(ConduitError::query(message.clone()));
        }

        let end = (self.position + n).min(self.result.rows.len());
        let rows = self.result.rows[self.position..end].to_vec();
        self.position = end;
        Ok(rows)
    }

    async fn fetch_one(&mut self) -> Result<Option<Row>> {
        self.ensure_open()?;
        if let Some(message) = &self.result.fetch_error {
            return Err(ConduitError::query(message.clone()));
        }
        let row = self.result.rows.get(self.position).cloned();
        if row.is_some() {
            self.position += 1;
        }
        Ok(row)
    }

    fn describe(&self) -> Vec<ColumnMeta> {
        self.result.columns.iter().map(ColumnMeta::new).collect()
    }

    async fn log(&mut self, _start_from: usize) -> Result<String> {
        if self.result.hangs {
            std::future::pending::<()>().await;
        }
        let revealed = self.status_checks.min(self.result.log.len());
        let mut text = String::new();
        for line in &self.result.log[..revealed] {
            text.push_str(line);
            text.push('\n');
        }
        Ok(text)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.db.closed_cursors.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
