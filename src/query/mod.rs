//! Statement lifecycle: execute, poll, fetch, export, close.
//!
//! [`QueryEngine`] ties the connection registry and the execution cache
//! together; the submodules hold the individual steps so they can be tested
//! on their own.

pub mod cache;
pub mod engine;
pub mod executor;
pub mod export;
pub mod fetcher;
pub mod poller;

pub use cache::{CachedExecution, ExecutionCache, ExecutionContext};
pub use engine::QueryEngine;
pub use export::{
    CsvSink, DownloadMarker, DownloadSummary, ExportFormat, ExportSink, JsonLinesSink,
    ResultStream,
};
pub use poller::{backoff_units, ensure_available, NoopObserver, PollObserver, PollSchedule};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::Principal;
use crate::db::{FetchBatch, PollState};

/// Opaque identifier of one live execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// Allocates a fresh random handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Handle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl FromStr for Handle {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// A statement to run for a principal against a named backend.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Result identifier; names the download marker.
    pub id: String,
    pub backend: String,
    pub statement: String,
    pub principal: Principal,
    /// Handle of the execution currently backing this request, if any.
    pub handle: Option<Handle>,
}

impl QueryRequest {
    pub fn new(
        backend: impl Into<String>,
        statement: impl Into<String>,
        principal: Principal,
    ) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            backend: backend.into(),
            statement: statement.into(),
            principal,
            handle: None,
        }
    }

    /// Sets the result identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Envelope returned by [`QueryEngine::execute`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecuteResponse {
    pub sync: bool,
    pub has_result_set: bool,
    pub modified_row_count: u64,
    pub handle: Handle,
    /// Column preview; rows are only returned by fetch.
    pub result: FetchBatch,
}

/// Envelope returned by [`QueryEngine::check_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusResponse {
    pub status: PollState,
}

/// Result of close/cancel: 0 on success, -1 if releasing the cursor failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CloseStatus {
    pub status: i32,
}

impl CloseStatus {
    pub fn ok() -> Self {
        Self { status: 0 }
    }

    pub fn failed() -> Self {
        Self { status: -1 }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}
