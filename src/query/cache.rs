//! Handle-keyed store of live executions.
//!
//! The cache owns every [`ExecutionContext`]. Fetchers and the poller borrow
//! an entry through its per-handle mutex; operations on different handles
//! never contend. Removing an entry cancels its token before the cursor is
//! released, so anything still holding the entry observes the removal and
//! fails with `QueryExpired` instead of touching a closed cursor.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Handle;
use crate::connection::ConnectionKey;
use crate::db::{ColumnMeta, Connection, Cursor, Row, Submission};
use crate::error::{ConduitError, Result};

/// Everything needed to keep fetching from one executed statement.
pub struct ExecutionContext {
    pub key: ConnectionKey,
    pub columns: Vec<ColumnMeta>,
    pub submission: Submission,
    pub created_at: Instant,
    pub(crate) cursor: Box<dyn Cursor>,
    // Keeps the shared connection alive while the cursor is open.
    connection: Arc<dyn Connection>,
    probe_row: Option<Row>,
    probed: bool,
    fetched: bool,
}

impl ExecutionContext {
    pub fn new(
        key: ConnectionKey,
        connection: Arc<dyn Connection>,
        cursor: Box<dyn Cursor>,
        submission: Submission,
    ) -> Self {
        Self {
            key,
            columns: Vec::new(),
            submission,
            created_at: Instant::now(),
            cursor,
            connection,
            probe_row: None,
            probed: false,
            fetched: false,
        }
    }

    /// Records the row pulled eagerly at execute time (possibly none).
    pub fn set_probe(&mut self, row: Option<Row>) {
        self.probe_row = row;
        self.probed = true;
    }

    /// Returns true once a probe was attempted for this context.
    pub fn probed(&self) -> bool {
        self.probed
    }

    /// Returns the peeked probe row without consuming it.
    pub fn probe_row(&self) -> Option<&Row> {
        self.probe_row.as_ref()
    }

    /// Marks the first fetch and returns whether the probe must be spliced in.
    ///
    /// The probe is handed out at most once: the second call always returns
    /// `None` and `false`.
    pub(crate) fn begin_fetch(&mut self) -> (bool, Option<Row>) {
        if self.fetched {
            return (false, None);
        }
        self.fetched = true;
        (self.probed, self.probe_row.take())
    }

    /// Returns true if no fetch has run against this context yet.
    pub fn is_first_fetch(&self) -> bool {
        !self.fetched
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }
}

/// A cache entry: the context behind its mutex plus the token that signals
/// its removal.
pub struct CachedExecution {
    handle: Handle,
    cancel: CancellationToken,
    context: Mutex<ExecutionContext>,
}

impl CachedExecution {
    fn new(handle: Handle, context: ExecutionContext) -> Self {
        Self {
            handle,
            cancel: CancellationToken::new(),
            context: Mutex::new(context),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Token cancelled when the entry leaves the cache.
    pub fn cancelled(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns true once close/cancel has removed this entry.
    pub fn is_released(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Locks the context, giving up as soon as the entry is released.
    pub async fn lock(&self) -> Result<MutexGuard<'_, ExecutionContext>> {
        if self.is_released() {
            return Err(ConduitError::unknown_handle(&self.handle));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConduitError::unknown_handle(&self.handle)),
            guard = self.context.lock() => Ok(guard),
        }
    }

    /// Awaits `work`, abandoning it as soon as the entry is released.
    ///
    /// Every backend call made while the context is locked goes through
    /// here, so close and cancel never wait on an unresponsive backend.
    pub async fn unless_released<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConduitError::unknown_handle(&self.handle)),
            result = work => result,
        }
    }

    /// Cancels in-flight work and closes the cursor.
    ///
    /// Returns false if the cursor failed to close; the failure is logged
    /// and otherwise swallowed.
    async fn release(&self) -> bool {
        self.cancel.cancel();
        let mut ctx = self.context.lock().await;
        match ctx.cursor.close().await {
            Ok(()) => {
                debug!("Released execution {} on {}", self.handle, ctx.key);
                true
            }
            Err(e) => {
                warn!("Failed to close cursor for {}: {}", self.handle, e);
                false
            }
        }
    }
}

/// Process-wide map from handle to live execution.
#[derive(Default)]
pub struct ExecutionCache {
    entries: DashMap<Handle, Arc<CachedExecution>>,
}

impl ExecutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `context` under `handle`.
    pub fn put(&self, handle: Handle, context: ExecutionContext) -> Arc<CachedExecution> {
        let entry = Arc::new(CachedExecution::new(handle.clone(), context));
        if self.entries.insert(handle.clone(), entry.clone()).is_some() {
            warn!("Replaced existing execution under handle {}", handle);
        }
        entry
    }

    /// Looks up a live execution; unknown handles are `QueryExpired`.
    pub fn get(&self, handle: &Handle) -> Result<Arc<CachedExecution>> {
        self.entries
            .get(handle)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ConduitError::unknown_handle(handle))
    }

    /// Removes the entry and releases its cursor.
    ///
    /// The entry is unreachable to new lookups before its cursor is touched.
    /// Returns `None` for unknown handles, otherwise whether the cursor
    /// closed cleanly.
    pub async fn remove(&self, handle: &Handle) -> Option<bool> {
        let (_, entry) = self.entries.remove(handle)?;
        Some(entry.release().await)
    }

    pub fn contains(&self, handle: &Handle) -> bool {
        self.entries.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handles currently cached, in no particular order.
    pub fn handles(&self) -> Vec<Handle> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}
