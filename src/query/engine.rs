//! The query engine facade.

use std::io::Write;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::cache::ExecutionCache;
use super::executor::execute_statement;
use super::export::{write_stream, DownloadMarker, ExportFormat, ResultStream};
use super::fetcher::fetch_batch;
use super::poller::{ensure_available, until_available, NoopObserver, PollObserver, PollSchedule};
use super::{CloseStatus, ExecuteResponse, Handle, QueryRequest, StatusResponse};
use crate::config::Config;
use crate::connection::ConnectionRegistry;
use crate::db::{Connector, DriverConnector, FetchBatch, PollState};
use crate::error::{ConduitError, Result};

/// Owns the connection registry and the execution cache and exposes the
/// statement lifecycle over handles.
///
/// The engine is `Send + Sync`; share it behind an `Arc` between tasks.
pub struct QueryEngine {
    config: Config,
    registry: ConnectionRegistry,
    cache: ExecutionCache,
    schedule: PollSchedule,
}

impl QueryEngine {
    /// Creates an engine that connects through the real backend drivers.
    pub fn new(config: Config) -> Self {
        let connector = DriverConnector::new(
            config.engine.connect_timeout(),
            config.engine.fetch_buffer_rows,
        );
        Self::with_connector(config, Arc::new(connector))
    }

    /// Creates an engine with a custom connector.
    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Self {
        let schedule = PollSchedule::new(config.engine.poll_unit());
        Self {
            config,
            registry: ConnectionRegistry::new(connector),
            cache: ExecutionCache::new(),
            schedule,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ExecutionCache {
        &self.cache
    }

    /// Submits a statement and caches the execution under a fresh handle.
    pub async fn execute(&self, request: &QueryRequest) -> Result<ExecuteResponse> {
        let context = execute_statement(&self.config, &self.registry, request).await?;
        let meta = context.columns.clone();
        let handle = Handle::new();
        self.cache.put(handle.clone(), context);
        info!("Registered execution {} for {}", handle, request.backend);

        Ok(ExecuteResponse {
            sync: false,
            has_result_set: true,
            modified_row_count: 0,
            handle,
            result: FetchBatch::table(Vec::new(), meta, true),
        })
    }

    /// Executes `request` and points it at the new handle, closing the
    /// execution it previously referred to.
    pub(crate) async fn execute_for(&self, request: &mut QueryRequest) -> Result<ExecuteResponse> {
        if let Some(previous) = request.handle.take() {
            if self.cache.contains(&previous) {
                debug!("Replacing execution {} for request {}", previous, request.id);
                if let Err(e) = self.close_statement(&previous).await {
                    warn!("Failed to close replaced execution {}: {}", previous, e);
                }
            }
        }
        let response = self.execute(request).await?;
        request.handle = Some(response.handle.clone());
        Ok(response)
    }

    /// Returns true if the request's execution can still be read from its
    /// first row.
    pub async fn can_start_over(&self, request: &QueryRequest) -> bool {
        let Some(handle) = &request.handle else {
            return false;
        };
        let Ok(entry) = self.cache.get(handle) else {
            return false;
        };
        let first = match entry.lock().await {
            Ok(ctx) => ctx.is_first_fetch(),
            Err(_) => false,
        };
        first
    }

    /// Fetches the next page of a cached execution.
    ///
    /// Cursors only move forward: `start_over` on an execution that was
    /// already read from continues where the previous page ended.
    pub async fn fetch_result(
        &self,
        handle: &Handle,
        rows: usize,
        start_over: bool,
    ) -> Result<FetchBatch> {
        let entry = self.cache.get(handle)?;
        if start_over && !entry.lock().await?.is_first_fetch() {
            debug!("Execution {} cannot restart; continuing from the cursor", handle);
        }
        fetch_batch(&entry, rows).await
    }

    /// Fetches for a request, executing it first when a read from the top
    /// is requested and its current execution cannot provide one.
    pub async fn fetch(
        &self,
        request: &mut QueryRequest,
        rows: usize,
        start_over: bool,
    ) -> Result<FetchBatch> {
        if start_over && !self.can_start_over(request).await {
            let response = self.execute_for(request).await?;
            let state = self
                .wait_until_available(&response.handle, &NoopObserver)
                .await?;
            ensure_available(state)?;
        }
        let handle = request
            .handle
            .clone()
            .ok_or_else(|| ConduitError::expired("Request has not been executed"))?;
        self.fetch_result(&handle, rows, start_over).await
    }

    /// Reports the remote execution state.
    pub async fn check_status(&self, handle: &Handle) -> Result<StatusResponse> {
        let entry = self.cache.get(handle)?;
        let mut ctx = entry.lock().await?;
        let status = entry
            .unless_released(ctx.cursor.status())
            .await
            .map_err(ConduitError::reclassify)?;
        Ok(StatusResponse { status })
    }

    /// Returns execution log text starting at `start_from`.
    pub async fn get_log(&self, handle: &Handle, start_from: usize) -> Result<String> {
        let entry = self.cache.get(handle)?;
        let mut ctx = entry.lock().await?;
        let log = entry
            .unless_released(ctx.cursor.log(start_from))
            .await
            .map_err(ConduitError::reclassify)?;
        Ok(if ctx.cursor.log_is_full() {
            log.get(start_from..).unwrap_or_default().to_string()
        } else {
            log
        })
    }

    /// Waits for an asynchronous execution to leave its pending states.
    pub async fn wait_until_available(
        &self,
        handle: &Handle,
        observer: &dyn PollObserver,
    ) -> Result<PollState> {
        until_available(&self.cache, handle, self.schedule, observer).await
    }

    /// Cancels an execution, interrupting any in-flight poll or fetch.
    pub async fn cancel(&self, handle: &Handle) -> Result<CloseStatus> {
        info!("Canceling execution {}", handle);
        self.release(handle).await
    }

    /// Closes an execution and releases its cursor.
    pub async fn close_statement(&self, handle: &Handle) -> Result<CloseStatus> {
        info!("Closing execution {}", handle);
        self.release(handle).await
    }

    async fn release(&self, handle: &Handle) -> Result<CloseStatus> {
        match self.cache.remove(handle).await {
            Some(true) => Ok(CloseStatus::ok()),
            Some(false) => Ok(CloseStatus::failed()),
            None => Err(ConduitError::unknown_handle(handle)),
        }
    }

    /// Lazy single-batch view of `request`'s result, bounded by `max_rows`.
    pub fn stream<'a>(
        &'a self,
        request: QueryRequest,
        max_rows: usize,
        observer: &'a dyn PollObserver,
    ) -> ResultStream<'a> {
        ResultStream::new(self, request, max_rows, observer)
    }

    /// Exports `request`'s result to `writer`.
    ///
    /// At most the configured download row limit is written. Any failure is
    /// returned as a download error carrying user-facing guidance.
    pub async fn download<W: Write + Send>(
        &self,
        request: &QueryRequest,
        format: ExportFormat,
        writer: W,
        observer: &dyn PollObserver,
    ) -> Result<DownloadMarker> {
        let mut stream = self.stream(
            request.clone(),
            self.config.engine.download_row_limit,
            observer,
        );
        let mut sink = format.sink(writer);
        let result = write_stream(
            &mut stream,
            sink.as_mut(),
            &request.id,
            self.config.engine.download_marker_max_age(),
        )
        .await;
        stream.close().await;

        result.map_err(|e| {
            warn!("Download for result {} failed: {}", request.id, e);
            e.into_download()
        })
    }

    /// Closes every cached execution and connection.
    pub async fn shutdown(&self) {
        for handle in self.cache.handles() {
            let _ = self.release(&handle).await;
        }
        self.registry.close_all().await;
    }
}
