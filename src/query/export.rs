//! Bulk export of a result set.
//!
//! A [`ResultStream`] wraps one execution behind a lazy sequence of
//! `(headers, batch)` pairs. It runs exactly one fetch cycle, bounded by the
//! configured row limit, and then reports exhaustion; it cannot be
//! restarted. Exporters write that batch through an [`ExportSink`].

use std::io::Write;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{ensure_available, Handle, PollObserver, QueryEngine, QueryRequest};
use crate::db::{FetchBatch, Row, Value};
use crate::error::{ConduitError, Result};

/// Output format of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Csv,
    JsonLines,
}

impl ExportFormat {
    /// Conventional file extension.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::JsonLines => "jsonl",
        }
    }

    /// Builds a sink writing this format to `writer`.
    pub fn sink<'a, W: Write + Send + 'a>(&self, writer: W) -> Box<dyn ExportSink + 'a> {
        match self {
            Self::Csv => Box::new(CsvSink::new(writer)),
            Self::JsonLines => Box::new(JsonLinesSink::new(writer)),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ConduitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "jsonl" | "json" | "ndjson" => Ok(Self::JsonLines),
            other => Err(ConduitError::config(format!(
                "Unknown export format '{other}' (expected csv or jsonl)"
            ))),
        }
    }
}

/// Destination of exported rows.
pub trait ExportSink: Send {
    fn write_headers(&mut self, headers: &[String]) -> Result<()>;
    fn write_row(&mut self, row: &Row) -> Result<()>;
    /// Flushes buffered output.
    fn finish(&mut self) -> Result<()>;
}

fn io_error(e: impl std::fmt::Display) -> ConduitError {
    ConduitError::internal(format!("Failed to write export: {e}"))
}

/// Comma-separated output with a header record.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
        }
    }
}

impl<W: Write + Send> ExportSink for CsvSink<W> {
    fn write_headers(&mut self, headers: &[String]) -> Result<()> {
        self.writer.write_record(headers).map_err(io_error)
    }

    fn write_row(&mut self, row: &Row) -> Result<()> {
        self.writer
            .write_record(row.iter().map(Value::to_export_string))
            .map_err(io_error)
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().map_err(io_error)
    }
}

/// One JSON object per line, keyed by column name.
pub struct JsonLinesSink<W: Write> {
    writer: W,
    headers: Vec<String>,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            headers: Vec::new(),
        }
    }
}

impl<W: Write + Send> ExportSink for JsonLinesSink<W> {
    fn write_headers(&mut self, headers: &[String]) -> Result<()> {
        self.headers = headers.to_vec();
        Ok(())
    }

    fn write_row(&mut self, row: &Row) -> Result<()> {
        let object: serde_json::Map<String, serde_json::Value> = self
            .headers
            .iter()
            .zip(row)
            .map(|(name, value)| {
                serde_json::to_value(value).map(|v| (name.clone(), v))
            })
            .collect::<std::result::Result<_, _>>()
            .map_err(io_error)?;
        serde_json::to_writer(&mut self.writer, &object).map_err(io_error)?;
        self.writer.write_all(b"\n").map_err(io_error)
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().map_err(io_error)
    }
}

/// Value of the download marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadSummary {
    pub truncated: bool,
    pub row_counter: usize,
}

/// Short-lived marker attached to a finished download so clients can detect
/// truncation without re-querying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadMarker {
    /// `download-<result id>`.
    pub name: String,
    pub value: DownloadSummary,
    pub max_age: Duration,
}

impl DownloadMarker {
    pub fn new(result_id: &str, truncated: bool, row_counter: usize, max_age: Duration) -> Self {
        Self {
            name: format!("download-{result_id}"),
            value: DownloadSummary {
                truncated,
                row_counter,
            },
            max_age,
        }
    }

    /// The marker value as compact JSON.
    pub fn value_json(&self) -> String {
        serde_json::json!({
            "truncated": self.value.truncated,
            "row_counter": self.value.row_counter,
        })
        .to_string()
    }
}

/// Single-pass, lazy view of one execution's result.
pub struct ResultStream<'a> {
    engine: &'a QueryEngine,
    request: QueryRequest,
    max_rows: usize,
    observer: &'a dyn PollObserver,
    exhausted: bool,
    executed: bool,
}

impl<'a> ResultStream<'a> {
    pub(crate) fn new(
        engine: &'a QueryEngine,
        request: QueryRequest,
        max_rows: usize,
        observer: &'a dyn PollObserver,
    ) -> Self {
        Self {
            engine,
            request,
            max_rows,
            observer,
            exhausted: false,
            executed: false,
        }
    }

    /// Handle of the execution being streamed, once known.
    pub fn handle(&self) -> Option<&Handle> {
        self.request.handle.as_ref()
    }

    /// Returns the next `(headers, batch)` pair, or `None` once exhausted.
    ///
    /// The first call executes the statement if the request carries no
    /// handle that can be read from the top, waits until it is available,
    /// and fetches up to `max_rows` rows. Every later call returns `None`.
    pub async fn next_batch(&mut self) -> Result<Option<(Vec<String>, FetchBatch)>> {
        if self.exhausted {
            return Ok(None);
        }
        self.exhausted = true;

        if !self.engine.can_start_over(&self.request).await {
            let response = self.engine.execute_for(&mut self.request).await?;
            self.executed = true;
            self.observer.on_execute(&response.handle);
        }
        let handle = self
            .request
            .handle
            .clone()
            .ok_or_else(|| ConduitError::internal("Stream has no handle after execute"))?;

        let state = self
            .engine
            .wait_until_available(&handle, self.observer)
            .await?;
        ensure_available(state)?;

        let batch = self
            .engine
            .fetch_result(&handle, self.max_rows, true)
            .await?;
        debug!("Stream for {} produced {} rows", handle, batch.data.len());
        Ok(Some((batch.headers(), batch)))
    }

    /// Closes the execution if this stream created it.
    pub async fn close(&mut self) {
        if !self.executed {
            return;
        }
        self.executed = false;
        if let Some(handle) = &self.request.handle {
            match self.engine.close_statement(handle).await {
                Ok(status) if status.is_ok() => {}
                Ok(_) => warn!("Closing streamed execution {} reported failure", handle),
                Err(e) => warn!("Failed to close streamed execution {}: {}", handle, e),
            }
        }
    }
}

/// Writes one stream to `sink` and builds the download marker.
pub(crate) async fn write_stream(
    stream: &mut ResultStream<'_>,
    sink: &mut dyn ExportSink,
    result_id: &str,
    max_age: Duration,
) -> Result<DownloadMarker> {
    let mut row_counter = 0usize;
    let mut truncated = false;

    while let Some((headers, batch)) = stream.next_batch().await? {
        sink.write_headers(&headers)?;
        for row in &batch.data {
            sink.write_row(row)?;
            row_counter += 1;
        }
        truncated = batch.has_more;
    }
    sink.finish()?;

    info!(
        "Exported {} rows for result {} (truncated: {})",
        row_counter, result_id, truncated
    );
    Ok(DownloadMarker::new(result_id, truncated, row_counter, max_age))
}
