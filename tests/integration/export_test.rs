//! Download tests: single-batch export, marker, error rewriting.

use std::fs;
use std::sync::Mutex;

use db_conduit::db::{MockDatabase, MockResult, PollState, Value};
use db_conduit::error::ConduitError;
use db_conduit::query::{ExportFormat, Handle, NoopObserver, PollObserver};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use super::common::{engine_with, numbers_engine, request};

#[derive(Default)]
struct Executions(Mutex<Vec<Handle>>);

impl PollObserver for Executions {
    fn on_execute(&self, handle: &Handle) {
        self.0.lock().unwrap().push(handle.clone());
    }
}

#[tokio::test]
async fn test_download_csv_within_limit() {
    let (engine, db) = numbers_engine(10);
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.csv");

    let req = request("SELECT n").with_id("r1");
    let marker = engine
        .download(&req, ExportFormat::Csv, fs::File::create(&path).unwrap(), &NoopObserver)
        .await
        .unwrap();

    let expected: String = std::iter::once("n".to_string())
        .chain((1..=10).map(|i| i.to_string()))
        .map(|line| line + "\n")
        .collect();
    assert_eq!(fs::read_to_string(&path).unwrap(), expected);

    assert_eq!(marker.name, "download-r1");
    assert!(!marker.value.truncated);
    assert_eq!(marker.value.row_counter, 10);
    assert_eq!(marker.value_json(), r#"{"row_counter":10,"truncated":false}"#);

    // The stream executed the statement, so it closed it too.
    assert!(engine.cache().is_empty());
    assert_eq!(db.closed_cursors(), 1);
}

#[tokio::test]
async fn test_download_is_single_batch_and_truncates() {
    // The configured download limit is 100 rows.
    let (engine, db) = numbers_engine(250);
    let mut out = Vec::new();

    let marker = engine
        .download(&request("SELECT n"), ExportFormat::JsonLines, &mut out, &NoopObserver)
        .await
        .unwrap();

    let text = String::from_utf8(out).unwrap();
    assert_eq!(text.lines().count(), 100);
    assert_eq!(text.lines().next(), Some(r#"{"n":1}"#));
    assert!(marker.value.truncated);
    assert_eq!(marker.value.row_counter, 100);
    assert_eq!(db.fetch_requests(), vec![99]);
}

#[tokio::test]
async fn test_download_reuses_unread_execution() {
    let (engine, db) = numbers_engine(3);
    let mut req = request("SELECT n");
    let handle = engine.execute(&req).await.unwrap().handle;
    req.handle = Some(handle.clone());

    let observer = Executions::default();
    let mut out = Vec::new();
    let marker = engine
        .download(&req, ExportFormat::Csv, &mut out, &observer)
        .await
        .unwrap();

    assert_eq!(marker.value.row_counter, 3);
    assert!(observer.0.lock().unwrap().is_empty());
    assert_eq!(db.executed().len(), 1);
    // Not created by the download, so left for the caller to close.
    assert!(engine.cache().contains(&handle));
}

#[tokio::test]
async fn test_stream_yields_one_batch() {
    let (engine, _db) = numbers_engine(30);
    let observer = Executions::default();
    let mut stream = engine.stream(request("SELECT n"), 10, &observer);

    let (headers, batch) = stream.next_batch().await.unwrap().unwrap();
    assert_eq!(headers, vec!["n".to_string()]);
    assert_eq!(batch.data.len(), 10);
    assert!(batch.has_more);
    assert!(stream.next_batch().await.unwrap().is_none());
    assert_eq!(observer.0.lock().unwrap().len(), 1);

    let handle = stream.handle().cloned().unwrap();
    assert!(engine.cache().contains(&handle));
    stream.close().await;
    assert!(!engine.cache().contains(&handle));
}

#[tokio::test]
async fn test_download_of_failed_statement() {
    let (engine, db) = engine_with(MockDatabase::new().with_result(
        "SELECT n",
        MockResult::new(["n"], vec![vec![Value::Int(1)]])
            .with_pending_polls(1)
            .with_final_state(PollState::Failed),
    ));
    let mut out = Vec::new();

    let err = engine
        .download(&request("SELECT n"), ExportFormat::Csv, &mut out, &NoopObserver)
        .await
        .unwrap_err();
    let ConduitError::Download { title, detail } = err else {
        panic!("expected download error");
    };
    assert_eq!(title, "The query result cannot be downloaded.");
    assert!(detail.contains("failed"));
    assert!(out.is_empty());
    assert!(db.fetch_requests().is_empty());
    assert!(engine.cache().is_empty());
}

#[tokio::test]
async fn test_download_error_carries_guidance() {
    let (engine, _db) = engine_with(
        MockDatabase::new()
            .with_result(
                "BIG",
                MockResult::failing("generic failure: Unable to find a callback: 32775"),
            )
            .with_result(
                "CACHED",
                MockResult::new(["x"], vec![vec![Value::Int(1)]]).with_fetch_error(
                    "query result cache exceeded its limit. Restarting the fetch is not possible.",
                ),
            ),
    );

    let err = engine
        .download(&request("BIG"), ExportFormat::Csv, Vec::new(), &NoopObserver)
        .await
        .unwrap_err();
    match err {
        ConduitError::Download { title, detail } => {
            assert_eq!(title, "The query result cannot be downloaded.");
            assert!(detail.ends_with("Increase the sasl_max_buffer value in the server configuration."));
        }
        other => panic!("expected download error, got {other:?}"),
    }

    let err = engine
        .download(&request("CACHED"), ExportFormat::Csv, Vec::new(), &NoopObserver)
        .await
        .unwrap_err();
    let ConduitError::Download { detail, .. } = err else {
        panic!("expected download error");
    };
    assert!(detail.contains("Please execute the query again."));
    assert!(!detail.contains("Restarting the fetch"));
    assert!(engine.cache().is_empty());
}
