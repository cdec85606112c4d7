//! SQL backend tests.
//!
//! The sqlite tests run everywhere. The remaining tests need a database:
//! set DATABASE_URL (postgres or mysql) to run them.

use db_conduit::config::{BackendConfig, Config};
use db_conduit::connection::Principal;
use db_conduit::db::{BackendKind, FetchBatch, LogicalType, Value};
use db_conduit::error::ConduitError;
use db_conduit::query::{ExportFormat, NoopObserver, QueryEngine, QueryRequest};

fn engine_for(url: &str) -> QueryEngine {
    let mut config = Config::default().with_backend(
        "sql",
        BackendConfig {
            kind: BackendKind::Sql,
            url: Some(url.to_string()),
            ..Default::default()
        },
    );
    config.engine.fetch_buffer_rows = 4;
    QueryEngine::new(config)
}

fn request(statement: &str) -> QueryRequest {
    QueryRequest::new("sql", statement, Principal::new("tester"))
}

fn counting(n: usize) -> String {
    format!(
        "WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < {n}) \
         SELECT n FROM seq"
    )
}

fn values(batch: &FetchBatch) -> Vec<String> {
    batch.data.iter().map(|row| row[0].to_display_string()).collect()
}

#[tokio::test]
async fn test_sqlite_pages_through_result() {
    let engine = engine_for("sqlite::memory:");
    let handle = engine.execute(&request(&counting(25))).await.unwrap().handle;

    let first = engine.fetch_result(&handle, 10, true).await.unwrap();
    assert_eq!(values(&first), (1..=10).map(|i| i.to_string()).collect::<Vec<_>>());
    assert!(first.has_more);
    assert_eq!(first.meta[0].name, "n");
    assert!(matches!(
        first.meta[0].logical_type,
        LogicalType::Int | LogicalType::BigInt
    ));

    let second = engine.fetch_result(&handle, 10, false).await.unwrap();
    assert_eq!(values(&second), (11..=20).map(|i| i.to_string()).collect::<Vec<_>>());

    let last = engine.fetch_result(&handle, 10, false).await.unwrap();
    assert_eq!(values(&last), (21..=25).map(|i| i.to_string()).collect::<Vec<_>>());
    assert!(!last.has_more);

    assert!(engine.close_statement(&handle).await.unwrap().is_ok());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_sqlite_mixed_types() {
    let engine = engine_for("sqlite::memory:");
    let handle = engine
        .execute(&request("SELECT 1.5 AS ratio, 'x' AS label, NULL AS nothing"))
        .await
        .unwrap()
        .handle;

    let batch = engine.fetch_result(&handle, 5, true).await.unwrap();
    assert_eq!(batch.data.len(), 1);
    assert_eq!(batch.data[0][0], Value::Float(1.5));
    assert_eq!(batch.data[0][1], Value::String("x".into()));
    assert!(batch.data[0][2].is_null());
    assert_eq!(batch.meta[0].logical_type, LogicalType::Float);
    assert_eq!(batch.meta[1].logical_type, LogicalType::String);
    assert_eq!(batch.meta[2].logical_type, LogicalType::String);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_sqlite_query_error() {
    let engine = engine_for("sqlite::memory:");
    let err = engine
        .execute(&request("SELECT * FROM no_such_table"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConduitError::Query(ref m) if m.contains("no_such_table")));
    assert!(engine.cache().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_sqlite_download() {
    let engine = engine_for("sqlite::memory:");
    let mut out = Vec::new();
    let marker = engine
        .download(&request(&counting(7)), ExportFormat::Csv, &mut out, &NoopObserver)
        .await
        .unwrap();

    let text = String::from_utf8(out).unwrap();
    assert_eq!(text, "n\n1\n2\n3\n4\n5\n6\n7\n");
    assert_eq!(marker.value.row_counter, 7);
    assert!(!marker.value.truncated);
    assert!(engine.cache().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_database_url_select() {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let engine = engine_for(&url);

    let handle = engine
        .execute(&request("SELECT 1 AS num, 'hello' AS greeting"))
        .await
        .unwrap()
        .handle;
    let batch = engine.fetch_result(&handle, 5, true).await.unwrap();

    assert_eq!(batch.headers(), vec!["num", "greeting"]);
    assert_eq!(values(&batch), vec!["1"]);
    assert_eq!(batch.data[0][1], Value::String("hello".into()));
    assert!(!batch.has_more);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_database_url_bad_credentials() {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let Ok(mut parsed) = url::Url::parse(&url) else {
        return;
    };
    if parsed.set_password(Some("definitely-wrong")).is_err() {
        return;
    }
    let engine = engine_for(parsed.as_str());

    let err = engine.execute(&request("SELECT 1")).await.unwrap_err();
    assert!(matches!(err, ConduitError::AuthenticationRequired(_)));
    assert!(engine.registry().is_empty());
}
