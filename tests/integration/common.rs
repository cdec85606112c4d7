//! Shared helpers for integration tests.

use std::sync::Arc;

use db_conduit::config::{BackendConfig, Config};
use db_conduit::connection::Principal;
use db_conduit::db::{BackendKind, MockConnector, MockDatabase, MockResult, Row, Value};
use db_conduit::query::{QueryEngine, QueryRequest};

pub const BACKEND: &str = "mock";

/// Rows `1..=n` in a single INT column.
pub fn numbers(n: i32) -> Vec<Row> {
    (1..=n).map(|i| vec![Value::Int(i)]).collect()
}

/// Builds an engine over `db` with a 1ms poll unit.
pub fn engine_with(db: MockDatabase) -> (QueryEngine, Arc<MockDatabase>) {
    let db = Arc::new(db);
    let mut config = Config::default().with_backend(
        BACKEND,
        BackendConfig {
            kind: BackendKind::Mock,
            ..Default::default()
        },
    );
    config.engine.poll_interval_ms = 1;
    config.engine.download_row_limit = 100;
    let engine = QueryEngine::with_connector(config, Arc::new(MockConnector::new(db.clone())));
    (engine, db)
}

/// An engine whose database knows `SELECT n` returning `numbers(rows)`.
pub fn numbers_engine(rows: i32) -> (QueryEngine, Arc<MockDatabase>) {
    engine_with(MockDatabase::new().with_result("SELECT n", MockResult::new(["n"], numbers(rows))))
}

pub fn request(statement: &str) -> QueryRequest {
    QueryRequest::new(BACKEND, statement, Principal::new("alice"))
}
