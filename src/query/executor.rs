//! Statement submission.
//!
//! Resolves the principal's connection, opens a cursor, submits the
//! rewritten statement and peeks the first row so column metadata is warm
//! before the first page is requested.

use std::time::Instant;

use tracing::{debug, info, warn};

use super::cache::ExecutionContext;
use super::QueryRequest;
use crate::config::Config;
use crate::connection::{ConnectionKey, ConnectionRegistry};
use crate::db::{Cursor, Row, Submission};
use crate::error::{ConduitError, Result};

/// Runs `request` and returns a context ready to be cached.
///
/// Backend failures are reclassified; an authentication failure while
/// executing also evicts the cached connection so the next attempt
/// reconnects with fresh credentials.
pub async fn execute_statement(
    config: &Config,
    registry: &ConnectionRegistry,
    request: &QueryRequest,
) -> Result<ExecutionContext> {
    let backend = config.backend(&request.backend)?;
    let key = ConnectionKey::new(&request.principal.username, &request.backend);
    let connection = registry
        .get_or_create(&key, backend, &request.principal)
        .await?;

    let statement = connection.prepare_statement(&request.statement);
    debug!("Submitting statement for {}: {}", key, statement);

    let start = Instant::now();
    let mut cursor = connection
        .open_cursor()
        .await
        .map_err(ConduitError::reclassify)?;

    let submitted = submit(cursor.as_mut(), &statement).await;
    let (submission, probe) = match submitted {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Err(close_err) = cursor.close().await {
                warn!("Failed to close cursor after error: {}", close_err);
            }
            if matches!(e, ConduitError::AuthenticationRequired(_)) {
                registry.evict(&key).await;
            }
            return Err(e);
        }
    };

    let mut context = ExecutionContext::new(key, connection, cursor, submission);
    if let Some(probe) = probe {
        context.set_probe(probe);
    }
    context.columns = context.cursor.describe();

    info!(
        "Executed statement for {} in {:?} ({} columns, {:?})",
        context.key,
        start.elapsed(),
        context.columns.len(),
        submission
    );
    Ok(context)
}

/// Submits the statement and, for finished submissions, pulls the probe row.
///
/// Pending submissions are not probed: the rows do not exist yet, and the
/// first fetch after polling reads straight from the cursor.
async fn submit(
    cursor: &mut dyn Cursor,
    statement: &str,
) -> Result<(Submission, Option<Option<Row>>)> {
    let submission = cursor
        .execute(statement)
        .await
        .map_err(ConduitError::reclassify)?;

    let probe = match submission {
        Submission::Finished => Some(cursor.fetch_one().await.map_err(ConduitError::reclassify)?),
        Submission::Pending => None,
    };
    Ok((submission, probe))
}
