//! Paginated reads from a cached execution.

use tracing::debug;

use super::cache::CachedExecution;
use crate::db::{ColumnMeta, FetchBatch, Row};
use crate::error::{ConduitError, Result};

/// Reads the next page of at most `rows` rows.
///
/// The first fetch of an execution replays the probe row pulled at execute
/// time: it asks the cursor for one row fewer and puts the probe in front.
/// Later fetches read `rows` rows straight from the cursor. `has_more` is
/// true whenever the page came back full, so the end of the result is only
/// certain once a short page is returned. A zero-row request returns an
/// empty page and leaves the probe for the next fetch.
pub async fn fetch_batch(entry: &CachedExecution, rows: usize) -> Result<FetchBatch> {
    let handle = entry.handle();
    let mut ctx = entry.lock().await?;

    if rows == 0 {
        return Ok(FetchBatch::table(Vec::new(), ctx.columns.clone(), false));
    }

    let (splice, probe) = ctx.begin_fetch();
    let request = if splice { rows - 1 } else { rows };

    let fetched = entry
        .unless_released(ctx.cursor.fetch_many(request))
        .await
        .map_err(ConduitError::reclassify)?;

    let mut data = Vec::with_capacity(fetched.len() + 1);
    data.extend(probe);
    data.extend(fetched);

    if ctx.columns.is_empty() {
        ctx.columns = ctx.cursor.describe();
    }
    assign_types(&mut ctx.columns, &data);

    let has_more = !data.is_empty() && data.len() >= rows;
    debug!(
        "Fetched {} rows for {} (requested {}, probe spliced: {}, has_more: {})",
        data.len(),
        handle,
        rows,
        splice,
        has_more
    );

    Ok(FetchBatch::table(data, ctx.columns.clone(), has_more))
}

/// Re-infers column types from the first row of `data`.
///
/// An empty page leaves the previous types in place.
pub fn assign_types(columns: &mut [ColumnMeta], data: &[Row]) {
    let Some(first) = data.first() else {
        return;
    };
    for (column, value) in columns.iter_mut().zip(first) {
        column.logical_type = value.logical_type();
    }
}
