use anyhow::{Context, Result};

use crate::store::RouteStore;

use super::aggregate::Aggregate;

/// Flattens the run aggregate and hands it to `store` in exactly one
/// `bulk_write`. Returns the number of rows written.
pub async fn flush<S: RouteStore>(store: &S, aggregate: Aggregate) -> Result<usize> {
    let rows = aggregate.into_rows();
    let count = rows.len();

    store
        .bulk_write(rows)
        .await
        .with_context(|| format!("writing {count} aggregated rows"))?;

    Ok(count)
}
