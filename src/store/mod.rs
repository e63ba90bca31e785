//! Durable storage for aggregated route observations.

pub mod clickhouse;

use std::future::Future;

pub use self::clickhouse::{ClickHouseStore, ClickHouseWriter};

/// One flattened aggregate entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRow {
    pub peer_as: u32,
    pub route: String,
    pub count: u64,
}

/// Bulk sink for a run's aggregate.
///
/// `bulk_write` is all-or-nothing: on error no row of the batch may be
/// visible to readers. An empty batch succeeds without touching storage.
pub trait RouteStore: Send + Sync + 'static {
    fn bulk_write(&self, rows: Vec<RouteRow>) -> impl Future<Output = anyhow::Result<()>> + Send;
}
