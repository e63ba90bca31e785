use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cache::CachedFile;
use crate::mrt::{DecodeError, Decoder};
use crate::ris::{Fetcher, Lister};
use crate::store::RouteStore;
use crate::window::Period;

use super::aggregate::{Aggregate, Contributions};
use super::dispatch::run_bounded;
use super::report::{FileOutcome, RunReport};
use super::{Engine, RunPhase};

type DecodeResult = (CachedFile, Result<Contributions, DecodeError>);

impl<L, F, D, S> Engine<L, F, D, S>
where
    L: Lister,
    F: Fetcher,
    D: Decoder,
    S: RouteStore,
{
    /// Decodes every cached snapshot of `period` on the blocking pool, at
    /// most `max_concurrency` at a time, and merges the results into
    /// `aggregate`.
    ///
    /// Each task decodes into its own map; only this coordinator writes to
    /// the aggregate. Files with an invalid container are deleted once so
    /// the next run fetches them again.
    pub async fn decode_and_merge(
        &self,
        period: Period,
        max_concurrency: usize,
        cancel: &CancellationToken,
        aggregate: &mut Aggregate,
        report: &mut RunReport,
    ) {
        let files = match self.cache.list(period).await {
            Ok(files) => files,
            Err(e) => {
                self.record_listing_failure(
                    report,
                    period,
                    RunPhase::Decoding,
                    format!("listing cache directory: {e}"),
                );
                return;
            }
        };

        tracing::info!(period = %period, files = files.len(), "Decoding cached snapshots");

        let decoder = &self.decoder;
        let mut malformed = Vec::new();
        let undispatched = run_bounded(
            files,
            max_concurrency,
            cancel,
            |set: &mut JoinSet<DecodeResult>, file: CachedFile, permit| {
                let decoder = Arc::clone(decoder);
                set.spawn_blocking(move || {
                    let _permit = permit;
                    let result = decoder.decode(&file.path);
                    (file, result)
                });
            },
            |joined| match joined {
                Ok((file, Ok(partial))) => {
                    let before = aggregate.observations();
                    aggregate.merge(partial);
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .observations_merged
                            .inc_by(aggregate.observations().saturating_sub(before) as f64);
                    }
                    self.record(report, period, file.name, FileOutcome::Decoded, None);
                }
                Ok((file, Err(e @ DecodeError::MalformedContainer { .. }))) => {
                    tracing::warn!(period = %period, file = %file.name, error = %e, "Invalid snapshot container");
                    malformed.push(file);
                }
                Ok((file, Err(e))) => {
                    tracing::warn!(period = %period, file = %file.name, error = %e, "Decode failed");
                    self.record(
                        report,
                        period,
                        file.name,
                        FileOutcome::DecodeFailed,
                        Some(e.to_string()),
                    );
                }
                Err(e) => {
                    tracing::warn!(period = %period, error = %e, "Decode task panicked");
                    report.panicked_tasks += 1;
                }
            },
        )
        .await;

        report.undispatched += undispatched;

        for file in malformed {
            match self.cache.purge(&file).await {
                Ok(()) => {
                    tracing::info!(period = %period, file = %file.name, "Purged invalid snapshot");
                    self.record(report, period, file.name, FileOutcome::Purged, None);
                }
                Err(e) => {
                    tracing::warn!(period = %period, file = %file.name, error = %e, "Purging invalid snapshot failed");
                    self.record(
                        report,
                        period,
                        file.name,
                        FileOutcome::PurgeFailed,
                        Some(e.to_string()),
                    );
                }
            }
        }
    }
}
