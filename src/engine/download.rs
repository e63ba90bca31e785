use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cache::is_valid_name;
use crate::mrt::Decoder;
use crate::ris::{FetchError, Fetcher, Lister};
use crate::store::RouteStore;
use crate::window::Period;

use super::dispatch::run_bounded;
use super::report::{FileOutcome, RunReport};
use super::{Engine, RunPhase};

type FetchResult = (String, Result<PathBuf, FetchError>);

impl<L, F, D, S> Engine<L, F, D, S>
where
    L: Lister,
    F: Fetcher,
    D: Decoder,
    S: RouteStore,
{
    /// Makes sure every snapshot published for `period` is in the local
    /// cache, fetching at most `max_concurrency` files at a time.
    ///
    /// A period that cannot be prepared or listed is skipped. Fetch failures
    /// are recorded per file and never affect siblings. Returns once every
    /// dispatched fetch has finished.
    pub async fn ensure_cached(
        &self,
        period: Period,
        max_concurrency: usize,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) {
        if let Err(e) = self.cache.prepare(period).await {
            self.record_listing_failure(
                report,
                period,
                RunPhase::Downloading,
                format!("preparing cache directory: {e}"),
            );
            return;
        }

        let names = match self.lister.list_available(period).await {
            Ok(names) => names,
            Err(e) => {
                self.record_listing_failure(report, period, RunPhase::Downloading, e.to_string());
                return;
            }
        };

        let listed = names.len();
        let mut missing = Vec::with_capacity(names.len());
        for name in names {
            if !is_valid_name(&name) {
                self.record(
                    report,
                    period,
                    name,
                    FileOutcome::FetchFailed,
                    Some("invalid file name".to_string()),
                );
                continue;
            }

            if self.cache.is_cached(period, &name).await {
                self.record(report, period, name, FileOutcome::AlreadyCached, None);
            } else {
                missing.push(name);
            }
        }

        tracing::info!(
            period = %period,
            listed,
            missing = missing.len(),
            "Fetching missing snapshots"
        );

        let fetcher = &self.fetcher;
        let undispatched = run_bounded(
            missing,
            max_concurrency,
            cancel,
            |set: &mut JoinSet<FetchResult>, name, permit| {
                let fetcher = Arc::clone(fetcher);
                set.spawn(async move {
                    let _permit = permit;
                    let result = fetcher.fetch(period, &name).await;
                    (name, result)
                });
            },
            |joined| match joined {
                Ok((name, Ok(path))) => {
                    tracing::debug!(period = %period, file = %name, path = %path.display(), "Snapshot cached");
                    self.record(report, period, name, FileOutcome::Fetched, None);
                }
                Ok((name, Err(e))) => {
                    tracing::warn!(period = %period, file = %name, error = %e, "Fetch failed");
                    self.record(
                        report,
                        period,
                        name,
                        FileOutcome::FetchFailed,
                        Some(e.to_string()),
                    );
                }
                Err(e) => {
                    tracing::warn!(period = %period, error = %e, "Fetch task panicked");
                    report.panicked_tasks += 1;
                }
            },
        )
        .await;

        report.undispatched += undispatched;
    }
}
