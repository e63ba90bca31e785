//! Time-windowed ingestion engine.
//!
//! A run computes the window of periods to process, makes sure every
//! published snapshot of each period is cached locally, decodes the cached
//! snapshots into one aggregate and writes that aggregate to the store in a
//! single bulk write:
//!
//! ```text
//! Idle -> ComputingWindow -> Downloading -> Decoding -> Flushing -> Done
//! ```
//!
//! Per-file failures are recorded in the [`RunReport`] and never stop the
//! run; only a failed bulk write (or invalid options) ends in `Failed`.

pub mod aggregate;
mod decode;
mod dispatch;
mod download;
pub mod flush;
pub mod report;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::cache::CacheLayout;
use crate::config::HistoryConfig;
use crate::metrics::RunMetrics;
use crate::mrt::Decoder;
use crate::ris::{Fetcher, Lister};
use crate::store::RouteStore;
use crate::window::{compute_window, Period, MAX_LOOKBACK_MONTHS};

pub use self::aggregate::{Aggregate, Contributions, ObservationKey};
pub use self::report::{FileOutcome, ListingFailure, OutcomeRecord, RunReport, RunStatus};

/// Parameters of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// The window ends at the period containing this instant.
    pub reference: DateTime<Utc>,
    pub lookback_months: u32,
    /// Maximum fetch or decode tasks in flight within a period.
    pub max_concurrency: usize,
}

impl UpdateOptions {
    pub fn from_config(cfg: &HistoryConfig, reference: DateTime<Utc>) -> Self {
        Self {
            reference,
            lookback_months: cfg.months,
            max_concurrency: cfg.processes,
        }
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    ComputingWindow,
    Downloading,
    Decoding,
    Flushing,
    Done,
    Failed,
    Cancelled,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ComputingWindow => "computing_window",
            Self::Downloading => "downloading",
            Self::Decoding => "decoding",
            Self::Flushing => "flushing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logs phase transitions and records how long each phase took.
struct PhaseTracker<'a> {
    current: RunPhase,
    entered: Instant,
    metrics: Option<&'a RunMetrics>,
}

impl<'a> PhaseTracker<'a> {
    fn new(metrics: Option<&'a RunMetrics>) -> Self {
        Self {
            current: RunPhase::Idle,
            entered: Instant::now(),
            metrics,
        }
    }

    fn enter(&mut self, next: RunPhase) {
        let elapsed = self.entered.elapsed();
        if let Some(metrics) = self.metrics {
            metrics
                .phase_duration
                .with_label_values(&[self.current.as_str()])
                .set(elapsed.as_secs_f64());
        }

        tracing::info!(
            from = %self.current,
            to = %next,
            elapsed_ms = elapsed.as_millis() as u64,
            "Run phase changed"
        );

        self.current = next;
        self.entered = Instant::now();
    }
}

/// Orchestrates runs over injected collaborators.
pub struct Engine<L, F, D, S> {
    lister: Arc<L>,
    fetcher: Arc<F>,
    decoder: Arc<D>,
    store: Arc<S>,
    cache: CacheLayout,
    metrics: Option<Arc<RunMetrics>>,
}

impl<L, F, D, S> Engine<L, F, D, S>
where
    L: Lister,
    F: Fetcher,
    D: Decoder,
    S: RouteStore,
{
    pub fn new(
        lister: Arc<L>,
        fetcher: Arc<F>,
        decoder: Arc<D>,
        store: Arc<S>,
        cache: CacheLayout,
    ) -> Self {
        Self {
            lister,
            fetcher,
            decoder,
            store,
            cache,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs one full update and returns its report.
    ///
    /// Periods are handled oldest first, the download phase completes for
    /// every period before decoding starts. Once `cancel` fires no new work
    /// is dispatched, in-flight tasks finish and the flush is skipped.
    pub async fn update(&self, opts: UpdateOptions, cancel: CancellationToken) -> RunReport {
        let mut report = RunReport::default();
        let mut phases = PhaseTracker::new(self.metrics.as_deref());

        if opts.lookback_months == 0 {
            phases.enter(RunPhase::Failed);
            return report.fail("lookback_months must be positive".to_string());
        }
        if opts.lookback_months > MAX_LOOKBACK_MONTHS {
            phases.enter(RunPhase::Failed);
            return report.fail(format!("lookback_months must be at most {MAX_LOOKBACK_MONTHS}"));
        }
        if opts.max_concurrency == 0 {
            phases.enter(RunPhase::Failed);
            return report.fail("max_concurrency must be positive".to_string());
        }

        phases.enter(RunPhase::ComputingWindow);
        let window = compute_window(opts.reference, opts.lookback_months);
        tracing::info!(
            periods = window.len(),
            first = %window[0],
            last = %window[window.len() - 1],
            max_concurrency = opts.max_concurrency,
            "Processing window computed"
        );
        report.periods = window.clone();

        phases.enter(RunPhase::Downloading);
        for &period in &window {
            if cancel.is_cancelled() {
                break;
            }
            self.ensure_cached(period, opts.max_concurrency, &cancel, &mut report)
                .await;
        }
        if cancel.is_cancelled() {
            return self.cancelled(report, &mut phases);
        }

        phases.enter(RunPhase::Decoding);
        let mut aggregate = Aggregate::new();
        for &period in &window {
            if cancel.is_cancelled() {
                break;
            }
            self.decode_and_merge(
                period,
                opts.max_concurrency,
                &cancel,
                &mut aggregate,
                &mut report,
            )
            .await;
        }
        if cancel.is_cancelled() {
            return self.cancelled(report, &mut phases);
        }

        phases.enter(RunPhase::Flushing);
        let keys = aggregate.len();
        let observations = aggregate.observations();
        match flush::flush(self.store.as_ref(), aggregate).await {
            Ok(rows) => {
                report.rows_written = rows;
                if let Some(metrics) = &self.metrics {
                    metrics.rows_written.inc_by(rows as f64);
                }
                tracing::info!(rows, observations, "Aggregate written");
            }
            Err(e) => {
                tracing::error!(keys, observations, error = %format!("{e:#}"), "Aggregate write failed, run results lost");
                phases.enter(RunPhase::Failed);
                return report.fail(format!("{e:#}"));
            }
        }

        phases.enter(RunPhase::Done);
        report.status = report.completed_status();

        tracing::info!(
            status = %report.status,
            fetched = report.count(FileOutcome::Fetched),
            cached = report.count(FileOutcome::AlreadyCached),
            decoded = report.count(FileOutcome::Decoded),
            purged = report.count(FileOutcome::Purged),
            omissions = report.omissions(),
            "Run finished"
        );

        report
    }

    fn cancelled(&self, mut report: RunReport, phases: &mut PhaseTracker<'_>) -> RunReport {
        phases.enter(RunPhase::Cancelled);
        tracing::warn!(
            undispatched = report.undispatched,
            "Run cancelled, aggregate discarded"
        );
        report.status = RunStatus::Cancelled;
        report
    }

    fn record(
        &self,
        report: &mut RunReport,
        period: Period,
        name: String,
        outcome: FileOutcome,
        detail: Option<String>,
    ) {
        if let Some(metrics) = &self.metrics {
            metrics.files.with_label_values(&[outcome.as_str()]).inc();
        }
        report.outcomes.push(OutcomeRecord {
            period,
            name,
            outcome,
            detail,
        });
    }

    fn record_listing_failure(
        &self,
        report: &mut RunReport,
        period: Period,
        phase: RunPhase,
        reason: String,
    ) {
        tracing::warn!(period = %period, phase = %phase, error = %reason, "Skipping period");
        if let Some(metrics) = &self.metrics {
            metrics
                .listing_failures
                .with_label_values(&[phase.as_str()])
                .inc();
        }
        report.listing_failures.push(ListingFailure {
            period,
            phase,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let cfg = HistoryConfig {
            months: 6,
            processes: 2,
        };
        let reference = Utc::now();
        let opts = UpdateOptions::from_config(&cfg, reference);
        assert_eq!(opts.lookback_months, 6);
        assert_eq!(opts.max_concurrency, 2);
        assert_eq!(opts.reference, reference);
    }

    #[test]
    fn test_phase_labels() {
        assert_eq!(RunPhase::ComputingWindow.to_string(), "computing_window");
        assert_eq!(RunPhase::Downloading.as_str(), "downloading");
    }

    #[test]
    fn test_phase_tracker_records_duration() {
        let metrics = RunMetrics::new("").expect("metrics");
        let mut phases = PhaseTracker::new(Some(&metrics));
        phases.enter(RunPhase::ComputingWindow);
        phases.enter(RunPhase::Downloading);

        assert_eq!(phases.current, RunPhase::Downloading);
        let text = metrics.encode_text().expect("encode");
        assert!(text.contains("bgpwatcher_phase_duration_seconds{phase=\"computing_window\"}"));
    }
}
