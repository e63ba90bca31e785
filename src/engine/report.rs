use std::fmt;

use crate::window::Period;

use super::RunPhase;

/// What happened to one snapshot file during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOutcome {
    /// Present locally; not fetched.
    AlreadyCached,
    Fetched,
    FetchFailed,
    /// Decoded and merged into the aggregate.
    Decoded,
    /// Decoding failed; the file contributed nothing.
    DecodeFailed,
    /// Invalid container; the cached copy was deleted.
    Purged,
    /// Invalid container, but deleting the cached copy failed.
    PurgeFailed,
}

impl FileOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyCached => "already_cached",
            Self::Fetched => "fetched",
            Self::FetchFailed => "fetch_failed",
            Self::Decoded => "decoded",
            Self::DecodeFailed => "decode_failed",
            Self::Purged => "purged",
            Self::PurgeFailed => "purge_failed",
        }
    }

    /// True when the file's data is missing from this run's aggregate.
    pub fn is_omission(self) -> bool {
        matches!(
            self,
            Self::FetchFailed | Self::DecodeFailed | Self::Purged | Self::PurgeFailed
        )
    }
}

impl fmt::Display for FileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeRecord {
    pub period: Period,
    pub name: String,
    pub outcome: FileOutcome,
    /// Error text for failed outcomes.
    pub detail: Option<String>,
}

/// A period skipped in one phase because it could not be listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingFailure {
    pub period: Period,
    pub phase: RunPhase,
    pub reason: String,
}

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// Flushed, but some files or periods were skipped.
    SuccessWithOmissions,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::SuccessWithOmissions => "success_with_omissions",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a run did, file by file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub status: RunStatus,
    pub periods: Vec<Period>,
    pub outcomes: Vec<OutcomeRecord>,
    pub listing_failures: Vec<ListingFailure>,
    /// Worker tasks that panicked; the affected file is unknown.
    pub panicked_tasks: usize,
    /// Files never dispatched because the run was cancelled.
    pub undispatched: usize,
    pub rows_written: usize,
    /// Fatal error, set when the status is `Failed`.
    pub error: Option<String>,
}

impl Default for RunReport {
    fn default() -> Self {
        Self {
            status: RunStatus::Success,
            periods: Vec::new(),
            outcomes: Vec::new(),
            listing_failures: Vec::new(),
            panicked_tasks: 0,
            undispatched: 0,
            rows_written: 0,
            error: None,
        }
    }
}

impl RunReport {
    pub fn count(&self, outcome: FileOutcome) -> usize {
        self.outcomes.iter().filter(|r| r.outcome == outcome).count()
    }

    /// Outcomes recorded for one file, in the order they happened.
    pub fn outcomes_for(&self, name: &str) -> Vec<FileOutcome> {
        self.outcomes
            .iter()
            .filter(|r| r.name == name)
            .map(|r| r.outcome)
            .collect()
    }

    /// Files, periods and tasks whose data did not reach the aggregate.
    pub fn omissions(&self) -> usize {
        self.outcomes.iter().filter(|r| r.outcome.is_omission()).count()
            + self.listing_failures.len()
            + self.panicked_tasks
    }

    /// Status of a run that reached the end of its flush.
    pub(crate) fn completed_status(&self) -> RunStatus {
        if self.omissions() == 0 {
            RunStatus::Success
        } else {
            RunStatus::SuccessWithOmissions
        }
    }

    pub(crate) fn fail(mut self, error: String) -> Self {
        self.status = RunStatus::Failed;
        self.error = Some(error);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, outcome: FileOutcome) -> OutcomeRecord {
        OutcomeRecord {
            period: Period::new(2024, 1).expect("period"),
            name: name.to_string(),
            outcome,
            detail: None,
        }
    }

    #[test]
    fn test_omissions_and_completed_status() {
        let mut report = RunReport::default();
        report.outcomes.push(record("a.gz", FileOutcome::Fetched));
        report.outcomes.push(record("a.gz", FileOutcome::Decoded));
        report.outcomes.push(record("b.gz", FileOutcome::AlreadyCached));
        assert_eq!(report.omissions(), 0);
        assert_eq!(report.completed_status(), RunStatus::Success);

        report.outcomes.push(record("c.gz", FileOutcome::Purged));
        report.panicked_tasks = 1;
        assert_eq!(report.omissions(), 2);
        assert_eq!(report.completed_status(), RunStatus::SuccessWithOmissions);
        assert_eq!(report.count(FileOutcome::Purged), 1);
        assert_eq!(
            report.outcomes_for("a.gz"),
            vec![FileOutcome::Fetched, FileOutcome::Decoded]
        );
    }

    #[test]
    fn test_fail_sets_status_and_error() {
        let report = RunReport::default().fail("store down".to_string());
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("store down"));
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(FileOutcome::AlreadyCached.as_str(), "already_cached");
        assert_eq!(FileOutcome::PurgeFailed.to_string(), "purge_failed");
        assert!(!FileOutcome::Decoded.is_omission());
        assert!(FileOutcome::FetchFailed.is_omission());
        assert_eq!(RunStatus::SuccessWithOmissions.to_string(), "success_with_omissions");
    }
}
