//! Local snapshot cache.
//!
//! Files live at `<root>/<year>/<month>/<name>`. A file is eligible for fetch
//! whenever it is missing, whether it was never downloaded or was purged after
//! failing to decode. Downloads are written to `<name>.part` and renamed into
//! place once complete, so an interrupted fetch is never mistaken for a cached
//! copy.

use std::io;
use std::path::PathBuf;

use crate::window::Period;

/// Suffix of in-progress downloads.
pub const PARTIAL_SUFFIX: &str = ".part";

/// A snapshot file believed present on local storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub period: Period,
    pub name: String,
    pub path: PathBuf,
}

/// Directory layout and idempotency checks for the snapshot cache.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the snapshots of one period.
    pub fn period_dir(&self, period: Period) -> PathBuf {
        self.root
            .join(period.year.to_string())
            .join(period.month.to_string())
    }

    pub fn file_path(&self, period: Period, name: &str) -> PathBuf {
        self.period_dir(period).join(name)
    }

    pub fn partial_path(&self, period: Period, name: &str) -> PathBuf {
        self.period_dir(period)
            .join(format!("{name}{PARTIAL_SUFFIX}"))
    }

    /// Creates the period directory if needed.
    pub async fn prepare(&self, period: Period) -> io::Result<PathBuf> {
        let dir = self.period_dir(period);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Cache gate: true only when a complete, non-empty copy is present.
    pub async fn is_cached(&self, period: Period, name: &str) -> bool {
        if !is_valid_name(name) {
            return false;
        }

        match tokio::fs::metadata(self.file_path(period, name)).await {
            Ok(meta) => meta.is_file() && meta.len() > 0,
            Err(_) => false,
        }
    }

    /// Lists cached snapshots for a period, sorted by name.
    ///
    /// A missing period directory yields an empty list.
    pub async fn list(&self, period: Period) -> io::Result<Vec<CachedFile>> {
        let dir = self.period_dir(period);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.ends_with(PARTIAL_SUFFIX) || name.starts_with('.') {
                continue;
            }
            if !entry.file_type().await?.is_file() {
                continue;
            }

            files.push(CachedFile {
                period,
                path: entry.path(),
                name,
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Moves a completed `.part` download into place.
    pub async fn commit(&self, period: Period, name: &str) -> io::Result<PathBuf> {
        let target = self.file_path(period, name);
        tokio::fs::rename(self.partial_path(period, name), &target).await?;
        Ok(target)
    }

    /// Deletes a cached file so the next run fetches it again.
    pub async fn purge(&self, file: &CachedFile) -> io::Result<()> {
        tokio::fs::remove_file(&file.path).await
    }
}

/// Accepts plain file names only; anything that could escape the period
/// directory is rejected.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && !name.ends_with(PARTIAL_SUFFIX)
}
