//! Remote snapshot archive access.

pub mod index;

use std::future::Future;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::cache::CacheLayout;
use crate::config::RisConfig;
use crate::window::Period;

/// Errors returned when listing a period's remote snapshots.
#[derive(Error, Debug)]
pub enum ListError {
    #[error("no archive index for {period}")]
    NotFound { period: Period },

    #[error("archive index for {period} unavailable: {reason}")]
    Unavailable { period: Period, reason: String },
}

/// Errors returned when fetching a single snapshot file.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("fetching {name}: {reason}")]
    Network { name: String, reason: String },

    #[error("fetching {name}: timed out")]
    Timeout { name: String },

    #[error("fetching {name}: unexpected status {status}")]
    Status { name: String, status: u16 },

    #[error("storing {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Enumerates snapshot file names published for a period.
pub trait Lister: Send + Sync + 'static {
    fn list_available(
        &self,
        period: Period,
    ) -> impl Future<Output = Result<Vec<String>, ListError>> + Send;
}

/// Downloads one snapshot into the local cache, returning its final path.
///
/// Implementations must only make the file visible at its cache path once
/// it is complete.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        period: Period,
        name: &str,
    ) -> impl Future<Output = Result<PathBuf, FetchError>> + Send;
}

/// HTTP client for the RIPE RIS raw data archive.
pub struct RisArchive {
    http: reqwest::Client,
    base_url: String,
    collector: String,
    file_prefix: String,
    cache: CacheLayout,
}

impl RisArchive {
    pub fn new(cfg: &RisConfig, cache: CacheLayout) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .user_agent(concat!("bgpwatcher/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            collector: cfg.collector.clone(),
            file_prefix: cfg.file_prefix.clone(),
            cache,
        })
    }

    /// `<base>/<collector>/<YYYY.MM>/`
    fn index_url(&self, period: Period) -> String {
        format!(
            "{}/{}/{}/",
            self.base_url,
            self.collector,
            period.archive_dir()
        )
    }

    fn file_url(&self, period: Period, name: &str) -> String {
        format!("{}{name}", self.index_url(period))
    }

    async fn download(&self, period: Period, name: &str) -> Result<PathBuf, FetchError> {
        let url = self.file_url(period, name);
        let mut response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(name, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                name: name.to_string(),
                status: status.as_u16(),
            });
        }

        let io_err = |source| FetchError::Io {
            name: name.to_string(),
            source,
        };

        let partial = self.cache.partial_path(period, name);
        let mut file = tokio::fs::File::create(&partial).await.map_err(io_err)?;

        let mut bytes = 0u64;
        let streamed: Result<(), FetchError> = async {
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| transport_error(name, e))?
            {
                bytes += chunk.len() as u64;
                file.write_all(&chunk).await.map_err(io_err)?;
            }
            file.flush().await.map_err(io_err)?;
            file.sync_all().await.map_err(io_err)
        }
        .await;
        drop(file);

        if let Err(e) = streamed {
            if let Err(rm) = tokio::fs::remove_file(&partial).await {
                tracing::debug!(file = %partial.display(), error = %rm, "Removing partial download");
            }
            return Err(e);
        }

        let path = self.cache.commit(period, name).await.map_err(io_err)?;

        tracing::debug!(period = %period, file = %name, bytes, "Snapshot downloaded");

        Ok(path)
    }
}

impl Lister for RisArchive {
    async fn list_available(&self, period: Period) -> Result<Vec<String>, ListError> {
        let url = self.index_url(period);
        let unavailable = |reason: String| ListError::Unavailable { period, reason };

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ListError::NotFound { period });
        }
        if !status.is_success() {
            return Err(unavailable(format!("unexpected status {status} from {url}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        Ok(index::parse_index(&body, &self.file_prefix))
    }
}

impl Fetcher for RisArchive {
    async fn fetch(&self, period: Period, name: &str) -> Result<PathBuf, FetchError> {
        self.download(period, name).await
    }
}

fn transport_error(name: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            name: name.to_string(),
        }
    } else {
        FetchError::Network {
            name: name.to_string(),
            reason: e.to_string(),
        }
    }
}
