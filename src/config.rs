use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::window::MAX_LOOKBACK_MONTHS;

/// Top-level configuration for bgpwatcher.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Processing window and concurrency.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Local snapshot cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Remote RIS archive.
    #[serde(default)]
    pub ris: RisConfig,

    /// ClickHouse connection configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Prometheus metrics server configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Processing window and concurrency.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Number of months to process, ending at the current month. Default: 3.
    #[serde(default = "default_months")]
    pub months: u32,

    /// Maximum simultaneous fetch or decode tasks. Default: 8.
    #[serde(default = "default_processes")]
    pub processes: usize,
}

/// Local snapshot cache.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Cache root directory. Default: "./cache".
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

/// Remote RIS archive.
#[derive(Debug, Clone, Deserialize)]
pub struct RisConfig {
    /// Archive base URL. Default: "https://data.ris.ripe.net".
    #[serde(default = "default_ris_base_url")]
    pub base_url: String,

    /// Route collector to ingest. Default: "rrc00".
    #[serde(default = "default_ris_collector")]
    pub collector: String,

    /// Only index entries starting with this prefix are ingested. Default: "updates.".
    #[serde(default = "default_ris_file_prefix")]
    pub file_prefix: String,

    /// Per-request timeout, including the body transfer. Default: 5m.
    #[serde(default = "default_ris_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// Target table name. Default: "routes".
    #[serde(default = "default_table")]
    pub table: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Prometheus metrics server configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Listen address, e.g. ":9090". Empty disables the server.
    #[serde(default)]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_months() -> u32 {
    3
}

fn default_processes() -> usize {
    8
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_ris_base_url() -> String {
    "https://data.ris.ripe.net".to_string()
}

fn default_ris_collector() -> String {
    "rrc00".to_string()
}

fn default_ris_file_prefix() -> String {
    "updates.".to_string()
}

fn default_ris_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_database() -> String {
    "default".to_string()
}

fn default_table() -> String {
    "routes".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            history: HistoryConfig::default(),
            cache: CacheConfig::default(),
            ris: RisConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            months: default_months(),
            processes: default_processes(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
        }
    }
}

impl Default for RisConfig {
    fn default() -> Self {
        Self {
            base_url: default_ris_base_url(),
            collector: default_ris_collector(),
            file_prefix: default_ris_file_prefix(),
            timeout: default_ris_timeout(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            table: default_table(),
            username: String::new(),
            password: String::new(),
            migrations: MigrationsConfig::default(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.history.months == 0 {
            bail!("history.months must be positive");
        }

        if self.history.months > MAX_LOOKBACK_MONTHS {
            bail!(
                "history.months must be at most {MAX_LOOKBACK_MONTHS}, got {}",
                self.history.months
            );
        }

        if self.history.processes == 0 {
            bail!("history.processes must be positive");
        }

        if self.cache.dir.as_os_str().is_empty() {
            bail!("cache.dir is required");
        }

        if self.ris.base_url.is_empty() {
            bail!("ris.base_url is required");
        }

        if !self.ris.base_url.starts_with("http://") && !self.ris.base_url.starts_with("https://")
        {
            bail!("ris.base_url must be an http(s) URL: {}", self.ris.base_url);
        }

        if self.ris.collector.is_empty() || self.ris.collector.contains('/') {
            bail!("ris.collector must be a plain collector name (e.g. rrc00)");
        }

        if self.ris.timeout.is_zero() {
            bail!("ris.timeout must be positive");
        }

        if self.clickhouse.endpoint.is_empty() {
            bail!("clickhouse.endpoint is required");
        }

        if !is_identifier(&self.clickhouse.database) {
            bail!(
                "clickhouse.database must be a plain identifier: {}",
                self.clickhouse.database
            );
        }

        if !is_identifier(&self.clickhouse.table) {
            bail!(
                "clickhouse.table must be a plain identifier: {}",
                self.clickhouse.table
            );
        }

        Ok(())
    }
}

/// Names interpolated into SQL must be `[A-Za-z_][A-Za-z0-9_]*`.
fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
