use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use bgpwatcher::cache::CacheLayout;
use bgpwatcher::config::Config;
use bgpwatcher::engine::{Engine, RunStatus, UpdateOptions};
use bgpwatcher::metrics::RunMetrics;
use bgpwatcher::migrate::{self, ClickHouseMigrator, Migrator};
use bgpwatcher::mrt::MrtDecoder;
use bgpwatcher::ris::RisArchive;
use bgpwatcher::store::{ClickHouseStore, ClickHouseWriter};

/// Ingests RIPE RIS update archives into per-peer route counts.
#[derive(Parser)]
#[command(name = "bgpwatcher", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Defaults to the config file's `log_level`.
    #[arg(long)]
    log_level: Option<String>,

    /// Shorthand for `--log-level debug`.
    #[arg(short, long)]
    verbose: bool,

    /// Number of months to process, overriding `history.months`.
    #[arg(long)]
    months: Option<u32>,

    /// Maximum concurrent fetch or decode tasks, overriding `history.processes`.
    #[arg(long)]
    processes: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Manage the ClickHouse schema.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum MigrateAction {
    /// Apply all pending migrations.
    Up,
    /// Roll back the most recent migration.
    Down,
    /// Print the current schema version.
    Status,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("bgpwatcher {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .as_deref()
        .context("--config is required (use --help for usage)")?;

    let mut cfg = Config::load(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    if let Some(months) = cli.months {
        cfg.history.months = months;
    }
    if let Some(processes) = cli.processes {
        cfg.history.processes = processes;
    }
    cfg.validate().context("validating command line overrides")?;

    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        cli.log_level.clone().unwrap_or_else(|| cfg.log_level.clone())
    };
    let filter = EnvFilter::try_new(&log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting bgpwatcher",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Migrate { action }) => rt.block_on(migrate_command(cfg, action)),
        _ => rt.block_on(run(cfg)),
    }
}

async fn migrate_command(cfg: Config, action: MigrateAction) -> Result<()> {
    let mut writer = ClickHouseWriter::new(cfg.clickhouse.clone());
    writer.start().await?;

    let pool = writer
        .pool()
        .context("ClickHouse pool not started")?
        .clone();
    let migrator = ClickHouseMigrator::new(pool, &cfg.clickhouse.table);

    let result = match action {
        MigrateAction::Up => migrator.up().await,
        MigrateAction::Down => migrator.down().await,
        MigrateAction::Status => migrator.status().await.map(|(version, dirty)| {
            println!(
                "version: {version} (latest: {}), dirty: {dirty}",
                migrate::latest_version()
            );
        }),
    };

    writer.stop().await?;
    result
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let metrics = if cfg.metrics.addr.is_empty() {
        None
    } else {
        let metrics = Arc::new(RunMetrics::new(&cfg.metrics.addr).context("creating metrics")?);
        metrics
            .start()
            .await
            .context("starting metrics server")?;
        Some(metrics)
    };

    let mut writer = ClickHouseWriter::new(cfg.clickhouse.clone());
    writer.start().await?;

    let pool = writer
        .pool()
        .context("ClickHouse pool not started")?
        .clone();

    if cfg.clickhouse.migrations.enabled {
        ClickHouseMigrator::new(pool.clone(), &cfg.clickhouse.table)
            .up()
            .await
            .context("running migrations")?;
    }

    let cache = CacheLayout::new(&cfg.cache.dir);
    let archive = Arc::new(RisArchive::new(&cfg.ris, cache.clone())?);
    let store = Arc::new(ClickHouseStore::new(
        pool,
        &cfg.clickhouse.database,
        &cfg.clickhouse.table,
        metrics.clone(),
    ));

    let mut engine = Engine::new(
        Arc::clone(&archive),
        archive,
        Arc::new(MrtDecoder::new()),
        store,
        cache,
    );
    if let Some(metrics) = &metrics {
        engine = engine.with_metrics(Arc::clone(metrics));
    }

    tracing::info!(
        collector = %cfg.ris.collector,
        cache_dir = %cfg.cache.dir.display(),
        months = cfg.history.months,
        processes = cfg.history.processes,
        "starting update",
    );

    let report = engine
        .update(UpdateOptions::from_config(&cfg.history, Utc::now()), cancel)
        .await;

    writer.stop().await?;
    if let Some(metrics) = &metrics {
        metrics.stop().await?;
    }

    match report.status {
        RunStatus::Failed => bail!(
            "update failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        ),
        RunStatus::Cancelled => {
            tracing::warn!("update cancelled before flush, nothing written");
        }
        RunStatus::Success | RunStatus::SuccessWithOmissions => {
            tracing::info!(
                status = %report.status,
                rows = report.rows_written,
                omissions = report.omissions(),
                "bgpwatcher finished"
            );
        }
    }

    Ok(())
}

/// Cancels `cancel` on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => Some(sigterm),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to register SIGTERM handler");
                    None
                }
            };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, finishing in-flight work");
            }
            Some(_) = async {
                match sigterm.as_mut() {
                    Some(s) => s.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                tracing::info!("received SIGTERM, finishing in-flight work");
            }
        }

        cancel.cancel();
    });
}
