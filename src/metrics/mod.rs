use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "bgpwatcher";

/// Prometheus metrics for ingestion runs.
///
/// All metrics use the "bgpwatcher" namespace.
pub struct RunMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Snapshot files by outcome (already_cached, fetched, fetch_failed,
    /// decoded, decode_failed, purged, purge_failed).
    pub files: CounterVec,
    /// Period listings that failed, by phase (download, decode).
    pub listing_failures: CounterVec,
    /// Observations merged into the run aggregate.
    pub observations_merged: Counter,
    /// Rows handed to the store in successful bulk writes.
    pub rows_written: Counter,
    /// Failed bulk writes.
    pub write_failures: Counter,
    /// Wall time of the most recent run phase, in seconds.
    pub phase_duration: GaugeVec,
}

impl RunMetrics {
    /// Creates a metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let files = CounterVec::new(
            Opts::new("files_total", "Snapshot files processed, by outcome.").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let listing_failures = CounterVec::new(
            Opts::new(
                "listing_failures_total",
                "Period listings that failed, by phase.",
            )
            .namespace(NAMESPACE),
            &["phase"],
        )?;
        let observations_merged = Counter::with_opts(
            Opts::new(
                "observations_merged_total",
                "Route observations merged into the run aggregate.",
            )
            .namespace(NAMESPACE),
        )?;
        let rows_written = Counter::with_opts(
            Opts::new("rows_written_total", "Rows written to the route store.")
                .namespace(NAMESPACE),
        )?;
        let write_failures = Counter::with_opts(
            Opts::new("write_failures_total", "Failed bulk writes to the route store.")
                .namespace(NAMESPACE),
        )?;
        let phase_duration = GaugeVec::new(
            Opts::new(
                "phase_duration_seconds",
                "Wall time of the most recent run phase.",
            )
            .namespace(NAMESPACE),
            &["phase"],
        )?;

        registry.register(Box::new(files.clone()))?;
        registry.register(Box::new(listing_failures.clone()))?;
        registry.register(Box::new(observations_merged.clone()))?;
        registry.register(Box::new(rows_written.clone()))?;
        registry.register(Box::new(write_failures.clone()))?;
        registry.register(Box::new(phase_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            files,
            listing_failures,
            observations_merged,
            rows_written,
            write_failures,
            phase_duration,
        })
    }

    /// Renders all registered metrics in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // ":port" shorthand binds all interfaces.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}
