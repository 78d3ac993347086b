use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::source::stats::{IngestCounter, IngestStats};

const NAMESPACE: &str = "loadjoin";

/// Prometheus metrics for reader health.
///
/// All metrics use the "loadjoin" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Complete lines handed to the decoder.
    pub lines_read: Counter,
    /// Lines skipped because they failed to decode.
    pub decode_errors: Counter,
    /// Contributions dropped for already finalized seconds.
    pub late_contributions: Counter,
    /// Finalized records handed downstream.
    pub records_emitted: Counter,
    /// Seconds buffered and not yet finalized.
    pub buffered_timestamps: Gauge,
    /// Newest finalized second, as unix epoch seconds.
    pub last_emitted_timestamp: Gauge,
    /// Wall time of one poll across every provider.
    pub poll_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let lines_read = ingest_counter(
            IngestCounter::LinesRead,
            "Total complete lines read from the source.",
        )?;
        let decode_errors = ingest_counter(
            IngestCounter::DecodeErrors,
            "Total source lines skipped because they failed to decode.",
        )?;
        let late_contributions = ingest_counter(
            IngestCounter::LateContributions,
            "Total worker contributions dropped for already finalized seconds.",
        )?;
        let records_emitted = ingest_counter(
            IngestCounter::RecordsEmitted,
            "Total finalized records emitted.",
        )?;
        let buffered_timestamps = Gauge::with_opts(
            Opts::new(
                "buffered_timestamps",
                "Seconds currently buffered and not yet finalized.",
            )
            .namespace(NAMESPACE),
        )?;
        let last_emitted_timestamp = Gauge::with_opts(
            Opts::new(
                "last_emitted_timestamp",
                "Unix timestamp of the newest finalized second.",
            )
            .namespace(NAMESPACE),
        )?;
        let poll_duration = Histogram::with_opts(
            HistogramOpts::new("poll_duration_seconds", "Time to run one poll of the source.")
                .namespace(NAMESPACE)
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        registry.register(Box::new(lines_read.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(late_contributions.clone()))?;
        registry.register(Box::new(records_emitted.clone()))?;
        registry.register(Box::new(buffered_timestamps.clone()))?;
        registry.register(Box::new(last_emitted_timestamp.clone()))?;
        registry.register(Box::new(poll_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            lines_read,
            decode_errors,
            late_contributions,
            records_emitted,
            buffered_timestamps,
            last_emitted_timestamp,
            poll_duration,
        })
    }

    /// Moves the increments recorded in `stats` since the last call into the
    /// exported counters.
    pub fn observe(&self, stats: &IngestStats) {
        for (counter, value) in stats.snapshot() {
            let metric = match counter {
                IngestCounter::LinesRead => &self.lines_read,
                IngestCounter::DecodeErrors => &self.decode_errors,
                IngestCounter::LateContributions => &self.late_contributions,
                IngestCounter::RecordsEmitted => &self.records_emitted,
            };
            metric.inc_by(value as f64);
            tracing::trace!(counter = counter.as_str(), value, "ingest counter observed");
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
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
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Counter named after the ingest counter it mirrors.
fn ingest_counter(counter: IngestCounter, help: &str) -> prometheus::Result<Counter> {
    Counter::with_opts(Opts::new(format!("{}_total", counter.as_str()), help).namespace(NAMESPACE))
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
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

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
