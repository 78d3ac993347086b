use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use loadjoin::config::Config;
use loadjoin::consolidate::Consolidator;
use loadjoin::export::health::HealthMetrics;
use loadjoin::export::JsonLinesWriter;
use loadjoin::join::record::FinalizedRecord;
use loadjoin::provider;

/// Joins per-second worker snapshots into one ordered result stream.
#[derive(Parser)]
#[command(name = "loadjoin", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
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
        println!("loadjoin {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // The CLI flag wins over the config file.
    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting loadjoin",
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let health = if cfg.health.addr.is_empty() {
        None
    } else {
        let health = HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?;
        health.start().await.context("starting health server")?;
        Some(health)
    };

    let mut output = cfg
        .output
        .path
        .as_ref()
        .map(JsonLinesWriter::open)
        .transpose()?;

    let mut consolidator = Consolidator::new();
    consolidator.add_underling(provider::from_config(&cfg.source));

    let deadline = cfg
        .run_duration
        .map(|d| tokio::time::Instant::now() + d);

    let mut ticker = tokio::time::interval(cfg.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep_until(deadline) => {
                tracing::info!("run duration elapsed");
                break;
            }
            _ = ticker.tick() => {
                let started = Instant::now();
                let polled = consolidator.poll();
                if let Some(h) = &health {
                    h.poll_duration.observe(started.elapsed().as_secs_f64());
                }

                match polled {
                    Ok(records) => deliver(&records, output.as_mut(), health.as_ref(), &consolidator),
                    Err(e) => tracing::error!(error = %e, "poll failed"),
                }
            }
        }
    }

    if cfg.final_flush {
        match consolidator.finish() {
            Ok(records) => deliver(&records, output.as_mut(), health.as_ref(), &consolidator),
            Err(e) => tracing::error!(error = %e, "final flush failed"),
        }
    }

    if let Some(h) = &health {
        h.stop();
    }

    tracing::info!(
        records = consolidator.records_seen(),
        "loadjoin stopped",
    );

    consolidator.check_results()?;

    Ok(())
}

/// Hands one batch of records to the output and refreshes health gauges.
fn deliver(
    records: &[FinalizedRecord],
    output: Option<&mut JsonLinesWriter>,
    health: Option<&HealthMetrics>,
    consolidator: &Consolidator,
) {
    for record in records {
        tracing::debug!(
            timestamp = record.timestamp,
            samples = record.sample_count(),
            labels = record.labels.len(),
            "finalized second",
        );
    }

    if let Some(out) = output {
        if let Err(e) = out.write_batch(records) {
            tracing::error!(error = %e, path = %out.path().display(), "writing records");
        }
    }

    if let Some(h) = health {
        let mut buffered = 0usize;
        for underling in consolidator.underlings() {
            h.observe(underling.stats());
            buffered += underling.buffered();
        }
        h.buffered_timestamps.set(buffered as f64);
        if let Some(last) = records.last() {
            h.last_emitted_timestamp.set(last.timestamp as f64);
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(error = %e, "registering SIGTERM handler");
                        let _ = tokio::signal::ctrl_c().await;
                        tracing::info!("received SIGINT, shutting down");
                        cancel.cancel();
                        return;
                    }
                };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received SIGINT, shutting down");
        }

        cancel.cancel();
    });
}
