use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::join::buffer::CompletenessRule;
use crate::source::tailer::DEFAULT_READ_CHUNK_SIZE;

/// Top-level configuration for the loadjoin reader.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Worker snapshot source configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Finalized record output configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// How often the source is polled. Default: 1s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Stop polling after this long. Default: run until interrupted.
    #[serde(default, with = "humantime_serde")]
    pub run_duration: Option<Duration>,

    /// Finalize every still-buffered second on shutdown, complete or not.
    /// Default: true.
    #[serde(default = "default_true")]
    pub final_flush: bool,
}

/// Which reader consumes the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Several workers append to one shared stream; seconds are joined.
    #[default]
    Join,
    /// A single process writes the stream.
    Local,
}

/// Worker snapshot source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Line-delimited JSON file the workers append to.
    #[serde(default)]
    pub path: PathBuf,

    /// Reader selection. Default: join.
    #[serde(default)]
    pub mode: SourceMode,

    /// Number of workers expected to report every second (join mode).
    #[serde(default)]
    pub expected_workers: usize,

    /// Maximum bytes consumed per poll. Default: 1MiB.
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,

    /// When a second counts as complete. Default: distinct_workers.
    #[serde(default)]
    pub completeness: CompletenessRule,
}

/// Finalized record output configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct OutputConfig {
    /// JSON-lines file receiving one object per finalized second.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Empty disables the server. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_read_chunk_size() -> usize {
    DEFAULT_READ_CHUNK_SIZE
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            source: SourceConfig::default(),
            output: OutputConfig::default(),
            health: HealthConfig::default(),
            poll_interval: default_poll_interval(),
            run_duration: None,
            final_flush: true,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            mode: SourceMode::default(),
            expected_workers: 0,
            read_chunk_size: default_read_chunk_size(),
            completeness: CompletenessRule::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
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
        if self.source.path.as_os_str().is_empty() {
            bail!("source.path is required");
        }

        if self.source.mode == SourceMode::Join && self.source.expected_workers == 0 {
            bail!("source.expected_workers must be positive in join mode");
        }

        if self.source.read_chunk_size == 0 {
            bail!("source.read_chunk_size must be positive");
        }

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be positive");
        }

        if self.run_duration.is_some_and(|d| d.is_zero()) {
            bail!("run_duration must be positive when set");
        }

        if let Some(output) = &self.output.path {
            if output == &self.source.path {
                bail!("output.path must differ from source.path");
            }
        }

        Ok(())
    }
}
