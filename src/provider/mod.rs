pub mod local;

use std::sync::Arc;

use anyhow::Result;

use crate::config::{SourceConfig, SourceMode};
use crate::join::record::FinalizedRecord;
use crate::join::JoinReader;
use crate::source::stats::IngestStats;

use self::local::LocalReader;

/// A pull-driven source of finalized per-second records.
///
/// Records come out in strictly ascending timestamp order and each second
/// at most once for the life of the provider.
pub trait ResultsProvider: Send {
    /// Returns the provider's name for logging.
    fn name(&self) -> &str;

    /// Runs one bounded ingest step and returns the records it finalized.
    fn poll(&mut self) -> Result<Vec<FinalizedRecord>>;

    /// Reads whatever is left, finalizes every buffered second regardless of
    /// completeness, and releases the source.
    fn finish(&mut self) -> Result<Vec<FinalizedRecord>>;

    /// Ingest counters.
    fn stats(&self) -> &Arc<IngestStats>;

    /// Seconds currently buffered and not yet finalized.
    fn buffered(&self) -> usize;
}

/// Builds the provider selected by `cfg.mode`.
pub fn from_config(cfg: &SourceConfig) -> Box<dyn ResultsProvider> {
    match cfg.mode {
        SourceMode::Join => Box::new(JoinReader::from_config(cfg)),
        SourceMode::Local => Box::new(LocalReader::from_config(cfg)),
    }
}
