use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::SourceConfig;
use crate::join::buffer::{CompletenessRule, JoinBuffer};
use crate::join::merge::{merge, Contributions};
use crate::join::record::FinalizedRecord;
use crate::join::{fill_buffer, fill_buffer_to_end};
use crate::source::snapshot::Timestamp;
use crate::source::stats::{IngestCounter, IngestStats};
use crate::source::tailer::Tailer;

use super::ResultsProvider;

/// Reader for a stream written by a single load-generating process.
///
/// There is nobody to wait for, so a second is final as soon as a newer
/// second shows up; the newest second may still be filling and stays
/// buffered until then or until [`ResultsProvider::finish`].
pub struct LocalReader {
    tailer: Tailer,
    buffer: JoinBuffer,
    stats: Arc<IngestStats>,
}

impl LocalReader {
    pub fn new(path: impl Into<PathBuf>, read_chunk_size: usize) -> Self {
        let tailer = Tailer::new(path, read_chunk_size);
        info!(path = %tailer.path().display(), "local reader created");

        Self {
            tailer,
            buffer: JoinBuffer::new(CompletenessRule::DistinctWorkers),
            stats: Arc::new(IngestStats::new()),
        }
    }

    pub fn from_config(cfg: &SourceConfig) -> Self {
        Self::new(&cfg.path, cfg.read_chunk_size)
    }

    fn finalize(&self, drained: Vec<(Timestamp, Contributions)>) -> Vec<FinalizedRecord> {
        let records: Vec<FinalizedRecord> = drained
            .into_iter()
            .map(|(ts, contributions)| merge(ts, &contributions))
            .collect();
        self.stats
            .record_n(IngestCounter::RecordsEmitted, records.len() as u64);
        records
    }
}

impl ResultsProvider for LocalReader {
    fn name(&self) -> &str {
        "local"
    }

    fn poll(&mut self) -> Result<Vec<FinalizedRecord>> {
        fill_buffer(&mut self.tailer, &mut self.buffer, &self.stats)?;

        let drained = match self.buffer.newest().and_then(|ts| ts.checked_sub(1)) {
            Some(last) => self.buffer.drain_through(last),
            None => Vec::new(),
        };
        Ok(self.finalize(drained))
    }

    fn finish(&mut self) -> Result<Vec<FinalizedRecord>> {
        fill_buffer_to_end(&mut self.tailer, &mut self.buffer, &self.stats)?;
        self.tailer.close();

        let drained = self.buffer.drain_all();
        Ok(self.finalize(drained))
    }

    fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
