//! Multi-worker join engine.
//!
//! Each poll reads one capped increment of the shared snapshot stream,
//! decodes its complete lines, indexes them by second and worker, and
//! finalizes every second the completeness rule releases.

pub mod aggregate;
pub mod buffer;
pub mod merge;
pub mod record;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::provider::ResultsProvider;
use crate::source::read_snapshots;
use crate::source::snapshot::Timestamp;
use crate::source::stats::{IngestCounter, IngestStats};
use crate::source::tailer::Tailer;

use self::buffer::{CompletenessRule, JoinBuffer};
use self::merge::{merge, Contributions};
use self::record::FinalizedRecord;

/// Joins snapshots written by `expected_workers` workers into one ordered
/// stream of finalized per-second records.
pub struct JoinReader {
    tailer: Tailer,
    buffer: JoinBuffer,
    expected_workers: usize,
    stats: Arc<IngestStats>,
}

impl JoinReader {
    /// Creates a reader over `path`. The file does not need to exist yet.
    pub fn new(
        path: impl Into<PathBuf>,
        expected_workers: usize,
        rule: CompletenessRule,
        read_chunk_size: usize,
    ) -> Self {
        let tailer = Tailer::new(path, read_chunk_size);

        info!(
            path = %tailer.path().display(),
            expected_workers,
            ?rule,
            "join reader created",
        );

        Self {
            tailer,
            buffer: JoinBuffer::new(rule),
            expected_workers: expected_workers.max(1),
            stats: Arc::new(IngestStats::new()),
        }
    }

    /// Creates a reader from the `source` configuration section.
    pub fn from_config(cfg: &SourceConfig) -> Self {
        Self::new(
            &cfg.path,
            cfg.expected_workers,
            cfg.completeness,
            cfg.read_chunk_size,
        )
    }

    pub fn expected_workers(&self) -> usize {
        self.expected_workers
    }

    /// Greatest second handed downstream so far.
    pub fn last_emitted(&self) -> Option<Timestamp> {
        self.buffer.watermark()
    }

    fn finalize(&self, drained: Vec<(Timestamp, Contributions)>) -> Vec<FinalizedRecord> {
        let records: Vec<FinalizedRecord> = drained
            .into_iter()
            .map(|(ts, contributions)| {
                if contributions.len() < self.expected_workers {
                    debug!(
                        timestamp = ts,
                        contributors = contributions.len(),
                        expected = self.expected_workers,
                        "finalizing incomplete second",
                    );
                }
                merge(ts, &contributions)
            })
            .collect();

        self.stats
            .record_n(IngestCounter::RecordsEmitted, records.len() as u64);

        records
    }
}

/// Reads one increment from `tailer` into `buffer`.
pub(crate) fn fill_buffer(
    tailer: &mut Tailer,
    buffer: &mut JoinBuffer,
    stats: &IngestStats,
) -> Result<()> {
    for snapshot in read_snapshots(tailer, stats)? {
        let outcome = buffer.ingest(snapshot);
        stats.record_n(IngestCounter::LateContributions, outcome.late as u64);
    }
    Ok(())
}

/// Reads increments until the source has nothing more to give.
pub(crate) fn fill_buffer_to_end(
    tailer: &mut Tailer,
    buffer: &mut JoinBuffer,
    stats: &IngestStats,
) -> Result<()> {
    loop {
        let before = tailer.offset();
        fill_buffer(tailer, buffer, stats)?;
        if tailer.offset() == before {
            return Ok(());
        }
    }
}

impl ResultsProvider for JoinReader {
    fn name(&self) -> &str {
        "join"
    }

    fn poll(&mut self) -> Result<Vec<FinalizedRecord>> {
        fill_buffer(&mut self.tailer, &mut self.buffer, &self.stats)?;
        let drained = self.buffer.drain_ready(self.expected_workers);
        Ok(self.finalize(drained))
    }

    fn finish(&mut self) -> Result<Vec<FinalizedRecord>> {
        fill_buffer_to_end(&mut self.tailer, &mut self.buffer, &self.stats)?;

        if !self.tailer.pending_fragment().is_empty() {
            warn!(
                path = %self.tailer.path().display(),
                bytes = self.tailer.pending_fragment().len(),
                "discarding unterminated trailing line",
            );
        }
        self.tailer.close();

        let drained = self.buffer.drain_all();
        if !drained.is_empty() {
            info!(seconds = drained.len(), "flushing buffered seconds");
        }
        Ok(self.finalize(drained))
    }

    fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn line(worker: &str, users: u64, secs: &[(Timestamp, u64)]) -> String {
        let per_sec: Vec<String> = secs
            .iter()
            .map(|(ts, n)| format!("\"{ts}\":{n}"))
            .collect();
        format!(
            "{{\"client_id\":\"{worker}\",\"user_count\":{users},\"stats\":[{{\"name\":\"/a\",\"num_reqs_per_sec\":{{{}}},\"num_requests\":10,\"total_response_time\":100}}]}}\n",
            per_sec.join(",")
        )
    }

    #[test]
    fn test_poll_drag_along() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("workers.ldjson");
        let mut reader = JoinReader::new(&path, 2, CompletenessRule::DistinctWorkers, 1024);

        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(line("a", 3, &[(100, 5), (101, 6)]).as_bytes())
            .expect("write");
        assert!(reader.poll().expect("poll").is_empty());
        assert_eq!(reader.buffered(), 2);

        file.write_all(line("b", 4, &[(101, 7)]).as_bytes())
            .expect("write");
        let records = reader.poll().expect("poll");
        let ts: Vec<Timestamp> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(ts, vec![100, 101]);
        assert_eq!(records[0].sample_count(), 5);
        assert_eq!(records[0].overall().expect("overall").concurrency, 3);
        assert_eq!(records[1].sample_count(), 13);
        assert_eq!(records[1].overall().expect("overall").concurrency, 7);
        assert_eq!(reader.last_emitted(), Some(101));
    }

    #[test]
    fn test_finish_flushes_open_seconds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("workers.ldjson");
        std::fs::write(&path, line("a", 1, &[(100, 1), (101, 2)])).expect("write");

        let mut reader = JoinReader::new(&path, 3, CompletenessRule::DistinctWorkers, 1024);
        assert!(reader.poll().expect("poll").is_empty());

        let records = reader.finish().expect("finish");
        assert_eq!(records.len(), 2);
        assert_eq!(reader.buffered(), 0);
        assert_eq!(reader.stats().get(IngestCounter::RecordsEmitted), 2);
    }

    #[test]
    fn test_finish_reads_past_chunk_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("workers.ldjson");
        let mut data = String::new();
        for ts in 100..110 {
            data.push_str(&line("a", 1, &[(ts, 1)]));
        }
        std::fs::write(&path, data).expect("write");

        let mut reader = JoinReader::new(&path, 2, CompletenessRule::DistinctWorkers, 64);
        let records = reader.finish().expect("finish");
        assert_eq!(records.len(), 10);
    }

    #[test]
    fn test_late_contribution_counted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("workers.ldjson");
        let mut data = line("a", 1, &[(100, 1)]);
        data.push_str(&line("b", 1, &[(100, 1)]));
        std::fs::write(&path, &data).expect("write");

        let mut reader = JoinReader::new(&path, 2, CompletenessRule::DistinctWorkers, 1024);
        assert_eq!(reader.poll().expect("poll").len(), 1);

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open");
        file.write_all(line("c", 1, &[(100, 1)]).as_bytes())
            .expect("write");

        assert!(reader.poll().expect("poll").is_empty());
        assert_eq!(reader.stats().get(IngestCounter::LateContributions), 1);
        assert_eq!(reader.buffered(), 0);
    }
}
