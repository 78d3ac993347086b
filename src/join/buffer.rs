use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::source::snapshot::{Timestamp, WorkerSnapshot};

use super::merge::Contributions;

/// Rule deciding when a buffered second is complete enough to finalize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletenessRule {
    /// Closed once `expected_workers` distinct workers contributed.
    #[default]
    DistinctWorkers,
    /// Closed once the canonical decimal width of the parsed timestamp
    /// reaches `expected_workers`, whatever the contributors. Keys are
    /// normalized at decode time, so `"0100"` and `" 100"` both measure as
    /// `100`. With epoch seconds it closes every second immediately for up
    /// to ten workers and never for more.
    TimestampWidth,
}

impl CompletenessRule {
    fn is_closed(self, ts: Timestamp, contributors: usize, expected_workers: usize) -> bool {
        match self {
            Self::DistinctWorkers => contributors >= expected_workers,
            Self::TimestampWidth => ts.to_string().len() >= expected_workers,
        }
    }
}

/// Result of ingesting one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Seconds the snapshot was recorded under.
    pub accepted: usize,
    /// Seconds dropped because they were already finalized.
    pub late: usize,
}

/// Join buffer indexing pending contributions by second, then by worker.
///
/// Entries are created on first contribution and removed exactly once, by a
/// drain. Once a second has been drained the watermark moves past it and
/// later contributions for it or anything older are rejected, which keeps
/// drained seconds strictly increasing for the life of the buffer.
#[derive(Debug, Default)]
pub struct JoinBuffer {
    entries: BTreeMap<Timestamp, Contributions>,
    watermark: Option<Timestamp>,
    rule: CompletenessRule,
}

impl JoinBuffer {
    pub fn new(rule: CompletenessRule) -> Self {
        Self {
            entries: BTreeMap::new(),
            watermark: None,
            rule,
        }
    }

    /// Records `snapshot` under every second any of its labels reports.
    ///
    /// A newer snapshot from the same worker replaces the older one for the
    /// seconds it reports.
    pub fn ingest(&mut self, snapshot: Arc<WorkerSnapshot>) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();

        for ts in snapshot.timestamps() {
            if self.watermark.is_some_and(|w| ts <= w) {
                debug!(
                    timestamp = ts,
                    worker = %snapshot.worker_id,
                    "dropping contribution for finalized second",
                );
                outcome.late += 1;
                continue;
            }

            self.entries
                .entry(ts)
                .or_default()
                .insert(snapshot.worker_id.clone(), Arc::clone(&snapshot));
            outcome.accepted += 1;
        }

        outcome
    }

    /// Greatest buffered second that satisfies the completeness rule.
    pub fn max_closed(&self, expected_workers: usize) -> Option<Timestamp> {
        self.entries
            .iter()
            .rev()
            .find(|(ts, workers)| self.rule.is_closed(**ts, workers.len(), expected_workers))
            .map(|(&ts, _)| ts)
    }

    /// Removes and returns, ascending, every second up to the greatest closed
    /// one. Seconds below it are dragged along even if incomplete, so a
    /// worker that skipped a second cannot stall the stream.
    pub fn drain_ready(&mut self, expected_workers: usize) -> Vec<(Timestamp, Contributions)> {
        match self.max_closed(expected_workers) {
            Some(max_closed) => self.drain_through(max_closed),
            None => Vec::new(),
        }
    }

    /// Removes and returns every buffered second regardless of completeness.
    pub fn drain_all(&mut self) -> Vec<(Timestamp, Contributions)> {
        match self.newest() {
            Some(last) => self.drain_through(last),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Greatest second drained so far.
    pub fn watermark(&self) -> Option<Timestamp> {
        self.watermark
    }

    /// Newest buffered second.
    pub fn newest(&self) -> Option<Timestamp> {
        self.entries.keys().next_back().copied()
    }

    /// Removes and returns, ascending, every buffered second up to and
    /// including `last`.
    pub fn drain_through(&mut self, last: Timestamp) -> Vec<(Timestamp, Contributions)> {
        let rest = match last.checked_add(1) {
            Some(next) => self.entries.split_off(&next),
            None => BTreeMap::new(),
        };
        let drained = std::mem::replace(&mut self.entries, rest);

        if let Some(&newest_drained) = drained.keys().next_back() {
            self.watermark = Some(newest_drained);
        }

        drained.into_iter().collect()
    }

    /// Distinct workers buffered for `ts`.
    pub fn contributors(&self, ts: Timestamp) -> usize {
        self.entries.get(&ts).map_or(0, BTreeMap::len)
    }
}
