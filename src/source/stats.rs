use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by the ingest path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IngestCounter {
    /// Complete lines handed to the decoder.
    LinesRead = 0,
    /// Lines skipped because they failed to decode.
    DecodeErrors = 1,
    /// Contributions dropped because their second was already finalized.
    LateContributions = 2,
    /// Finalized records handed downstream.
    RecordsEmitted = 3,
}

const COUNTER_CARDINALITY: usize = 4;

impl IngestCounter {
    pub const ALL: [IngestCounter; COUNTER_CARDINALITY] = [
        Self::LinesRead,
        Self::DecodeErrors,
        Self::LateContributions,
        Self::RecordsEmitted,
    ];

    /// Returns the canonical string representation for logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LinesRead => "lines_read",
            Self::DecodeErrors => "decode_errors",
            Self::LateContributions => "late_contributions",
            Self::RecordsEmitted => "records_emitted",
        }
    }
}

/// Lock-free ingest counters.
///
/// `snapshot()` reads and resets, for periodic export into health metrics.
/// `get()` reads lifetime totals without resetting them.
pub struct IngestStats {
    pending: [AtomicU64; COUNTER_CARDINALITY],
    totals: [AtomicU64; COUNTER_CARDINALITY],
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            pending: std::array::from_fn(|_| AtomicU64::new(0)),
            totals: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment a counter by one.
    pub fn record(&self, counter: IngestCounter) {
        self.record_n(counter, 1);
    }

    /// Increment a counter by n.
    pub fn record_n(&self, counter: IngestCounter, n: u64) {
        if n == 0 {
            return;
        }
        let idx = counter as usize;
        if let (Some(pending), Some(total)) = (self.pending.get(idx), self.totals.get(idx)) {
            pending.fetch_add(n, Ordering::Relaxed);
            total.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Lifetime total of a counter.
    pub fn get(&self, counter: IngestCounter) -> u64 {
        self.totals
            .get(counter as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Atomically read and reset the increments since the previous snapshot,
    /// returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(IngestCounter, u64)> {
        let mut result = Vec::new();

        for counter in IngestCounter::ALL {
            if let Some(pending) = self.pending.get(counter as usize) {
                let v = pending.swap(0, Ordering::Relaxed);
                if v > 0 {
                    result.push((counter, v));
                }
            }
        }

        result
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = IngestStats::new();
        stats.record(IngestCounter::LinesRead);
        stats.record(IngestCounter::LinesRead);
        stats.record(IngestCounter::DecodeErrors);

        let snap = stats.snapshot();
        assert_eq!(snap.len(), 2);

        let lines = snap
            .iter()
            .find(|(c, _)| *c == IngestCounter::LinesRead)
            .map(|(_, v)| *v);
        assert_eq!(lines, Some(2));
    }

    #[test]
    fn test_snapshot_resets_but_totals_remain() {
        let stats = IngestStats::new();
        stats.record_n(IngestCounter::RecordsEmitted, 6);

        assert_eq!(stats.snapshot().len(), 1);
        assert!(stats.snapshot().is_empty());
        assert_eq!(stats.get(IngestCounter::RecordsEmitted), 6);
    }

    #[test]
    fn test_record_zero_is_noop() {
        let stats = IngestStats::new();
        stats.record_n(IngestCounter::LateContributions, 0);
        assert!(stats.snapshot().is_empty());
        assert_eq!(stats.get(IngestCounter::LateContributions), 0);
    }
}
