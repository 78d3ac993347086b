use std::collections::BTreeMap;
use std::sync::Arc;

/// Label name of the combined pseudo-label that aggregates every named label.
pub const OVERALL_LABEL: &str = "";

/// Stable worker identity, shared between the snapshot and the join buffer index.
pub type WorkerId = Arc<str>;

/// Epoch seconds.
pub type Timestamp = i64;

/// One decoded report from one worker. Immutable once decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    /// Worker concurrency level (simulated users) at report time.
    pub user_count: u64,
    pub labels: Vec<LabelStats>,
}

/// Per-label statistics carried by a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelStats {
    /// Label name; [`OVERALL_LABEL`] denotes the worker's own combined row.
    pub name: String,
    /// Requests observed per second, keyed by epoch second.
    pub per_second: BTreeMap<Timestamp, u64>,
    /// Cumulative request count since worker start.
    pub num_requests: u64,
    /// Cumulative response time in milliseconds since worker start.
    pub total_response_time_ms: f64,
}

impl LabelStats {
    /// Whether this row is the worker's own combined row.
    pub fn is_overall(&self) -> bool {
        self.name == OVERALL_LABEL
    }

    /// Requests observed during `ts`, if this label reported that second.
    pub fn count_at(&self, ts: Timestamp) -> Option<u64> {
        self.per_second.get(&ts).copied()
    }

    /// Running average response time since worker start, in milliseconds.
    ///
    /// Zero when the worker has not completed any request for this label yet.
    pub fn avg_response_time_ms(&self) -> f64 {
        if self.num_requests == 0 {
            return 0.0;
        }
        self.total_response_time_ms / self.num_requests as f64
    }
}

impl WorkerSnapshot {
    /// Every second reported by any label, ascending and de-duplicated.
    pub fn timestamps(&self) -> impl Iterator<Item = Timestamp> + '_ {
        let mut seen: Vec<Timestamp> = self
            .labels
            .iter()
            .flat_map(|label| label.per_second.keys().copied())
            .collect();
        seen.sort_unstable();
        seen.dedup();
        seen.into_iter()
    }

    /// Whether any label carries a per-second count for `ts`.
    pub fn reports(&self, ts: Timestamp) -> bool {
        self.labels.iter().any(|label| label.per_second.contains_key(&ts))
    }
}
