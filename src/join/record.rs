use std::collections::BTreeMap;

use serde::Serialize;

use crate::source::snapshot::{Timestamp, OVERALL_LABEL};

/// Finalized statistics for one label in one second.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelMetrics {
    /// Requests completed during the second.
    pub sample_count: u64,
    /// Summed concurrency across contributing workers.
    pub concurrency: u64,
    /// Distinct workers that contributed.
    pub workers: usize,
    /// Weighted response-time sum in milliseconds.
    pub sum_rt_ms: f64,
    /// `sum_rt_ms / sample_count`, zero when there were no samples.
    pub avg_rt_ms: f64,
}

/// The terminal aggregate for one second. Never revisited once emitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalizedRecord {
    pub timestamp: Timestamp,
    /// Per-label metrics, always including [`OVERALL_LABEL`].
    pub labels: BTreeMap<String, LabelMetrics>,
}

impl FinalizedRecord {
    /// Metrics of the combined pseudo-label.
    pub fn overall(&self) -> Option<&LabelMetrics> {
        self.labels.get(OVERALL_LABEL)
    }

    /// Metrics of a named label.
    pub fn label(&self, name: &str) -> Option<&LabelMetrics> {
        self.labels.get(name)
    }

    /// Total requests in the second.
    pub fn sample_count(&self) -> u64 {
        self.overall().map_or(0, |m| m.sample_count)
    }

    /// Named labels, excluding the combined pseudo-label.
    pub fn named_labels(&self) -> impl Iterator<Item = (&str, &LabelMetrics)> {
        self.labels
            .iter()
            .filter(|(name, _)| name.as_str() != OVERALL_LABEL)
            .map(|(name, metrics)| (name.as_str(), metrics))
    }
}
