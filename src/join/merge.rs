use std::collections::BTreeMap;
use std::sync::Arc;

use crate::source::snapshot::{Timestamp, WorkerId, WorkerSnapshot, OVERALL_LABEL};

use super::aggregate::KpiSet;
use super::record::FinalizedRecord;

/// Snapshots contributing to one second, keyed by worker.
///
/// Ordered by worker so floating-point sums are folded in the same order
/// regardless of arrival order.
pub type Contributions = BTreeMap<WorkerId, Arc<WorkerSnapshot>>;

/// Folds every contribution for `timestamp` into one finalized record.
///
/// Each label reporting a count for the second contributes a [`KpiSet`].
/// The combined pseudo-label is the merge of the worker's named labels; a
/// worker that reported only its own combined row contributes that row
/// instead. Derived statistics are computed once, after all merging.
pub fn merge(timestamp: Timestamp, contributions: &Contributions) -> FinalizedRecord {
    let mut labels: BTreeMap<String, KpiSet> = BTreeMap::new();
    let mut overall = KpiSet::new();

    for snapshot in contributions.values() {
        let worker_overall = worker_point(timestamp, snapshot, &mut labels);
        overall.merge(&worker_overall);
    }

    let mut finalized: BTreeMap<String, _> = labels
        .into_iter()
        .map(|(name, kpi)| (name, kpi.snapshot()))
        .collect();
    finalized.insert(OVERALL_LABEL.to_string(), overall.snapshot());

    FinalizedRecord {
        timestamp,
        labels: finalized,
    }
}

/// Merges one worker's labels for `timestamp` into `labels` and returns the
/// worker's combined contribution.
fn worker_point(
    timestamp: Timestamp,
    snapshot: &WorkerSnapshot,
    labels: &mut BTreeMap<String, KpiSet>,
) -> KpiSet {
    let mut named = KpiSet::new();
    let mut reported_overall: Option<KpiSet> = None;

    for label in &snapshot.labels {
        let Some(samples) = label.count_at(timestamp) else {
            continue;
        };

        let mut kpi = KpiSet::new();
        kpi.record(
            &snapshot.worker_id,
            snapshot.user_count,
            samples,
            label.avg_response_time_ms(),
        );

        if label.is_overall() {
            reported_overall.get_or_insert_with(KpiSet::new).merge(&kpi);
            continue;
        }

        named.merge(&kpi);
        labels.entry(label.name.clone()).or_default().merge(&kpi);
    }

    match reported_overall {
        Some(reported) if named.is_empty() => reported,
        _ => named,
    }
}
