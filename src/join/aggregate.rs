use std::collections::BTreeMap;

use crate::source::snapshot::WorkerId;

use super::record::LabelMetrics;

/// Mergeable per-label accumulator for one second.
///
/// Sample counts and weighted response-time sums add. Concurrency is held
/// per contributing worker and summed only when the record is finalized, so
/// a worker reporting several labels is not counted once per label.
/// `merge` is commutative and associative.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KpiSet {
    sample_count: u64,
    sum_rt_ms: f64,
    concurrency: BTreeMap<WorkerId, u64>,
}

impl KpiSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one worker's contribution for one label and second.
    ///
    /// `avg_rt_ms` is the worker's running average for the label; the
    /// weighted sum approximates the second's total response time.
    pub fn record(&mut self, worker: &WorkerId, user_count: u64, samples: u64, avg_rt_ms: f64) {
        self.sample_count = self.sample_count.saturating_add(samples);
        self.sum_rt_ms += samples as f64 * avg_rt_ms;
        self.add_concurrency(worker, user_count);
    }

    /// Folds `other` into `self`.
    pub fn merge(&mut self, other: &KpiSet) {
        self.sample_count = self.sample_count.saturating_add(other.sample_count);
        self.sum_rt_ms += other.sum_rt_ms;
        for (worker, &users) in &other.concurrency {
            self.add_concurrency(worker, users);
        }
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn sum_rt_ms(&self) -> f64 {
        self.sum_rt_ms
    }

    /// Summed concurrency across distinct contributing workers.
    pub fn concurrency(&self) -> u64 {
        self.concurrency.values().fold(0, |acc, &users| acc.saturating_add(users))
    }

    /// Number of distinct workers that contributed.
    pub fn workers(&self) -> usize {
        self.concurrency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concurrency.is_empty()
    }

    /// Derives the finalized per-label statistics.
    pub fn snapshot(&self) -> LabelMetrics {
        let avg_rt_ms = if self.sample_count == 0 {
            0.0
        } else {
            self.sum_rt_ms / self.sample_count as f64
        };

        LabelMetrics {
            sample_count: self.sample_count,
            concurrency: self.concurrency(),
            workers: self.workers(),
            sum_rt_ms: self.sum_rt_ms,
            avg_rt_ms,
        }
    }

    fn add_concurrency(&mut self, worker: &WorkerId, users: u64) {
        // One snapshot carries one level per worker; max keeps merge order-free.
        let level = self.concurrency.entry(worker.clone()).or_insert(0);
        *level = (*level).max(users);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn worker(id: &str) -> WorkerId {
        Arc::from(id)
    }

    #[test]
    fn test_record_weights_response_time() {
        let mut kpi = KpiSet::new();
        kpi.record(&worker("a"), 10, 4, 25.0);

        assert_eq!(kpi.sample_count(), 4);
        assert_eq!(kpi.sum_rt_ms(), 100.0);
        assert_eq!(kpi.concurrency(), 10);
    }

    #[test]
    fn test_merge_sums_across_workers() {
        let mut a = KpiSet::new();
        a.record(&worker("a"), 10, 4, 25.0);
        let mut b = KpiSet::new();
        b.record(&worker("b"), 5, 6, 10.0);

        a.merge(&b);
        assert_eq!(a.sample_count(), 10);
        assert_eq!(a.sum_rt_ms(), 160.0);
        assert_eq!(a.concurrency(), 15);
        assert_eq!(a.workers(), 2);
    }

    #[test]
    fn test_same_worker_counted_once_for_concurrency() {
        let mut overall = KpiSet::new();
        let mut login = KpiSet::new();
        login.record(&worker("a"), 10, 3, 20.0);
        let mut search = KpiSet::new();
        search.record(&worker("a"), 10, 2, 40.0);

        overall.merge(&login);
        overall.merge(&search);
        assert_eq!(overall.sample_count(), 5);
        assert_eq!(overall.concurrency(), 10);
    }

    #[test]
    fn test_merge_commutative_and_associative() {
        let mut a = KpiSet::new();
        a.record(&worker("a"), 10, 4, 25.0);
        let mut b = KpiSet::new();
        b.record(&worker("b"), 5, 6, 10.0);
        let mut c = KpiSet::new();
        c.record(&worker("c"), 7, 1, 3.0);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);

        let mut ab_c = ab.clone();
        ab_c.merge(&c);
        let mut bc = b.clone();
        bc.merge(&c);
        let mut a_bc = a.clone();
        a_bc.merge(&bc);
        assert_eq!(ab_c, a_bc);
    }

    #[test]
    fn test_merge_saturates_near_max_counts() {
        let half = u64::MAX / 2 + 1;
        let mut a = KpiSet::new();
        a.record(&worker("a"), half, half, 1.0);
        let mut b = KpiSet::new();
        b.record(&worker("b"), half, half, 1.0);

        a.merge(&b);
        assert_eq!(a.sample_count(), u64::MAX);
        assert_eq!(a.concurrency(), u64::MAX);

        a.record(&worker("c"), 1, 1, 1.0);
        assert_eq!(a.sample_count(), u64::MAX);
        assert_eq!(a.snapshot().concurrency, u64::MAX);
    }

    #[test]
    fn test_snapshot_empty_has_zero_average() {
        let snap = KpiSet::new().snapshot();
        assert_eq!(snap.sample_count, 0);
        assert_eq!(snap.avg_rt_ms, 0.0);
        assert_eq!(snap.concurrency, 0);
    }

    #[test]
    fn test_snapshot_average() {
        let mut kpi = KpiSet::new();
        kpi.record(&worker("a"), 1, 2, 30.0);
        kpi.record(&worker("b"), 1, 2, 10.0);
        let snap = kpi.snapshot();
        assert_eq!(snap.avg_rt_ms, 20.0);
        assert_eq!(snap.workers, 2);
    }
}
