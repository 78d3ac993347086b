//! Downstream consolidation of finalized records from attached providers.

use std::collections::BTreeMap;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::join::record::{FinalizedRecord, LabelMetrics};
use crate::provider::ResultsProvider;
use crate::source::snapshot::Timestamp;

/// Returned by [`Consolidator::check_results`] when a run produced nothing.
#[derive(Debug, Error)]
#[error("no results were produced by {providers} provider(s); check that workers wrote to the source")]
pub struct EmptyResultError {
    pub providers: usize,
}

/// Running totals for one label across the whole run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CumulativeTotals {
    pub sample_count: u64,
    pub sum_rt_ms: f64,
    /// Concurrency of the most recent second that reported this label.
    pub concurrency: u64,
    pub first_timestamp: Option<Timestamp>,
    pub last_timestamp: Option<Timestamp>,
}

impl CumulativeTotals {
    fn add(&mut self, ts: Timestamp, metrics: &LabelMetrics) {
        self.sample_count = self.sample_count.saturating_add(metrics.sample_count);
        self.sum_rt_ms += metrics.sum_rt_ms;
        self.concurrency = metrics.concurrency;
        self.first_timestamp.get_or_insert(ts);
        self.last_timestamp = Some(ts);
    }

    /// Mean response time over the run, zero when nothing was sampled.
    pub fn avg_rt_ms(&self) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            self.sum_rt_ms / self.sample_count as f64
        }
    }
}

/// Pulls records from its underlings on every tick and keeps run totals.
#[derive(Default)]
pub struct Consolidator {
    underlings: Vec<Box<dyn ResultsProvider>>,
    cumulative: BTreeMap<String, CumulativeTotals>,
    records_seen: u64,
}

impl Consolidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a provider. Its records are included from the next pull on.
    pub fn add_underling(&mut self, provider: Box<dyn ResultsProvider>) {
        info!(provider = provider.name(), "underling attached");
        self.underlings.push(provider);
    }

    pub fn underlings(&self) -> &[Box<dyn ResultsProvider>] {
        &self.underlings
    }

    /// Polls every underling once and returns the new records ordered by
    /// timestamp.
    ///
    /// A failing underling is logged and skipped for this tick; the others
    /// are still pulled. The first error is returned only when every
    /// underling failed.
    pub fn poll(&mut self) -> Result<Vec<FinalizedRecord>> {
        self.pull(|provider| provider.poll())
    }

    /// Finalizes everything still buffered in every underling.
    pub fn finish(&mut self) -> Result<Vec<FinalizedRecord>> {
        self.pull(|provider| provider.finish())
    }

    fn pull<F>(&mut self, mut step: F) -> Result<Vec<FinalizedRecord>>
    where
        F: FnMut(&mut dyn ResultsProvider) -> Result<Vec<FinalizedRecord>>,
    {
        let mut records = Vec::new();
        let mut first_err = None;
        let mut failures = 0usize;

        for provider in &mut self.underlings {
            match step(provider.as_mut()) {
                Ok(batch) => records.extend(batch),
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "underling pull failed");
                    failures += 1;
                    first_err.get_or_insert(e);
                }
            }
        }

        if failures > 0 && failures == self.underlings.len() {
            if let Some(e) = first_err {
                return Err(e);
            }
        }

        // Stable sort keeps underling order for equal timestamps.
        records.sort_by_key(|r| r.timestamp);

        for record in &records {
            self.accumulate(record);
        }

        if !records.is_empty() {
            debug!(records = records.len(), "consolidated records");
        }

        Ok(records)
    }

    fn accumulate(&mut self, record: &FinalizedRecord) {
        self.records_seen += 1;
        for (label, metrics) in &record.labels {
            self.cumulative
                .entry(label.clone())
                .or_default()
                .add(record.timestamp, metrics);
        }
    }

    /// Total records consolidated so far.
    pub fn records_seen(&self) -> u64 {
        self.records_seen
    }

    /// Run totals keyed by label, including the combined pseudo-label.
    pub fn cumulative(&self) -> &BTreeMap<String, CumulativeTotals> {
        &self.cumulative
    }

    /// Errors when no record at all was consolidated during the run.
    pub fn check_results(&self) -> Result<(), EmptyResultError> {
        if self.records_seen == 0 {
            return Err(EmptyResultError {
                providers: self.underlings.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::bail;

    use crate::source::snapshot::OVERALL_LABEL;
    use crate::source::stats::IngestStats;

    use super::*;

    /// Provider replaying a fixed script of poll results.
    struct Scripted {
        name: &'static str,
        polls: Vec<Vec<Timestamp>>,
        fail: bool,
        stats: Arc<IngestStats>,
    }

    impl Scripted {
        fn new(name: &'static str, polls: Vec<Vec<Timestamp>>) -> Self {
            Self {
                name,
                polls,
                fail: false,
                stats: Arc::new(IngestStats::new()),
            }
        }
    }

    fn record(ts: Timestamp, samples: u64, concurrency: u64) -> FinalizedRecord {
        let metrics = LabelMetrics {
            sample_count: samples,
            concurrency,
            workers: 1,
            sum_rt_ms: samples as f64 * 10.0,
            avg_rt_ms: if samples == 0 { 0.0 } else { 10.0 },
        };
        let mut labels = BTreeMap::new();
        labels.insert(OVERALL_LABEL.to_string(), metrics.clone());
        labels.insert("/a".to_string(), metrics);
        FinalizedRecord {
            timestamp: ts,
            labels,
        }
    }

    impl ResultsProvider for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn poll(&mut self) -> Result<Vec<FinalizedRecord>> {
            if self.fail {
                bail!("source unreadable");
            }
            if self.polls.is_empty() {
                return Ok(Vec::new());
            }
            let batch = self.polls.remove(0);
            Ok(batch.into_iter().map(|ts| record(ts, 2, ts as u64 % 7)).collect())
        }

        fn finish(&mut self) -> Result<Vec<FinalizedRecord>> {
            let mut out = Vec::new();
            while !self.polls.is_empty() {
                out.extend(self.poll()?);
            }
            Ok(out)
        }

        fn stats(&self) -> &Arc<IngestStats> {
            &self.stats
        }

        fn buffered(&self) -> usize {
            self.polls.iter().map(Vec::len).sum()
        }
    }

    #[test]
    fn test_empty_run_fails_check() {
        let mut consolidator = Consolidator::new();
        consolidator.add_underling(Box::new(Scripted::new("a", vec![])));

        assert!(consolidator.poll().expect("poll").is_empty());
        let err = consolidator.check_results().expect_err("no records");
        assert_eq!(err.providers, 1);
        assert!(err.to_string().contains("no results"));
    }

    #[test]
    fn test_records_ordered_within_tick() {
        let mut consolidator = Consolidator::new();
        consolidator.add_underling(Box::new(Scripted::new("a", vec![vec![12, 14]])));
        consolidator.add_underling(Box::new(Scripted::new("b", vec![vec![11, 13]])));

        let records = consolidator.poll().expect("poll");
        let ts: Vec<Timestamp> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(ts, vec![11, 12, 13, 14]);
        assert_eq!(consolidator.records_seen(), 4);
        assert!(consolidator.check_results().is_ok());
    }

    #[test]
    fn test_cumulative_totals() {
        let mut consolidator = Consolidator::new();
        consolidator.add_underling(Box::new(Scripted::new(
            "a",
            vec![vec![10, 11], vec![12]],
        )));

        consolidator.poll().expect("poll");
        consolidator.poll().expect("poll");

        let overall = consolidator
            .cumulative()
            .get(OVERALL_LABEL)
            .expect("overall totals");
        assert_eq!(overall.sample_count, 6);
        assert!((overall.sum_rt_ms - 60.0).abs() < 1e-9);
        assert!((overall.avg_rt_ms() - 10.0).abs() < 1e-9);
        assert_eq!(overall.concurrency, 12 % 7);
        assert_eq!(overall.first_timestamp, Some(10));
        assert_eq!(overall.last_timestamp, Some(12));
        assert!(consolidator.cumulative().contains_key("/a"));
    }

    #[test]
    fn test_failing_underling_does_not_block_others() {
        let mut consolidator = Consolidator::new();
        let mut broken = Scripted::new("broken", vec![]);
        broken.fail = true;
        consolidator.add_underling(Box::new(broken));
        consolidator.add_underling(Box::new(Scripted::new("ok", vec![vec![5]])));

        let records = consolidator.poll().expect("partial success");
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_all_underlings_failing_is_error() {
        let mut consolidator = Consolidator::new();
        let mut broken = Scripted::new("broken", vec![]);
        broken.fail = true;
        consolidator.add_underling(Box::new(broken));

        assert!(consolidator.poll().is_err());
    }

    #[test]
    fn test_finish_drains_underlings() {
        let mut consolidator = Consolidator::new();
        consolidator.add_underling(Box::new(Scripted::new(
            "a",
            vec![vec![1], vec![2, 3]],
        )));

        let records = consolidator.finish().expect("finish");
        assert_eq!(records.len(), 3);
        assert_eq!(consolidator.underlings()[0].buffered(), 0);
    }

    #[test]
    fn test_cumulative_count_saturates() {
        let mut totals = CumulativeTotals::default();
        let big = record(1, u64::MAX - 1, 3);
        let overall = big.overall().expect("overall");
        totals.add(1, overall);
        totals.add(2, overall);

        assert_eq!(totals.sample_count, u64::MAX);
        assert_eq!(totals.last_timestamp, Some(2));
    }

    #[test]
    fn test_zero_samples_average_is_zero() {
        let totals = CumulativeTotals::default();
        assert_eq!(totals.avg_rt_ms(), 0.0);
    }
}
