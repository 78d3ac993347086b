pub mod health;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::join::record::{FinalizedRecord, LabelMetrics};

/// One output row per finalized second.
#[derive(Debug, Serialize)]
struct RecordRow<'a> {
    timestamp: i64,
    time: Option<DateTime<Utc>>,
    overall: LabelRow,
    labels: BTreeMap<&'a str, LabelRow>,
}

#[derive(Debug, Serialize)]
struct LabelRow {
    samples: u64,
    concurrency: u64,
    avg_rt_ms: f64,
}

impl From<&LabelMetrics> for LabelRow {
    fn from(m: &LabelMetrics) -> Self {
        Self {
            samples: m.sample_count,
            concurrency: m.concurrency,
            avg_rt_ms: m.avg_rt_ms,
        }
    }
}

impl<'a> From<&'a FinalizedRecord> for RecordRow<'a> {
    fn from(record: &'a FinalizedRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            time: DateTime::from_timestamp(record.timestamp, 0),
            overall: record.overall().map_or(
                LabelRow {
                    samples: 0,
                    concurrency: 0,
                    avg_rt_ms: 0.0,
                },
                LabelRow::from,
            ),
            labels: record
                .named_labels()
                .map(|(name, m)| (name, LabelRow::from(m)))
                .collect(),
        }
    }
}

/// Appends finalized records to a JSON-lines file, one object per second.
pub struct JsonLinesWriter {
    path: PathBuf,
    out: BufWriter<File>,
    written: u64,
}

impl JsonLinesWriter {
    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening output file {}", path.display()))?;

        tracing::info!(path = %path.display(), "record output opened");

        Ok(Self {
            path,
            out: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written since the writer was opened.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Writes `records` and flushes them to the file.
    pub fn write_batch(&mut self, records: &[FinalizedRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        for record in records {
            serde_json::to_writer(&mut self.out, &RecordRow::from(record))
                .context("serializing record")?;
            self.out.write_all(b"\n").context("writing record")?;
        }

        self.out
            .flush()
            .with_context(|| format!("flushing {}", self.path.display()))?;
        self.written += records.len() as u64;

        tracing::debug!(records = records.len(), "records written");

        Ok(())
    }
}
