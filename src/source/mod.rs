//! Reading and decoding the worker snapshot stream.

pub mod parse;
pub mod snapshot;
pub mod stats;
pub mod tailer;

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use self::parse::decode;
use self::snapshot::WorkerSnapshot;
use self::stats::{IngestCounter, IngestStats};
use self::tailer::Tailer;

/// Reads one increment from `tailer` and decodes every complete line in it.
///
/// A line that fails to decode is logged, counted and skipped; the rest of
/// the increment is still returned.
pub fn read_snapshots(tailer: &mut Tailer, stats: &IngestStats) -> Result<Vec<Arc<WorkerSnapshot>>> {
    let lines = tailer.read_lines()?;
    stats.record_n(IngestCounter::LinesRead, lines.len() as u64);

    let dropped = tailer.take_dropped_lines();
    if dropped > 0 {
        stats.record_n(IngestCounter::DecodeErrors, dropped);
        warn!(
            path = %tailer.path().display(),
            dropped,
            "dropping unterminated line over the length cap",
        );
    }

    let mut snapshots = Vec::with_capacity(lines.len());
    for line in lines {
        match decode(&line) {
            Ok(snapshot) => snapshots.push(Arc::new(snapshot)),
            Err(e) => {
                stats.record(IngestCounter::DecodeErrors);
                warn!(
                    path = %tailer.path().display(),
                    error = %e,
                    kind = e.kind(),
                    "skipping undecodable snapshot line",
                );
            }
        }
    }

    Ok(snapshots)
}
