//! Snapshot decoding for the line-delimited worker stream.
//!
//! Each line is one JSON object. The wire shape is deserialized into private
//! `Wire*` structs and converted once into [`WorkerSnapshot`]; nothing past
//! this module sees untyped maps or string timestamps.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use super::snapshot::{LabelStats, Timestamp, WorkerSnapshot};

/// Errors that can occur while decoding a snapshot line.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("snapshot has an empty client_id")]
    MissingWorkerId,

    #[error("label {label:?}: invalid timestamp key {raw:?}")]
    InvalidTimestamp { label: String, raw: String },
}

impl DecodeError {
    /// Short, stable error class for logs and metric labels.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::MissingWorkerId => "missing_worker_id",
            Self::InvalidTimestamp { .. } => "invalid_timestamp",
        }
    }
}

#[derive(Deserialize)]
struct WireSnapshot {
    client_id: String,
    user_count: u64,
    stats: Vec<WireStats>,
}

#[derive(Deserialize)]
struct WireStats {
    name: String,
    num_reqs_per_sec: HashMap<String, u64>,
    num_requests: u64,
    total_response_time: f64,
}

/// Decode one complete line (without its terminator) into a [`WorkerSnapshot`].
pub fn decode(line: &[u8]) -> Result<WorkerSnapshot, DecodeError> {
    let wire: WireSnapshot = serde_json::from_slice(line)?;

    if wire.client_id.is_empty() {
        return Err(DecodeError::MissingWorkerId);
    }

    let labels = wire
        .stats
        .into_iter()
        .map(label_from_wire)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(WorkerSnapshot {
        worker_id: Arc::from(wire.client_id),
        user_count: wire.user_count,
        labels,
    })
}

fn label_from_wire(stats: WireStats) -> Result<LabelStats, DecodeError> {
    let mut per_second = BTreeMap::new();
    for (raw, count) in stats.num_reqs_per_sec {
        let ts: Timestamp = match raw.trim().parse() {
            Ok(ts) => ts,
            Err(_) => {
                return Err(DecodeError::InvalidTimestamp {
                    label: stats.name,
                    raw,
                })
            }
        };
        per_second.insert(ts, count);
    }

    Ok(LabelStats {
        name: stats.name,
        per_second,
        num_requests: stats.num_requests,
        total_response_time_ms: stats.total_response_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{"client_id":"w-1","user_count":10,"stats":[{"name":"/login","num_reqs_per_sec":{"100":3,"101":4},"num_requests":7,"total_response_time":350},{"name":"","num_reqs_per_sec":{"100":3},"num_requests":7,"total_response_time":350.5}]}"#;

    #[test]
    fn test_decode_valid_line() {
        let snap = decode(VALID.as_bytes()).expect("valid line");
        assert_eq!(&*snap.worker_id, "w-1");
        assert_eq!(snap.user_count, 10);
        assert_eq!(snap.labels.len(), 2);

        let login = &snap.labels[0];
        assert_eq!(login.name, "/login");
        assert_eq!(login.count_at(100), Some(3));
        assert_eq!(login.count_at(101), Some(4));
        assert_eq!(login.num_requests, 7);
        assert_eq!(login.total_response_time_ms, 350.0);

        assert!(snap.labels[1].is_overall());
        assert_eq!(snap.labels[1].total_response_time_ms, 350.5);
    }

    #[test]
    fn test_decode_not_json() {
        let err = decode(b"{\"client_id\": \"w-1\", ").expect_err("truncated json");
        assert!(matches!(err, DecodeError::Malformed(_)));
        assert_eq!(err.kind(), "malformed");
    }

    #[test]
    fn test_decode_missing_field() {
        let line = r#"{"client_id":"w-1","stats":[]}"#;
        let err = decode(line.as_bytes()).expect_err("missing user_count");
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_decode_empty_client_id() {
        let line = r#"{"client_id":"","user_count":1,"stats":[]}"#;
        let err = decode(line.as_bytes()).expect_err("empty id");
        assert!(matches!(err, DecodeError::MissingWorkerId));
    }

    #[test]
    fn test_decode_bad_timestamp_key() {
        let line = r#"{"client_id":"w","user_count":1,"stats":[{"name":"/a","num_reqs_per_sec":{"soon":1},"num_requests":1,"total_response_time":1}]}"#;
        let err = decode(line.as_bytes()).expect_err("bad key");
        match err {
            DecodeError::InvalidTimestamp { label, raw } => {
                assert_eq!(label, "/a");
                assert_eq!(raw, "soon");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let line = r#"{"client_id":"w","user_count":2,"errors":{},"stats":[{"name":"/a","method":"GET","num_reqs_per_sec":{},"num_requests":0,"total_response_time":0}]}"#;
        let snap = decode(line.as_bytes()).expect("extra fields are tolerated");
        assert_eq!(snap.labels.len(), 1);
        assert!(snap.labels[0].per_second.is_empty());
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let err = decode(&[0xff, 0xfe, b'{']).expect_err("not utf8");
        assert!(matches!(err, DecodeError::Malformed(_)));
    }
}
