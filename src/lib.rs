//! Joins per-second statistics snapshots appended by distributed
//! load-generating workers into a single ordered stream of finalized
//! per-second records.

pub mod config;
pub mod consolidate;
pub mod export;
pub mod join;
pub mod provider;
pub mod source;
