//! # shelfplan eval
//!
//! Rollups and run summary over the consolidated detail table.
//!
//! ## Components
//! - `aggregator`: per-store and per-(cluster, subcategory) rollups with
//!   exact-sum verification
//! - `run_summary`: deterministic JSON/text run summary with a SHA-256 digest

pub mod aggregator;
pub mod run_summary;

pub use aggregator::{
    AggregationError, ClusterSubcategorySummary, RollupTotals, Rollups, StoreSummary, aggregate,
    verify_rollups,
};
pub use run_summary::{RUN_SUMMARY_SCHEMA_VERSION, RunSummary, StageLine, compute_digest_hex};
