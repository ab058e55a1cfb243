//! # shelfplan runner
//!
//! File-level plumbing around the consolidation pipeline: TOML configs and
//! presets, CSV input tables, output tables and the run summary.
//!
//! ## Hard Laws
//! - L1: All-or-nothing: outputs are written only after the pipeline,
//!   rollup verification and summary all succeeded
//! - L2: Only unreadable or malformed input files abort a run; row-level
//!   defects become counted rejections
//!
//! ## Output Files
//! - `detail.csv`: one row per (store, product) with flattened traceability
//! - `store_summary.csv`, `cluster_subcategory_summary.csv`: rollups
//! - `rejections.csv`: every dropped candidate with its reason code
//! - `run_summary.json`, `run_summary.txt`: totals, guardrail counts, digest

pub mod config;
pub mod report;
pub mod run;
pub mod tables;

pub use config::{LoadedConfig, PRESET_NAMES, parse_rule_arg, preset, preset_toml};
pub use report::{
    CLUSTER_SUMMARY_FILE, DETAIL_FILE, DetailRow, REJECTIONS_FILE, RunReport, STORE_SUMMARY_FILE,
    SUMMARY_JSON_FILE, SUMMARY_TEXT_FILE,
};
pub use run::{RunArtifacts, RunRequest, execute};
pub use tables::{InputPaths, read_rows, read_rule_table};
