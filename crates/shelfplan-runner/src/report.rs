//! Output tables: detail, rollups, rejections, run summary.
//!
//! ## Invariants
//! - Column order is fixed by the row struct declaration order
//! - List-valued cells are `;`-joined in record order
//! - Files are written only after the whole run succeeded

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::Writer as CsvWriter;
use serde::Serialize;
use shelfplan_eval::{ClusterSubcategorySummary, RunSummary, StoreSummary};
use shelfplan_models::{ConsolidatedRecord, Rejection};
use tracing::info;

pub const DETAIL_FILE: &str = "detail.csv";
pub const STORE_SUMMARY_FILE: &str = "store_summary.csv";
pub const CLUSTER_SUMMARY_FILE: &str = "cluster_subcategory_summary.csv";
pub const REJECTIONS_FILE: &str = "rejections.csv";
pub const SUMMARY_JSON_FILE: &str = "run_summary.json";
pub const SUMMARY_TEXT_FILE: &str = "run_summary.txt";

// =============================================================================
// Row Types
// =============================================================================

/// One detail row: a consolidated record with flattened traceability.
#[derive(Debug, Clone, Serialize)]
pub struct DetailRow {
    pub store_id: String,
    pub product_id: String,
    pub subcategory: String,
    pub cluster_id: String,
    pub current_quantity: f64,
    pub unit_price: f64,
    pub uncapped_quantity_delta: f64,
    pub final_quantity_delta: f64,
    pub final_investment_delta: f64,
    pub resulting_quantity: f64,
    pub contributing_rules: String,
    pub caps_applied: String,
    pub vetoes: String,
    pub floor_value: Option<f64>,
    pub floor_source: String,
    pub floor_enforced: bool,
    pub floor_clamped: bool,
    pub below_store_floor: bool,
    pub benchmark_label: String,
    pub peer_benchmark: Option<f64>,
    pub peer_median: Option<f64>,
    pub peer_p10: Option<f64>,
    pub percentile_rank: Option<f64>,
    pub peer_store_count: usize,
    pub base_factor: f64,
    pub affinity_modifier: f64,
    pub dampening_factor: f64,
    pub combined_factor: f64,
    pub scaling_tier: String,
    pub binding_caps: String,
    pub justification: String,
    pub no_conflict: String,
    pub explanation: String,
}

impl From<&ConsolidatedRecord> for DetailRow {
    fn from(r: &ConsolidatedRecord) -> Self {
        let t = &r.traceability;
        Self {
            store_id: r.store_id.to_string(),
            product_id: r.product_id.to_string(),
            subcategory: r.subcategory.clone(),
            cluster_id: r.cluster_id.to_string(),
            current_quantity: r.current_quantity,
            unit_price: r.unit_price,
            uncapped_quantity_delta: r.uncapped_quantity_delta,
            final_quantity_delta: r.final_quantity_delta,
            final_investment_delta: r.final_investment_delta,
            resulting_quantity: r.resulting_quantity(),
            contributing_rules: join(r.contributing_rules.iter().map(|x| x.as_str())),
            caps_applied: join(r.caps_applied.iter().map(|c| c.as_str())),
            vetoes: r
                .vetoes
                .iter()
                .map(|v| format!("{}:{}", v.source_rule.as_str(), v.reason.code()))
                .collect::<Vec<_>>()
                .join(";"),
            floor_value: r.floor.as_ref().map(|f| f.reference.floor_value),
            floor_source: r
                .floor
                .as_ref()
                .map(|f| f.reference.source.as_str().to_string())
                .unwrap_or_default(),
            floor_enforced: r.floor.as_ref().is_some_and(|f| f.enforced),
            floor_clamped: r.floor.as_ref().is_some_and(|f| f.clamped),
            below_store_floor: r.below_store_floor,
            benchmark_label: t.benchmarks.benchmark_label.clone(),
            peer_benchmark: t.benchmarks.peer_benchmark,
            peer_median: t.benchmarks.peer_median,
            peer_p10: t.benchmarks.peer_p10,
            percentile_rank: t.benchmarks.percentile_rank,
            peer_store_count: t.benchmarks.peer_store_count,
            base_factor: t.scaling.base_factor,
            affinity_modifier: t.scaling.affinity_modifier,
            dampening_factor: t.scaling.dampening_factor,
            combined_factor: t.scaling.combined,
            scaling_tier: t.scaling.tier.as_str().to_string(),
            binding_caps: join(t.binding_caps.iter().map(|c| c.as_str())),
            justification: t.justification_text.clone(),
            no_conflict: t.no_conflict_text.clone(),
            explanation: t.explanation_text.clone(),
        }
    }
}

fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.collect::<Vec<_>>().join(";")
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreRow {
    pub store_id: String,
    pub cluster_id: String,
    pub records: usize,
    pub increase_records: usize,
    pub reduction_records: usize,
    pub quantity_delta: f64,
    pub investment_delta: f64,
    pub increase_units: f64,
    pub reduction_units: f64,
    pub below_store_floor: bool,
}

impl From<&StoreSummary> for StoreRow {
    fn from(s: &StoreSummary) -> Self {
        Self {
            store_id: s.store_id.to_string(),
            cluster_id: s.cluster_id.to_string(),
            records: s.totals.records,
            increase_records: s.totals.increase_records,
            reduction_records: s.totals.reduction_records,
            quantity_delta: s.totals.quantity_delta,
            investment_delta: s.totals.investment_delta,
            increase_units: s.totals.increase_units,
            reduction_units: s.totals.reduction_units,
            below_store_floor: s.below_store_floor,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSubcategoryRow {
    pub cluster_id: String,
    pub subcategory: String,
    pub stores: usize,
    pub records: usize,
    pub increase_records: usize,
    pub reduction_records: usize,
    pub quantity_delta: f64,
    pub investment_delta: f64,
    pub increase_units: f64,
    pub reduction_units: f64,
}

impl From<&ClusterSubcategorySummary> for ClusterSubcategoryRow {
    fn from(s: &ClusterSubcategorySummary) -> Self {
        Self {
            cluster_id: s.cluster_id.to_string(),
            subcategory: s.subcategory.clone(),
            stores: s.stores,
            records: s.totals.records,
            increase_records: s.totals.increase_records,
            reduction_records: s.totals.reduction_records,
            quantity_delta: s.totals.quantity_delta,
            investment_delta: s.totals.investment_delta,
            increase_units: s.totals.increase_units,
            reduction_units: s.totals.reduction_units,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectionRow {
    pub source_rule: String,
    pub store_id: String,
    pub product_id: String,
    pub subcategory: String,
    pub proposed_delta: f64,
    pub reason: String,
    pub detail: String,
}

impl From<&Rejection> for RejectionRow {
    fn from(r: &Rejection) -> Self {
        Self {
            source_rule: r.source_rule.as_str().to_string(),
            store_id: r.store_id.to_string(),
            product_id: r.product_id.as_ref().map(|p| p.to_string()).unwrap_or_default(),
            subcategory: r.subcategory.clone(),
            proposed_delta: r.proposed_delta,
            reason: r.reason.code().to_string(),
            detail: r.detail.clone(),
        }
    }
}

// =============================================================================
// Writers
// =============================================================================

/// Write rows with a header derived from the row type.
///
/// An empty table still gets its header line.
pub fn write_rows<R: Serialize>(path: &Path, rows: &[R], header: &[&str]) -> Result<()> {
    let mut wtr = CsvWriter::from_path(path)
        .with_context(|| format!("create {}", path.display()))?;
    if rows.is_empty() {
        wtr.write_record(header)?;
    }
    for row in rows {
        wtr.serialize(row)
            .with_context(|| format!("write row to {}", path.display()))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Everything a run writes.
pub struct RunReport<'a> {
    pub records: &'a [ConsolidatedRecord],
    pub rejections: &'a [Rejection],
    pub stores: &'a [StoreSummary],
    pub cluster_subcategories: &'a [ClusterSubcategorySummary],
    pub summary: &'a RunSummary,
}

impl RunReport<'_> {
    /// Write every output file into `out_dir`, returning the paths written.
    pub fn write_all(&self, out_dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("create output dir: {}", out_dir.display()))?;
        let mut written = Vec::new();

        let path = out_dir.join(DETAIL_FILE);
        let rows: Vec<DetailRow> = self.records.iter().map(DetailRow::from).collect();
        write_rows(&path, &rows, DETAIL_HEADER)?;
        written.push(path);

        let path = out_dir.join(STORE_SUMMARY_FILE);
        let rows: Vec<StoreRow> = self.stores.iter().map(StoreRow::from).collect();
        write_rows(&path, &rows, STORE_HEADER)?;
        written.push(path);

        let path = out_dir.join(CLUSTER_SUMMARY_FILE);
        let rows: Vec<ClusterSubcategoryRow> = self
            .cluster_subcategories
            .iter()
            .map(ClusterSubcategoryRow::from)
            .collect();
        write_rows(&path, &rows, CLUSTER_HEADER)?;
        written.push(path);

        let path = out_dir.join(REJECTIONS_FILE);
        let rows: Vec<RejectionRow> = self.rejections.iter().map(RejectionRow::from).collect();
        write_rows(&path, &rows, REJECTION_HEADER)?;
        written.push(path);

        let path = out_dir.join(SUMMARY_JSON_FILE);
        let json = self.summary.to_json().context("serialize run summary")?;
        std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        written.push(path);

        let path = out_dir.join(SUMMARY_TEXT_FILE);
        std::fs::write(&path, self.summary.to_text())
            .with_context(|| format!("write {}", path.display()))?;
        written.push(path);

        info!(dir = %out_dir.display(), files = written.len(), "Outputs written");
        Ok(written)
    }
}

const DETAIL_HEADER: &[&str] = &[
    "store_id",
    "product_id",
    "subcategory",
    "cluster_id",
    "current_quantity",
    "unit_price",
    "uncapped_quantity_delta",
    "final_quantity_delta",
    "final_investment_delta",
    "resulting_quantity",
    "contributing_rules",
    "caps_applied",
    "vetoes",
    "floor_value",
    "floor_source",
    "floor_enforced",
    "floor_clamped",
    "below_store_floor",
    "benchmark_label",
    "peer_benchmark",
    "peer_median",
    "peer_p10",
    "percentile_rank",
    "peer_store_count",
    "base_factor",
    "affinity_modifier",
    "dampening_factor",
    "combined_factor",
    "scaling_tier",
    "binding_caps",
    "justification",
    "no_conflict",
    "explanation",
];

const STORE_HEADER: &[&str] = &[
    "store_id",
    "cluster_id",
    "records",
    "increase_records",
    "reduction_records",
    "quantity_delta",
    "investment_delta",
    "increase_units",
    "reduction_units",
    "below_store_floor",
];

const CLUSTER_HEADER: &[&str] = &[
    "cluster_id",
    "subcategory",
    "stores",
    "records",
    "increase_records",
    "reduction_records",
    "quantity_delta",
    "investment_delta",
    "increase_units",
    "reduction_units",
];

const REJECTION_HEADER: &[&str] = &[
    "source_rule",
    "store_id",
    "product_id",
    "subcategory",
    "proposed_delta",
    "reason",
    "detail",
];
