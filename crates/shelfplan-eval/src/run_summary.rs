//! # Run Summary
//!
//! Pure builder that converts pipeline output into:
//! - Deterministic JSON summary struct
//! - Deterministic text summary string
//!
//! ## Invariants
//! - No file I/O (the runner writes files)
//! - Deterministic: `BTreeMap` ordering, every reason/cap/tier listed even at zero
//! - Every dropped record is counted under exactly one reason code
//! - Digest = SHA-256 over the config fingerprint and each detail record's
//!   canonical bytes, in detail order; `generated_at` is never hashed

use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shelfplan_gates::{CoreCategorySet, PipelineConfig, PipelineOutput};
use shelfplan_models::{
    CapKind, ConsolidatedRecord, GuardrailStage, RejectionReason, ScalingTier, TOLERANCE,
    write_string,
};

use crate::aggregator::Rollups;

// =============================================================================
// Constants
// =============================================================================

/// Schema version for run summaries.
pub const RUN_SUMMARY_SCHEMA_VERSION: &str = "run_summary_v1.0";

const RULE_LINE: &str =
    "================================================================================";
const THIN_LINE: &str =
    "--------------------------------------------------------------------------------";

// =============================================================================
// Stage Lines
// =============================================================================

/// Per-stage counters, flattened for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLine {
    pub rule: String,
    pub rows_read: usize,
    pub admitted: usize,
    pub rejected: usize,
    pub families_allocated: usize,
    pub allocated_records: usize,
    pub uncapped_units: f64,
    pub final_units: f64,
}

// =============================================================================
// Run Summary
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub schema_version: String,
    pub config_name: String,
    pub config_fingerprint: String,
    pub core_category_source: String,
    /// Wall-clock stamp set by the caller; excluded from the digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,

    pub total_records: usize,
    pub increase_records: usize,
    pub reduction_records: usize,
    pub total_units: f64,
    pub total_investment: f64,
    pub stores: usize,
    pub cluster_subcategories: usize,

    pub total_rejections: usize,
    /// Keyed by reason code.
    pub rejections_by_reason: BTreeMap<String, usize>,
    /// Keyed by source rule.
    pub rejections_by_rule: BTreeMap<String, usize>,

    /// Binding caps and floor clamps, keyed by cap name.
    pub caps_applied: BTreeMap<String, usize>,
    pub floor_clamps: usize,
    pub dampened_records: usize,
    /// Records on which each guardrail stage intervened.
    pub guardrail_interventions: BTreeMap<String, usize>,
    pub scaling_tiers: BTreeMap<String, usize>,

    pub stores_evaluated: usize,
    pub stores_below_floor: usize,
    pub records_below_store_floor: usize,
    pub top_up_records: usize,
    pub top_up_units: f64,
    pub top_ups_capped: usize,

    pub stages: Vec<StageLine>,
    pub warnings: Vec<String>,
    pub digest: String,
}

impl RunSummary {
    /// Build a summary from a completed run.
    pub fn build(
        output: &PipelineOutput,
        config: &PipelineConfig,
        core: &CoreCategorySet,
        rollups: &Rollups,
    ) -> Self {
        let records = &output.records;

        let mut rejections_by_reason: BTreeMap<String, usize> = RejectionReason::ALL
            .iter()
            .map(|r| (r.code().to_string(), 0))
            .collect();
        let mut rejections_by_rule: BTreeMap<String, usize> = BTreeMap::new();
        for rejection in &output.rejections {
            *rejections_by_reason
                .entry(rejection.reason.code().to_string())
                .or_insert(0) += 1;
            *rejections_by_rule
                .entry(rejection.source_rule.as_str().to_string())
                .or_insert(0) += 1;
        }

        let mut caps_applied: BTreeMap<String, usize> = [
            CapKind::AbsoluteUnits,
            CapKind::ClusterMedianPct,
            CapKind::CoreCurrentQuantityPct,
            CapKind::CurrentQuantityPct,
            CapKind::MinQuantityThreshold,
            CapKind::MinimumFloor,
        ]
        .iter()
        .map(|k| (k.as_str().to_string(), 0))
        .collect();
        for stats in &output.stage_stats {
            for (kind, count) in &stats.caps {
                *caps_applied.entry(kind.as_str().to_string()).or_insert(0) += count;
            }
        }

        let mut guardrail_interventions: BTreeMap<String, usize> = GuardrailStage::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        let mut scaling_tiers: BTreeMap<String, usize> = ScalingTier::ALL
            .iter()
            .map(|t| (t.as_str().to_string(), 0))
            .collect();
        let mut floor_clamps = 0;
        let mut dampened_records = 0;
        let mut increase_records = 0;
        let mut reduction_records = 0;
        let mut records_below_store_floor = 0;
        let mut total_units = 0.0;
        let mut total_investment = 0.0;

        for record in records {
            total_units += record.final_quantity_delta;
            total_investment += record.final_investment_delta;
            if record.final_quantity_delta > TOLERANCE {
                increase_records += 1;
            } else if record.final_quantity_delta < -TOLERANCE {
                reduction_records += 1;
            }
            if record.floor.as_ref().is_some_and(|f| f.clamped) {
                floor_clamps += 1;
            }
            if record.below_store_floor {
                records_below_store_floor += 1;
            }
            let scaling = &record.traceability.scaling;
            if scaling.dampening_factor < 1.0 - TOLERANCE {
                dampened_records += 1;
            }
            *scaling_tiers
                .entry(scaling.tier.as_str().to_string())
                .or_insert(0) += 1;
            for clearance in &record.traceability.clearances {
                if clearance.intervened {
                    *guardrail_interventions
                        .entry(clearance.stage.as_str().to_string())
                        .or_insert(0) += 1;
                }
            }
        }

        let stages = output
            .stage_stats
            .iter()
            .map(|s| StageLine {
                rule: s.rule.map(|r| r.as_str().to_string()).unwrap_or_default(),
                rows_read: s.rows_read,
                admitted: s.admitted,
                rejected: s.rejected_total(),
                families_allocated: s.families_allocated,
                allocated_records: s.allocated_records,
                uncapped_units: s.uncapped_units,
                final_units: s.final_units,
            })
            .collect();

        Self {
            schema_version: RUN_SUMMARY_SCHEMA_VERSION.to_string(),
            config_name: config.name.clone(),
            config_fingerprint: output.config_fingerprint.clone(),
            core_category_source: core.source().as_str().to_string(),
            generated_at: None,
            total_records: records.len(),
            increase_records,
            reduction_records,
            total_units,
            total_investment,
            stores: rollups.stores.len(),
            cluster_subcategories: rollups.cluster_subcategories.len(),
            total_rejections: output.rejections.len(),
            rejections_by_reason,
            rejections_by_rule,
            caps_applied,
            floor_clamps,
            dampened_records,
            guardrail_interventions,
            scaling_tiers,
            stores_evaluated: output.store_floor.stores_evaluated,
            stores_below_floor: output.store_floor.stores_below_floor.len(),
            records_below_store_floor,
            top_up_records: output.store_floor.top_up_records,
            top_up_units: output.store_floor.top_up_units,
            top_ups_capped: output.store_floor.top_ups_capped,
            stages,
            warnings: output.warnings.clone(),
            digest: compute_digest_hex(&output.config_fingerprint, records),
        }
    }

    pub fn with_generated_at(mut self, generated_at: impl Into<String>) -> Self {
        self.generated_at = Some(generated_at.into());
        self
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Deterministic text summary.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        // Writing into a String never fails.
        let _ = self.write_text(&mut out);
        out
    }

    fn write_text(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "{RULE_LINE}")?;
        writeln!(out, "SHELFPLAN RUN SUMMARY")?;
        writeln!(out, "{RULE_LINE}")?;
        writeln!(out, "Config:      {} ({})", self.config_name, self.config_fingerprint)?;
        writeln!(out, "Core list:   {}", self.core_category_source)?;
        if let Some(ts) = &self.generated_at {
            writeln!(out, "Generated:   {ts}")?;
        }
        writeln!(out)?;

        writeln!(
            out,
            "Records:     {} ({} increases / {} reductions)",
            self.total_records, self.increase_records, self.reduction_records
        )?;
        writeln!(out, "Units:       {:+.3}", self.total_units)?;
        writeln!(out, "Investment:  {:+.2}", self.total_investment)?;
        writeln!(
            out,
            "Coverage:    {} store(s), {} cluster/subcategory group(s)",
            self.stores, self.cluster_subcategories
        )?;
        writeln!(out)?;

        writeln!(out, "{THIN_LINE}")?;
        writeln!(out, "STAGES")?;
        writeln!(out, "{THIN_LINE}")?;
        for stage in &self.stages {
            writeln!(
                out,
                "  {:<20} read={:<5} admitted={:<5} rejected={:<5} allocated={:<5} units {:+.3} -> {:+.3}",
                stage.rule,
                stage.rows_read,
                stage.admitted,
                stage.rejected,
                stage.allocated_records,
                stage.uncapped_units,
                stage.final_units
            )?;
        }
        writeln!(out)?;

        writeln!(out, "{THIN_LINE}")?;
        writeln!(out, "REJECTIONS ({})", self.total_rejections)?;
        writeln!(out, "{THIN_LINE}")?;
        for (code, count) in &self.rejections_by_reason {
            writeln!(out, "  {code:<28} {count}")?;
        }
        writeln!(out)?;

        writeln!(out, "{THIN_LINE}")?;
        writeln!(out, "GUARDRAILS")?;
        writeln!(out, "{THIN_LINE}")?;
        for (cap, count) in &self.caps_applied {
            writeln!(out, "  cap {cap:<24} {count}")?;
        }
        for (stage, count) in &self.guardrail_interventions {
            writeln!(out, "  stage {stage:<22} {count}")?;
        }
        writeln!(out, "  floor clamps                 {}", self.floor_clamps)?;
        writeln!(out, "  dampened records             {}", self.dampened_records)?;
        writeln!(out)?;

        writeln!(out, "{THIN_LINE}")?;
        writeln!(out, "SCALING TIERS")?;
        writeln!(out, "{THIN_LINE}")?;
        for (tier, count) in &self.scaling_tiers {
            writeln!(out, "  {tier:<28} {count}")?;
        }
        writeln!(out)?;

        writeln!(out, "{THIN_LINE}")?;
        writeln!(out, "STORE VOLUME FLOOR")?;
        writeln!(out, "{THIN_LINE}")?;
        writeln!(
            out,
            "  evaluated={} below={} flagged_records={} top_up_records={} top_up_units={:.3} capped={}",
            self.stores_evaluated,
            self.stores_below_floor,
            self.records_below_store_floor,
            self.top_up_records,
            self.top_up_units,
            self.top_ups_capped
        )?;

        if !self.warnings.is_empty() {
            writeln!(out)?;
            writeln!(out, "{THIN_LINE}")?;
            writeln!(out, "WARNINGS")?;
            writeln!(out, "{THIN_LINE}")?;
            for warning in &self.warnings {
                writeln!(out, "  - {warning}")?;
            }
        }

        writeln!(out)?;
        writeln!(out, "{RULE_LINE}")?;
        writeln!(out, "Digest: {}", self.digest)?;
        writeln!(out, "{RULE_LINE}")?;
        Ok(())
    }
}

/// SHA-256 over the config fingerprint and the detail records.
pub fn compute_digest_hex(config_fingerprint: &str, records: &[ConsolidatedRecord]) -> String {
    let mut bytes = Vec::new();
    write_string(&mut bytes, RUN_SUMMARY_SCHEMA_VERSION);
    write_string(&mut bytes, config_fingerprint);
    bytes.extend_from_slice(&(records.len() as u32).to_le_bytes());

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    for record in records {
        hasher.update(record.canonical_bytes());
    }
    format!("{:x}", hasher.finalize())
}
