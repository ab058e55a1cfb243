//! # Traceability Generator
//!
//! Builds the one `TraceabilityRecord` each consolidated record carries and
//! freezes the entry into a `ConsolidatedRecord`.
//!
//! ## Contents
//! - Peer-benchmark justification (record metadata overrides computed values)
//! - Growth scaling factor breakdown and tier
//! - A clearance statement for every guardrail stage
//! - Final capped value and binding caps
//!
//! Pure: no I/O, no clock.

use crate::consolidator::ConsolidationEntry;
use crate::peers::PeerBenchmarks;
use shelfplan_models::{
    BenchmarkValues, CapKind, ConsolidatedRecord, GuardrailClearance, GuardrailStage,
    RejectionReason, ScalingFactors, ScalingTier, SourceRule, TraceabilityRecord,
};

/// Metadata columns recognized by the generator.
pub const META_CLUSTER_MEDIAN: &str = "cluster_median";
pub const META_CLUSTER_P75: &str = "cluster_p75";
pub const META_PERCENTILE_RANK: &str = "percentile_rank";
pub const META_BASE_FACTOR: &str = "base_factor";
pub const META_AFFINITY_MODIFIER: &str = "affinity_modifier";
pub const META_DAMPENING_FACTOR: &str = "dampening_factor";
pub const META_SCALING_TIER: &str = "scaling_tier";

/// Combined factor at or below this is `minimal`.
pub const TIER_MINIMAL_MAX: f64 = 1.10;
/// Combined factor at or below this is `moderate`; above is `aggressive`.
pub const TIER_MODERATE_MAX: f64 = 1.25;

pub fn tier_for_factor(combined: f64) -> ScalingTier {
    if combined <= TIER_MINIMAL_MAX {
        ScalingTier::Minimal
    } else if combined <= TIER_MODERATE_MAX {
        ScalingTier::Moderate
    } else {
        ScalingTier::Aggressive
    }
}

fn meta_f64(entry: &ConsolidationEntry, column: &str) -> Option<f64> {
    entry
        .metadata(column)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

fn fmt_delta(v: f64) -> String {
    format!("{v:+.2}")
}

pub struct TraceabilityGenerator<'a> {
    benchmarks: &'a PeerBenchmarks,
}

impl<'a> TraceabilityGenerator<'a> {
    pub fn new(benchmarks: &'a PeerBenchmarks) -> Self {
        Self { benchmarks }
    }

    pub fn benchmark_values(&self, entry: &ConsolidationEntry) -> BenchmarkValues {
        let stats = self
            .benchmarks
            .product(&entry.cluster_id, &entry.key.product_id);
        BenchmarkValues {
            store_value: entry.current_quantity,
            benchmark_label: self.benchmarks.benchmark_label(),
            peer_benchmark: meta_f64(entry, META_CLUSTER_P75).or(stats.map(|s| s.benchmark)),
            peer_p10: stats.map(|s| s.p10),
            peer_median: meta_f64(entry, META_CLUSTER_MEDIAN).or(stats.map(|s| s.median)),
            percentile_rank: meta_f64(entry, META_PERCENTILE_RANK)
                .or_else(|| stats.and_then(|s| s.rank_of(entry.current_quantity))),
            peer_store_count: stats.map_or(0, |s| s.store_count()),
        }
    }

    pub fn scaling_factors(&self, entry: &ConsolidationEntry) -> ScalingFactors {
        let Some(scaling) = entry.contribution(SourceRule::GrowthScaling) else {
            return ScalingFactors::neutral();
        };
        let factor = |column: &str| {
            scaling
                .metadata
                .get(column)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .unwrap_or(1.0)
        };
        let base_factor = factor(META_BASE_FACTOR);
        let affinity_modifier = factor(META_AFFINITY_MODIFIER);
        let dampening_factor = factor(META_DAMPENING_FACTOR);
        let combined = base_factor * affinity_modifier * dampening_factor;
        let tier = scaling
            .metadata
            .get(META_SCALING_TIER)
            .and_then(|t| ScalingTier::parse(t))
            .unwrap_or_else(|| tier_for_factor(combined));
        ScalingFactors {
            base_factor,
            affinity_modifier,
            dampening_factor,
            combined,
            tier,
        }
    }

    pub fn clearances(&self, entry: &ConsolidationEntry) -> Vec<GuardrailClearance> {
        let vetoed = |reason: RejectionReason| {
            entry
                .vetoes
                .iter()
                .filter(|v| v.reason == reason)
                .map(|v| format!("{} ({})", v.source_rule, fmt_delta(v.proposed_delta)))
                .collect::<Vec<_>>()
        };

        GuardrailStage::ALL
            .iter()
            .map(|&stage| {
                let (intervened, statement) = match stage {
                    GuardrailStage::PriorIncreaseProtection => {
                        let blocked = vetoed(RejectionReason::BlockedByPriorIncrease);
                        if blocked.is_empty() {
                            (false, "no reduction conflicted with an earlier increase".to_string())
                        } else {
                            (true, format!("blocked {}", blocked.join(", ")))
                        }
                    }
                    GuardrailStage::UpstreamCandidateGate => {
                        let missing = vetoed(RejectionReason::MissingUpstreamCandidate);
                        if !missing.is_empty() {
                            (true, format!("rejected unapproved {}", missing.join(", ")))
                        } else if entry.contribution(SourceRule::GrowthScaling).is_some() {
                            (false, "growth_scaling matched an approved candidate".to_string())
                        } else {
                            (false, "no gated growth contributed".to_string())
                        }
                    }
                    GuardrailStage::MinimumFloor => match &entry.floor {
                        Some(f) if f.clamped => (
                            true,
                            format!(
                                "reduction clamped to {} floor {:.2}",
                                f.reference.source, f.reference.floor_value
                            ),
                        ),
                        Some(f) => (
                            false,
                            format!(
                                "stays at or above {} floor {:.2}",
                                f.reference.source, f.reference.floor_value
                            ),
                        ),
                        None => (false, "no reduction against a floor".to_string()),
                    },
                    GuardrailStage::SafetyCaps => {
                        let caps: Vec<&str> = entry
                            .caps_applied()
                            .into_iter()
                            .filter(|c| *c != CapKind::MinimumFloor)
                            .map(CapKind::as_str)
                            .collect();
                        if caps.is_empty() {
                            (false, "within every safety cap".to_string())
                        } else {
                            (true, format!("bounded by {}", caps.join(", ")))
                        }
                    }
                    GuardrailStage::StoreVolumeFloor => {
                        if entry.below_store_floor {
                            (true, "store remains below minimum volume".to_string())
                        } else if entry.contribution(SourceRule::StoreFloorTopUp).is_some() {
                            (true, "topped up to meet minimum store volume".to_string())
                        } else {
                            (false, "store meets minimum volume".to_string())
                        }
                    }
                };
                GuardrailClearance {
                    stage,
                    intervened,
                    statement,
                }
            })
            .collect()
    }

    pub fn generate(&self, entry: &ConsolidationEntry) -> TraceabilityRecord {
        let benchmarks = self.benchmark_values(entry);
        let scaling = self.scaling_factors(entry);
        let clearances = self.clearances(entry);
        let binding_caps = entry.caps_applied();
        let final_quantity_delta = entry.final_delta();

        let opt = |v: Option<f64>| v.map(|x| format!("{x:.2}")).unwrap_or_else(|| "n/a".into());
        let justification_text = format!(
            "store {} holds {:.2} vs cluster {} {} {} (median {}, P10 {}, rank {}, {} peers)",
            entry.key.store_id,
            benchmarks.store_value,
            entry.cluster_id,
            benchmarks.benchmark_label,
            opt(benchmarks.peer_benchmark),
            opt(benchmarks.peer_median),
            opt(benchmarks.peer_p10),
            opt(benchmarks.percentile_rank),
            benchmarks.peer_store_count,
        );

        let no_conflict_text = clearances
            .iter()
            .map(|c| format!("{}: {}", c.stage.as_str(), c.statement))
            .collect::<Vec<_>>()
            .join("; ");

        let contributions = entry
            .contributions
            .iter()
            .map(|c| {
                if (c.final_delta - c.uncapped_delta).abs() > f64::EPSILON {
                    format!(
                        "{} {}→{}",
                        c.rule,
                        fmt_delta(c.uncapped_delta),
                        fmt_delta(c.final_delta)
                    )
                } else {
                    format!("{} {}", c.rule, fmt_delta(c.final_delta))
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        let binding = if binding_caps.is_empty() {
            "none".to_string()
        } else {
            binding_caps
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut explanation_text = format!(
            "final {} from [{}]; binding caps: {}",
            fmt_delta(final_quantity_delta),
            contributions,
            binding
        );
        if scaling.tier != ScalingTier::None {
            explanation_text.push_str(&format!(
                "; scaling {} (base {:.2} × affinity {:.2} × dampening {:.2} = {:.2})",
                scaling.tier.as_str(),
                scaling.base_factor,
                scaling.affinity_modifier,
                scaling.dampening_factor,
                scaling.combined
            ));
        }

        TraceabilityRecord {
            benchmarks,
            scaling,
            binding_caps,
            final_quantity_delta,
            clearances,
            justification_text,
            no_conflict_text,
            explanation_text,
        }
    }

    /// Freeze an entry into its durable record.
    pub fn finalize(&self, entry: &ConsolidationEntry) -> ConsolidatedRecord {
        ConsolidatedRecord {
            store_id: entry.key.store_id.clone(),
            product_id: entry.key.product_id.clone(),
            subcategory: entry.subcategory.clone(),
            cluster_id: entry.cluster_id.clone(),
            current_quantity: entry.current_quantity,
            unit_price: entry.unit_price,
            uncapped_quantity_delta: entry.uncapped_delta(),
            final_quantity_delta: entry.final_delta(),
            final_investment_delta: entry.final_investment(),
            contributing_rules: entry.contributing_rules(),
            caps_applied: entry.caps_applied(),
            vetoes: entry.vetoes.clone(),
            floor: entry.floor.clone(),
            below_store_floor: entry.below_store_floor,
            traceability: self.generate(entry),
        }
    }
}
