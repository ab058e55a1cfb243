//! # Consolidated Records & Traceability
//!
//! Durable output of a run: one `ConsolidatedRecord` per (store, product),
//! each carrying exactly one `TraceabilityRecord`.
//!
//! ## Invariants
//! - Uniqueness on (store_id, product_id)
//! - `final_quantity_delta` is the sum of surviving, capped contributions
//! - `|final_quantity_delta| <= |uncapped_quantity_delta|`, same sign
//! - Neither type is mutated after construction

use crate::adjustment::SourceRule;
use crate::floor::MinimumReference;
use crate::ids::{ClusterId, ItemKey, ProductId, StoreId};
use crate::rejection::RejectionReason;
use serde::{Deserialize, Serialize};

// =============================================================================
// Cap Kind
// =============================================================================

/// Named bound that shrank an adjustment.
///
/// Variant order is lexical by `as_str()`; ties between binding caps
/// resolve to the smallest variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapKind {
    /// Hard unit ceiling.
    AbsoluteUnits,
    /// Percentage of the peer cluster median.
    ClusterMedianPct,
    /// Percentage of current quantity, core-subcategory reduction limit.
    CoreCurrentQuantityPct,
    /// Percentage of current quantity, standard limit.
    CurrentQuantityPct,
    /// Sub-threshold magnitude zeroed.
    MinQuantityThreshold,
    /// Reduction clamped to the protected floor (boundary clamp, not a cap family).
    MinimumFloor,
}

impl CapKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CapKind::AbsoluteUnits => "absolute_units",
            CapKind::ClusterMedianPct => "cluster_median_pct",
            CapKind::CoreCurrentQuantityPct => "core_current_quantity_pct",
            CapKind::CurrentQuantityPct => "current_quantity_pct",
            CapKind::MinQuantityThreshold => "min_quantity_threshold",
            CapKind::MinimumFloor => "minimum_floor",
        }
    }
}

impl std::fmt::Display for CapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Provenance Pieces
// =============================================================================

/// A rule that was vetoed for this key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Veto {
    pub source_rule: SourceRule,
    pub reason: RejectionReason,
    pub proposed_delta: f64,
}

/// Floor that applied to the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloorBinding {
    pub reference: MinimumReference,
    /// The starting position met the floor, so the floor was protected.
    pub enforced: bool,
    /// A reduction was clamped by the floor.
    pub clamped: bool,
}

/// Growth scaling tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingTier {
    /// No growth scaling contributed.
    None,
    Minimal,
    Moderate,
    Aggressive,
}

impl ScalingTier {
    pub const ALL: [ScalingTier; 4] = [
        ScalingTier::None,
        ScalingTier::Minimal,
        ScalingTier::Moderate,
        ScalingTier::Aggressive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScalingTier::None => "none",
            ScalingTier::Minimal => "minimal",
            ScalingTier::Moderate => "moderate",
            ScalingTier::Aggressive => "aggressive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimal" => Some(ScalingTier::Minimal),
            "moderate" => Some(ScalingTier::Moderate),
            "aggressive" => Some(ScalingTier::Aggressive),
            _ => None,
        }
    }
}

// =============================================================================
// Traceability
// =============================================================================

/// Peer benchmark values used to justify a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkValues {
    /// The store's own current quantity.
    pub store_value: f64,
    /// Label of the configured benchmark percentile, e.g. "P75".
    pub benchmark_label: String,
    pub peer_benchmark: Option<f64>,
    pub peer_p10: Option<f64>,
    pub peer_median: Option<f64>,
    /// Store's percentile rank within its cluster, 0..=1.
    pub percentile_rank: Option<f64>,
    pub peer_store_count: usize,
}

/// Growth scaling factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingFactors {
    pub base_factor: f64,
    pub affinity_modifier: f64,
    pub dampening_factor: f64,
    pub combined: f64,
    pub tier: ScalingTier,
}

impl ScalingFactors {
    pub fn neutral() -> Self {
        Self {
            base_factor: 1.0,
            affinity_modifier: 1.0,
            dampening_factor: 1.0,
            combined: 1.0,
            tier: ScalingTier::None,
        }
    }
}

/// Guardrail stages that can veto or shrink a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailStage {
    PriorIncreaseProtection,
    UpstreamCandidateGate,
    MinimumFloor,
    SafetyCaps,
    StoreVolumeFloor,
}

impl GuardrailStage {
    pub const ALL: [GuardrailStage; 5] = [
        GuardrailStage::PriorIncreaseProtection,
        GuardrailStage::UpstreamCandidateGate,
        GuardrailStage::MinimumFloor,
        GuardrailStage::SafetyCaps,
        GuardrailStage::StoreVolumeFloor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GuardrailStage::PriorIncreaseProtection => "prior_increase_protection",
            GuardrailStage::UpstreamCandidateGate => "upstream_candidate_gate",
            GuardrailStage::MinimumFloor => "minimum_floor",
            GuardrailStage::SafetyCaps => "safety_caps",
            GuardrailStage::StoreVolumeFloor => "store_volume_floor",
        }
    }
}

/// Outcome of one guardrail stage for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailClearance {
    pub stage: GuardrailStage,
    /// The stage vetoed or shrank at least one contribution.
    pub intervened: bool,
    pub statement: String,
}

/// Structured justification attached to every consolidated record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceabilityRecord {
    pub benchmarks: BenchmarkValues,
    pub scaling: ScalingFactors,
    pub binding_caps: Vec<CapKind>,
    pub final_quantity_delta: f64,
    pub clearances: Vec<GuardrailClearance>,

    pub justification_text: String,
    pub no_conflict_text: String,
    pub explanation_text: String,
}

// =============================================================================
// Consolidated Record
// =============================================================================

/// Exactly one final decision per (store, product).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRecord {
    pub store_id: StoreId,
    pub product_id: ProductId,
    pub subcategory: String,
    pub cluster_id: ClusterId,

    pub current_quantity: f64,
    pub unit_price: f64,

    /// Pre-cap sum of the contributions moving in the final direction
    /// (all contributions when the final delta is zero).
    pub uncapped_quantity_delta: f64,
    pub final_quantity_delta: f64,
    pub final_investment_delta: f64,

    /// Rules with a non-zero surviving delta, in stage order.
    pub contributing_rules: Vec<SourceRule>,
    /// Caps that bound those same contributions, in application order, deduplicated.
    pub caps_applied: Vec<CapKind>,
    /// Rules rejected for this key.
    pub vetoes: Vec<Veto>,

    pub floor: Option<FloorBinding>,
    pub below_store_floor: bool,

    pub traceability: TraceabilityRecord,
}

impl ConsolidatedRecord {
    pub fn key(&self) -> ItemKey {
        ItemKey {
            store_id: self.store_id.clone(),
            product_id: self.product_id.clone(),
        }
    }

    pub fn has_contribution_from(&self, rule: SourceRule) -> bool {
        self.contributing_rules.contains(&rule)
    }

    /// Position after the adjustment.
    pub fn resulting_quantity(&self) -> f64 {
        self.current_quantity + self.final_quantity_delta
    }

    /// Canonical bytes for run digests (frozen field order).
    ///
    /// 1. store_id, product_id, subcategory, cluster_id (u32 LE len + UTF-8)
    /// 2. final_quantity_delta, final_investment_delta (f64 bits LE)
    /// 3. contributing_rules (u32 LE count + rule bytes)
    /// 4. caps_applied (u32 LE count + names)
    /// 5. below_store_floor (u8)
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_string(&mut bytes, self.store_id.as_str());
        write_string(&mut bytes, self.product_id.as_str());
        write_string(&mut bytes, &self.subcategory);
        write_string(&mut bytes, self.cluster_id.as_str());
        bytes.extend_from_slice(&self.final_quantity_delta.to_bits().to_le_bytes());
        bytes.extend_from_slice(&self.final_investment_delta.to_bits().to_le_bytes());
        bytes.extend_from_slice(&(self.contributing_rules.len() as u32).to_le_bytes());
        for rule in &self.contributing_rules {
            bytes.push(rule.canonical_byte());
        }
        bytes.extend_from_slice(&(self.caps_applied.len() as u32).to_le_bytes());
        for cap in &self.caps_applied {
            write_string(&mut bytes, cap.as_str());
        }
        bytes.push(self.below_store_floor as u8);
        bytes
    }
}

/// Write a string with length prefix (u32 LE len + UTF-8 bytes).
pub fn write_string(bytes: &mut Vec<u8>, s: &str) {
    bytes.extend_from_slice(&(s.len() as u32).to_le_bytes());
    bytes.extend_from_slice(s.as_bytes());
}
