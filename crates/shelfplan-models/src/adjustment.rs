//! # Adjustment Records
//!
//! The canonical unit flowing through the consolidation pipeline.
//!
//! ## Invariants
//! - The sign of `quantity_delta` is fixed by `source_rule`
//! - `investment_delta == quantity_delta * unit_price` for every constructed record
//! - Records are values: every stage returns new records, never mutates inputs

use crate::ids::{ClusterId, FamilyKey, ItemKey, ProductId, StoreId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

// =============================================================================
// Rationale Tags
// =============================================================================

/// Tag added to records whose subcategory is core-protected.
pub const TAG_CORE_PROTECTED: &str = "core-protected";

/// Tag attached by growth generators when a store lags its peer benchmark.
pub const TAG_PEER_BENCHMARK_LAG: &str = "peer-benchmark-lag";

/// Tag added to SKU records produced by family allocation.
pub const TAG_FAMILY_ALLOCATED: &str = "family-allocated";

/// Tag added to SKU records that received an exploration share.
pub const TAG_EXPLORATION: &str = "exploration";

// =============================================================================
// Direction
// =============================================================================

/// Direction of an adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Increase,
    Reduction,
}

impl Direction {
    /// Does `delta` carry this direction's sign? Zero matches neither.
    pub fn matches(self, delta: f64) -> bool {
        match self {
            Direction::Increase => delta > 0.0,
            Direction::Reduction => delta < 0.0,
        }
    }

    pub fn signum(self) -> f64 {
        match self {
            Direction::Increase => 1.0,
            Direction::Reduction => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Increase => "increase",
            Direction::Reduction => "reduction",
        }
    }
}

// =============================================================================
// Source Rule
// =============================================================================

/// Originating rule generator.
///
/// Frozen: canonical bytes are part of the run digest. Do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRule {
    /// Below-minimum protection: raise items to the resolved floor.
    BelowMinimum,
    /// Overcapacity reduction.
    Overcapacity,
    /// Performance-gap growth candidate.
    GrowthCandidate,
    /// Growth scaling over pre-approved candidates.
    GrowthScaling,
    /// Minimum store volume top-up (internal, never read from a table).
    StoreFloorTopUp,
}

impl SourceRule {
    /// Rules that arrive as external generator tables.
    pub const TABLE_RULES: [SourceRule; 4] = [
        SourceRule::BelowMinimum,
        SourceRule::Overcapacity,
        SourceRule::GrowthCandidate,
        SourceRule::GrowthScaling,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceRule::BelowMinimum => "below_minimum",
            SourceRule::Overcapacity => "overcapacity",
            SourceRule::GrowthCandidate => "growth_candidate",
            SourceRule::GrowthScaling => "growth_scaling",
            SourceRule::StoreFloorTopUp => "store_floor_top_up",
        }
    }

    /// Sign fixed by the rule.
    pub fn direction(self) -> Direction {
        match self {
            SourceRule::Overcapacity => Direction::Reduction,
            SourceRule::BelowMinimum
            | SourceRule::GrowthCandidate
            | SourceRule::GrowthScaling
            | SourceRule::StoreFloorTopUp => Direction::Increase,
        }
    }

    pub fn canonical_byte(self) -> u8 {
        match self {
            SourceRule::BelowMinimum => 0x01,
            SourceRule::Overcapacity => 0x02,
            SourceRule::GrowthCandidate => 0x03,
            SourceRule::GrowthScaling => 0x04,
            SourceRule::StoreFloorTopUp => 0x05,
        }
    }
}

impl std::fmt::Display for SourceRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown rule name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown source rule '{0}'")]
pub struct UnknownSourceRule(pub String);

impl FromStr for SourceRule {
    type Err = UnknownSourceRule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "below_minimum" => Ok(SourceRule::BelowMinimum),
            "overcapacity" => Ok(SourceRule::Overcapacity),
            "growth_candidate" => Ok(SourceRule::GrowthCandidate),
            "growth_scaling" => Ok(SourceRule::GrowthScaling),
            "store_floor_top_up" => Ok(SourceRule::StoreFloorTopUp),
            _ => Err(UnknownSourceRule(s.to_string())),
        }
    }
}

// =============================================================================
// Adjustment Record
// =============================================================================

/// One proposed change for one (store, product) from one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentRecord {
    pub store_id: StoreId,
    pub product_id: ProductId,
    pub subcategory: String,
    pub cluster_id: ClusterId,

    pub source_rule: SourceRule,

    /// Signed recommended change (positive = increase).
    pub quantity_delta: f64,
    /// `quantity_delta * unit_price`.
    pub investment_delta: f64,

    pub current_quantity: f64,
    pub unit_price: f64,

    pub rationale_tags: BTreeSet<String>,

    /// Unknown extra columns of the source row, kept verbatim.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AdjustmentRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store_id: StoreId,
        product_id: ProductId,
        subcategory: impl Into<String>,
        cluster_id: ClusterId,
        source_rule: SourceRule,
        quantity_delta: f64,
        current_quantity: f64,
        unit_price: f64,
    ) -> Self {
        Self {
            store_id,
            product_id,
            subcategory: subcategory.into(),
            cluster_id,
            source_rule,
            quantity_delta,
            investment_delta: quantity_delta * unit_price,
            current_quantity,
            unit_price,
            rationale_tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey {
            store_id: self.store_id.clone(),
            product_id: self.product_id.clone(),
        }
    }

    pub fn family_key(&self) -> FamilyKey {
        FamilyKey {
            store_id: self.store_id.clone(),
            subcategory: self.subcategory.clone(),
        }
    }

    /// Copy with a new delta; investment is recomputed.
    pub fn with_quantity_delta(&self, quantity_delta: f64) -> Self {
        Self {
            quantity_delta,
            investment_delta: quantity_delta * self.unit_price,
            ..self.clone()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.rationale_tags.insert(tag.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.rationale_tags.contains(tag)
    }

    /// Numeric metadata value, if present and parseable.
    pub fn metadata_f64(&self, column: &str) -> Option<f64> {
        self.metadata
            .get(column)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }

    /// Does the delta carry the sign its rule requires?
    pub fn sign_matches_rule(&self) -> bool {
        self.source_rule.direction().matches(self.quantity_delta)
    }
}

// =============================================================================
// Family Adjustment
// =============================================================================

/// Subcategory-wide adjustment to be split across sibling SKUs at one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyAdjustment {
    pub store_id: StoreId,
    pub subcategory: String,
    pub cluster_id: ClusterId,
    pub source_rule: SourceRule,

    /// Signed family total.
    pub total_delta: f64,

    /// Current quantity across the family at this store.
    pub current_quantity: f64,
    /// Representative unit price for family-level investment.
    pub unit_price: f64,

    pub rationale_tags: BTreeSet<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl FamilyAdjustment {
    pub fn family_key(&self) -> FamilyKey {
        FamilyKey {
            store_id: self.store_id.clone(),
            subcategory: self.subcategory.clone(),
        }
    }

    /// Family adjustment viewed as a single record for boundary and cap
    /// evaluation. The product id is the subcategory.
    pub fn as_aggregate_record(&self) -> AdjustmentRecord {
        AdjustmentRecord {
            store_id: self.store_id.clone(),
            product_id: ProductId::new(self.subcategory.clone()),
            subcategory: self.subcategory.clone(),
            cluster_id: self.cluster_id.clone(),
            source_rule: self.source_rule,
            quantity_delta: self.total_delta,
            investment_delta: self.total_delta * self.unit_price,
            current_quantity: self.current_quantity,
            unit_price: self.unit_price,
            rationale_tags: self.rationale_tags.clone(),
            metadata: self.metadata.clone(),
        }
    }
}
