//! # Pipeline Configuration
//!
//! Declarative, immutable configuration for one consolidation run.
//!
//! ## Hard Laws
//! - L1: Immutable: a loaded config is shared read-only by every stage
//! - L2: Explicit: exploration cap and store volume floor have no serde
//!   defaults; they must be stated in the file or come from a preset
//! - L3: Fingerprinted: every config has a deterministic SHA-256 fingerprint
//! - L4: Ordered: `stages` is the declared precedence of rule stages
//!
//! Percentages are fractions: 0.40 means 40%.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shelfplan_models::{SourceRule, write_string};
use thiserror::Error;

// =============================================================================
// Schema Version
// =============================================================================

pub const PIPELINE_CONFIG_SCHEMA_VERSION: &str = "pipeline_config_v1.0";

/// Default cluster percentile used as the peer benchmark (P75).
pub const DEFAULT_BENCHMARK_PERCENTILE: f64 = 0.75;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Unsupported config version: expected {expected}, found {found}")]
    UnsupportedVersion { expected: String, found: String },

    #[error("Pipeline declares no stages")]
    EmptyStages,

    #[error("Stage '{rule}' is declared more than once")]
    DuplicateStage { rule: SourceRule },

    #[error("Rule '{rule}' is internal and cannot be declared as a stage")]
    InternalRuleAsStage { rule: SourceRule },

    #[error("Invalid guardrail for stage '{rule}': {field} = {value}, expected {expected}")]
    InvalidGuardrail {
        rule: SourceRule,
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Invalid {section} setting: {field} = {value}, expected {expected}")]
    InvalidSetting {
        section: &'static str,
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

// =============================================================================
// Guardrail Config (per stage)
// =============================================================================

/// Per-stage guardrail configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailConfig {
    /// Max increase as a fraction of current quantity.
    pub max_increase_pct: f64,

    /// Max reduction as a fraction of current quantity (standard items).
    pub max_reduction_pct: f64,

    /// Minimum stores in a cluster for a valid peer comparison.
    pub min_cluster_size: usize,

    /// Max reduction for core subcategories. Strictly tighter than `max_reduction_pct`.
    pub core_subcategory_max_reduction_pct: f64,

    /// Reductions never touch keys increased by an earlier stage.
    pub respect_prior_increases: bool,

    /// Records must match the approved candidate set.
    pub require_upstream_candidate: bool,

    /// Max magnitude as a fraction of the peer cluster median.
    pub max_cluster_median_pct: f64,

    /// Hard unit ceiling per record.
    pub max_abs_units: f64,

    /// Capped magnitudes below this are zeroed.
    pub min_recommend_qty: f64,
}

impl GuardrailConfig {
    /// Preset for floor-raising stages.
    pub fn floor_increase() -> Self {
        Self {
            max_increase_pct: 1.0,
            max_reduction_pct: 0.4,
            min_cluster_size: 3,
            core_subcategory_max_reduction_pct: 0.2,
            respect_prior_increases: false,
            require_upstream_candidate: false,
            max_cluster_median_pct: 1.0,
            max_abs_units: 20.0,
            min_recommend_qty: 1.0,
        }
    }

    /// Preset for overcapacity reduction stages.
    pub fn reduction() -> Self {
        Self {
            max_increase_pct: 0.5,
            max_reduction_pct: 0.4,
            min_cluster_size: 3,
            core_subcategory_max_reduction_pct: 0.2,
            respect_prior_increases: true,
            require_upstream_candidate: false,
            max_cluster_median_pct: 0.6,
            max_abs_units: 30.0,
            min_recommend_qty: 1.0,
        }
    }

    /// Preset for performance-gap growth candidates.
    pub fn growth_candidate() -> Self {
        Self {
            max_increase_pct: 0.5,
            max_reduction_pct: 0.4,
            min_cluster_size: 3,
            core_subcategory_max_reduction_pct: 0.2,
            respect_prior_increases: false,
            require_upstream_candidate: false,
            max_cluster_median_pct: 0.5,
            max_abs_units: 15.0,
            min_recommend_qty: 1.0,
        }
    }

    /// Preset for growth scaling over approved candidates.
    pub fn growth_scaling() -> Self {
        Self {
            max_increase_pct: 0.5,
            max_reduction_pct: 0.4,
            min_cluster_size: 3,
            core_subcategory_max_reduction_pct: 0.2,
            respect_prior_increases: false,
            require_upstream_candidate: true,
            max_cluster_median_pct: 0.5,
            max_abs_units: 12.0,
            min_recommend_qty: 1.0,
        }
    }

    /// Validate limits for the stage that owns this guardrail.
    pub fn validate(&self, rule: SourceRule) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, value: String, expected: &'static str| {
            Err(ConfigError::InvalidGuardrail {
                rule,
                field,
                value,
                expected,
            })
        };

        if !(self.max_increase_pct >= 0.0 && self.max_increase_pct.is_finite()) {
            return invalid(
                "max_increase_pct",
                self.max_increase_pct.to_string(),
                "finite and >= 0",
            );
        }
        if !(0.0..=1.0).contains(&self.max_reduction_pct) {
            return invalid(
                "max_reduction_pct",
                self.max_reduction_pct.to_string(),
                "within [0, 1]",
            );
        }
        if !(0.0..=1.0).contains(&self.core_subcategory_max_reduction_pct) {
            return invalid(
                "core_subcategory_max_reduction_pct",
                self.core_subcategory_max_reduction_pct.to_string(),
                "within [0, 1]",
            );
        }
        if self.core_subcategory_max_reduction_pct >= self.max_reduction_pct {
            return invalid(
                "core_subcategory_max_reduction_pct",
                self.core_subcategory_max_reduction_pct.to_string(),
                "strictly below max_reduction_pct",
            );
        }
        if !(self.max_cluster_median_pct >= 0.0 && self.max_cluster_median_pct.is_finite()) {
            return invalid(
                "max_cluster_median_pct",
                self.max_cluster_median_pct.to_string(),
                "finite and >= 0",
            );
        }
        if !(self.max_abs_units > 0.0 && self.max_abs_units.is_finite()) {
            return invalid(
                "max_abs_units",
                self.max_abs_units.to_string(),
                "finite and > 0",
            );
        }
        if !(self.min_recommend_qty >= 0.0 && self.min_recommend_qty < self.max_abs_units) {
            return invalid(
                "min_recommend_qty",
                self.min_recommend_qty.to_string(),
                ">= 0 and below max_abs_units",
            );
        }
        if self.min_cluster_size == 0 {
            return invalid("min_cluster_size", "0".to_string(), ">= 1");
        }
        Ok(())
    }

    /// Canonical bytes (frozen field order = declaration order).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&self.max_increase_pct.to_bits().to_le_bytes());
        bytes.extend_from_slice(&self.max_reduction_pct.to_bits().to_le_bytes());
        bytes.extend_from_slice(&(self.min_cluster_size as u64).to_le_bytes());
        bytes.extend_from_slice(&self.core_subcategory_max_reduction_pct.to_bits().to_le_bytes());
        bytes.push(self.respect_prior_increases as u8);
        bytes.push(self.require_upstream_candidate as u8);
        bytes.extend_from_slice(&self.max_cluster_median_pct.to_bits().to_le_bytes());
        bytes.extend_from_slice(&self.max_abs_units.to_bits().to_le_bytes());
        bytes.extend_from_slice(&self.min_recommend_qty.to_bits().to_le_bytes());
        bytes
    }
}

/// One declared stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub rule: SourceRule,
    pub guardrail: GuardrailConfig,
}

// =============================================================================
// Allocation / Floors / Store Floor
// =============================================================================

/// Family allocation settings. No defaults: both fields are required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Max fraction of a family total any exploration sibling may receive.
    pub exploration_cap_fraction: f64,

    /// Siblings whose trailing sales share is below this are exploration siblings.
    pub exploration_share_threshold: f64,
}

fn default_benchmark_percentile() -> f64 {
    DEFAULT_BENCHMARK_PERCENTILE
}

/// Floor resolution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloorConfig {
    /// Per-SKU floor used when no manual or cluster value is positive.
    pub global_fallback_min_units: f64,

    /// Cluster percentile used as the peer benchmark.
    #[serde(default = "default_benchmark_percentile")]
    pub benchmark_percentile: f64,

    /// Minimum stores in a cluster before its P10 may set a floor.
    pub min_cluster_size: usize,
}

/// What store volume is measured against the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFloorBasis {
    /// Sum of positive final deltas.
    Positive,
    /// Sum of all final deltas.
    Net,
}

/// What happens to a store under the volume floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFloorPolicy {
    /// Mark the store's records `below_store_floor`.
    Flag,
    /// Top up from approved candidates, flag any remaining shortfall.
    TopUp,
}

/// Minimum store volume floor. No defaults: every field is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreFloorConfig {
    /// Store volume below which the policy applies. 0 disables the floor.
    pub min_store_volume: f64,
    pub basis: StoreFloorBasis,
    pub policy: StoreFloorPolicy,
    /// Max units a single top-up candidate receives.
    pub top_up_max_units_per_sku: f64,
    /// Safety caps applied to every top-up increment.
    pub top_up_guardrail: GuardrailConfig,
}

impl StoreFloorConfig {
    pub fn is_enabled(&self) -> bool {
        self.min_store_volume > 0.0
    }
}

// =============================================================================
// Pipeline Config
// =============================================================================

/// Root configuration for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub schema_version: String,

    /// Preset or profile name (informational, fingerprinted).
    pub name: String,

    /// Core subcategory file. Absent ⇒ built-in list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_categories_path: Option<String>,

    /// Declared stage precedence.
    pub stages: Vec<StageConfig>,

    pub allocation: AllocationConfig,
    pub floor: FloorConfig,
    pub store_floor: StoreFloorConfig,
}

impl PipelineConfig {
    /// Standard preset: below-minimum → overcapacity → growth candidate → growth scaling.
    pub fn standard() -> Self {
        Self {
            schema_version: PIPELINE_CONFIG_SCHEMA_VERSION.to_string(),
            name: "standard".to_string(),
            stages: vec![
                StageConfig {
                    rule: SourceRule::BelowMinimum,
                    guardrail: GuardrailConfig::floor_increase(),
                },
                StageConfig {
                    rule: SourceRule::Overcapacity,
                    guardrail: GuardrailConfig::reduction(),
                },
                StageConfig {
                    rule: SourceRule::GrowthCandidate,
                    guardrail: GuardrailConfig::growth_candidate(),
                },
                StageConfig {
                    rule: SourceRule::GrowthScaling,
                    guardrail: GuardrailConfig::growth_scaling(),
                },
            ],
            allocation: AllocationConfig {
                exploration_cap_fraction: 0.15,
                exploration_share_threshold: 0.05,
            },
            floor: FloorConfig {
                global_fallback_min_units: 2.0,
                benchmark_percentile: DEFAULT_BENCHMARK_PERCENTILE,
                min_cluster_size: 3,
            },
            store_floor: StoreFloorConfig {
                min_store_volume: 0.0,
                basis: StoreFloorBasis::Positive,
                policy: StoreFloorPolicy::Flag,
                top_up_max_units_per_sku: 3.0,
                top_up_guardrail: GuardrailConfig::growth_scaling(),
            },
            core_categories_path: None,
        }
    }

    /// Conservative preset: tighter reductions and growth, store floor flagged.
    pub fn conservative() -> Self {
        let mut config = Self::standard();
        config.name = "conservative".to_string();
        let guardrails = config
            .stages
            .iter_mut()
            .map(|s| &mut s.guardrail)
            .chain(std::iter::once(&mut config.store_floor.top_up_guardrail));
        for g in guardrails {
            g.max_reduction_pct = 0.25;
            g.core_subcategory_max_reduction_pct = 0.1;
            g.max_increase_pct = g.max_increase_pct.min(0.3);
            g.max_abs_units = g.max_abs_units.min(10.0);
        }
        config.allocation.exploration_cap_fraction = 0.10;
        config.store_floor.min_store_volume = 5.0;
        config
    }

    pub fn stage(&self, rule: SourceRule) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.rule == rule)
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_version != PIPELINE_CONFIG_SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                expected: PIPELINE_CONFIG_SCHEMA_VERSION.to_string(),
                found: self.schema_version.clone(),
            });
        }

        if self.stages.is_empty() {
            return Err(ConfigError::EmptyStages);
        }

        let mut seen = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            if stage.rule == SourceRule::StoreFloorTopUp {
                return Err(ConfigError::InternalRuleAsStage { rule: stage.rule });
            }
            if seen.contains(&stage.rule) {
                return Err(ConfigError::DuplicateStage { rule: stage.rule });
            }
            seen.push(stage.rule);
            stage.guardrail.validate(stage.rule)?;
        }

        let a = &self.allocation;
        if !(a.exploration_cap_fraction > 0.0 && a.exploration_cap_fraction <= 1.0) {
            return Err(ConfigError::InvalidSetting {
                section: "allocation",
                field: "exploration_cap_fraction",
                value: a.exploration_cap_fraction.to_string(),
                expected: "within (0, 1]",
            });
        }
        if !(a.exploration_share_threshold >= 0.0 && a.exploration_share_threshold < 1.0) {
            return Err(ConfigError::InvalidSetting {
                section: "allocation",
                field: "exploration_share_threshold",
                value: a.exploration_share_threshold.to_string(),
                expected: "within [0, 1)",
            });
        }

        let f = &self.floor;
        if !(f.global_fallback_min_units >= 0.0 && f.global_fallback_min_units.is_finite()) {
            return Err(ConfigError::InvalidSetting {
                section: "floor",
                field: "global_fallback_min_units",
                value: f.global_fallback_min_units.to_string(),
                expected: "finite and >= 0",
            });
        }
        if !(f.benchmark_percentile > 0.0 && f.benchmark_percentile < 1.0) {
            return Err(ConfigError::InvalidSetting {
                section: "floor",
                field: "benchmark_percentile",
                value: f.benchmark_percentile.to_string(),
                expected: "within (0, 1)",
            });
        }
        if f.min_cluster_size == 0 {
            return Err(ConfigError::InvalidSetting {
                section: "floor",
                field: "min_cluster_size",
                value: "0".to_string(),
                expected: ">= 1",
            });
        }

        let s = &self.store_floor;
        if !(s.min_store_volume >= 0.0 && s.min_store_volume.is_finite()) {
            return Err(ConfigError::InvalidSetting {
                section: "store_floor",
                field: "min_store_volume",
                value: s.min_store_volume.to_string(),
                expected: "finite and >= 0",
            });
        }
        if s.policy == StoreFloorPolicy::TopUp && !(s.top_up_max_units_per_sku > 0.0) {
            return Err(ConfigError::InvalidSetting {
                section: "store_floor",
                field: "top_up_max_units_per_sku",
                value: s.top_up_max_units_per_sku.to_string(),
                expected: "> 0 when policy = top_up",
            });
        }
        s.top_up_guardrail.validate(SourceRule::StoreFloorTopUp)?;

        Ok(())
    }

    /// Compute deterministic fingerprint (SHA-256).
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        let mut bytes = Vec::new();

        write_string(&mut bytes, &self.schema_version);
        write_string(&mut bytes, &self.name);

        bytes.extend_from_slice(&(self.stages.len() as u32).to_le_bytes());
        for stage in &self.stages {
            bytes.push(stage.rule.canonical_byte());
            bytes.extend_from_slice(&stage.guardrail.canonical_bytes());
        }

        bytes.extend_from_slice(&self.allocation.exploration_cap_fraction.to_bits().to_le_bytes());
        bytes.extend_from_slice(
            &self
                .allocation
                .exploration_share_threshold
                .to_bits()
                .to_le_bytes(),
        );

        bytes.extend_from_slice(&self.floor.global_fallback_min_units.to_bits().to_le_bytes());
        bytes.extend_from_slice(&self.floor.benchmark_percentile.to_bits().to_le_bytes());
        bytes.extend_from_slice(&(self.floor.min_cluster_size as u64).to_le_bytes());

        bytes.extend_from_slice(&self.store_floor.min_store_volume.to_bits().to_le_bytes());
        bytes.push(match self.store_floor.basis {
            StoreFloorBasis::Positive => 0,
            StoreFloorBasis::Net => 1,
        });
        bytes.push(match self.store_floor.policy {
            StoreFloorPolicy::Flag => 0,
            StoreFloorPolicy::TopUp => 1,
        });
        bytes.extend_from_slice(&self.store_floor.top_up_max_units_per_sku.to_bits().to_le_bytes());
        bytes.extend_from_slice(&self.store_floor.top_up_guardrail.canonical_bytes());

        match &self.core_categories_path {
            None => bytes.push(0x00),
            Some(path) => {
                bytes.push(0x01);
                write_string(&mut bytes, path);
            }
        }

        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }
}
