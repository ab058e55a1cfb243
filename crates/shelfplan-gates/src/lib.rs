//! # shelfplan gates
//!
//! Rule consolidation and safety-bounded allocation for inventory
//! adjustment recommendations.
//!
//! ## Stage Hierarchy
//! - **Normalizer**: rule tables → canonical adjustment records
//! - **Boundary enforcer**: cross-stage contracts (prior increases,
//!   upstream candidates, minimum floors)
//! - **Safety caps**: simultaneous cap families, tightest wins
//! - **Allocation**: family totals split across sibling SKUs
//! - **Consolidator**: one decision per (store, product), store volume floor
//! - **Traceability**: structured justification per decision
//!
//! ## Usage
//! ```ignore
//! use shelfplan_gates::{CoreCategorySet, PipelineConfig, PipelineInputs, run_pipeline};
//!
//! let config = PipelineConfig::standard();
//! let core = CoreCategorySet::builtin();
//! let output = run_pipeline(&inputs, &config, &core)?;
//! for record in &output.records {
//!     println!("{} {}", record.key(), record.final_quantity_delta);
//! }
//! ```

pub mod allocation;
pub mod boundary;
pub mod caps;
pub mod config;
pub mod consolidator;
pub mod core_categories;
pub mod minimum;
pub mod normalizer;
pub mod peers;
pub mod pipeline;
pub mod traceability;

pub use allocation::{
    AllocationError, AllocationShare, SiblingCatalog, SiblingSales, distribute,
};
pub use boundary::{
    ApprovedCandidate, ApprovedCandidates, BoundaryContract, BoundaryEnforcer, BoundaryLedger,
    BoundaryVerdict, FloorOutcome, PipelineDescriptor, StageDescriptor, clamp_to_floor,
};
pub use caps::{CapContext, CapOutcome, apply_caps};
pub use config::{
    AllocationConfig, ConfigError, DEFAULT_BENCHMARK_PERCENTILE, FloorConfig, GuardrailConfig,
    PIPELINE_CONFIG_SCHEMA_VERSION, PipelineConfig, StageConfig, StoreFloorBasis,
    StoreFloorConfig, StoreFloorPolicy,
};
pub use consolidator::{
    ConsolidationEntry, Consolidator, Contribution, StoreFloorReport,
};
pub use core_categories::{
    ConfigLoadError, CoreCategoryEntry, CoreCategoryFile, CoreCategorySet, CoreCategorySource,
    normalize_category,
};
pub use minimum::{FloorResolver, ManualMinimum};
pub use normalizer::{
    DeltaConvention, NormalizedBatch, RuleNormalizer, RuleSchema, RuleTable, SchemaError,
};
pub use peers::{
    ClusterAssignment, InventoryObservation, PeerBenchmarks, PeerClusters, PeerStats,
    percentile, percentile_label, percentile_rank,
};
pub use pipeline::{PipelineError, PipelineInputs, PipelineOutput, StageStats, run_pipeline};
pub use traceability::{TraceabilityGenerator, tier_for_factor};
