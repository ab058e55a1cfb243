//! # shelfplan models
//!
//! Canonical data model shared by every stage of the adjustment
//! consolidation pipeline.
//!
//! ## Lifecycle
//! - `AdjustmentRecord` / `FamilyAdjustment`: produced once per run from
//!   rule generator tables, consumed by consolidation
//! - `ConsolidatedRecord` + `TraceabilityRecord`: durable run output,
//!   never mutated after construction
//! - `Rejection`: one per dropped candidate, counted in the run summary

pub mod adjustment;
pub mod consolidated;
pub mod floor;
pub mod ids;
pub mod rejection;

pub use adjustment::{
    AdjustmentRecord, Direction, FamilyAdjustment, SourceRule, TAG_CORE_PROTECTED,
    TAG_EXPLORATION, TAG_FAMILY_ALLOCATED, TAG_PEER_BENCHMARK_LAG, UnknownSourceRule,
};
pub use consolidated::{
    BenchmarkValues, CapKind, ConsolidatedRecord, FloorBinding, GuardrailClearance,
    GuardrailStage, ScalingFactors, ScalingTier, TraceabilityRecord, Veto, write_string,
};
pub use floor::{FloorSource, MinimumReference};
pub use ids::{ClusterId, FamilyKey, ItemKey, ProductId, StoreId};
pub use rejection::{Rejection, RejectionClass, RejectionReason};

/// Absolute tolerance for floating-point invariants (conservation, rollups, floors).
pub const TOLERANCE: f64 = 1e-6;
