//! Minimum references (protected floors).

use crate::ids::StoreId;
use serde::{Deserialize, Serialize};

/// Where a floor value came from. Ordered by precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloorSource {
    /// Positive manual plan minimum.
    ManualPlan,
    /// Positive cluster 10th-percentile unit rate.
    ClusterP10,
    /// Global fallback constant.
    GlobalFallback,
}

impl FloorSource {
    pub fn as_str(self) -> &'static str {
        match self {
            FloorSource::ManualPlan => "manual_plan",
            FloorSource::ClusterP10 => "cluster_p10",
            FloorSource::GlobalFallback => "global_fallback",
        }
    }
}

impl std::fmt::Display for FloorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved per-SKU unit floor for a (store, subcategory).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinimumReference {
    pub store_id: StoreId,
    pub subcategory: String,
    pub floor_value: f64,
    pub source: FloorSource,
}

impl MinimumReference {
    /// Largest reduction that keeps `position` at or above the floor.
    ///
    /// Returns a value in `[reduction, 0]`. Never positive.
    pub fn clamp_reduction(&self, position: f64, reduction: f64) -> f64 {
        if reduction >= 0.0 {
            return reduction;
        }
        let headroom = position - self.floor_value;
        if headroom <= 0.0 {
            return 0.0;
        }
        reduction.max(-headroom)
    }
}
