//! Minimum reference resolution.
//!
//! Precedence per (store, subcategory): positive manual plan minimum →
//! positive cluster P10 of per-SKU current quantity (at least
//! `min_cluster_size` distinct peer stores carry the subcategory) → global
//! fallback constant.

use crate::config::FloorConfig;
use crate::peers::PeerBenchmarks;
use serde::{Deserialize, Serialize};
use shelfplan_models::{ClusterId, FamilyKey, FloorSource, MinimumReference, StoreId};
use std::collections::BTreeMap;

/// One row of the manual minimum table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualMinimum {
    pub store_id: StoreId,
    pub subcategory: String,
    pub min_qty: f64,
}

/// Resolves per-SKU unit floors.
#[derive(Debug)]
pub struct FloorResolver<'a> {
    manual: BTreeMap<FamilyKey, f64>,
    benchmarks: &'a PeerBenchmarks,
    config: &'a FloorConfig,
}

impl<'a> FloorResolver<'a> {
    pub fn new(
        manual: &[ManualMinimum],
        benchmarks: &'a PeerBenchmarks,
        config: &'a FloorConfig,
    ) -> Self {
        let mut map = BTreeMap::new();
        for m in manual {
            // Later rows override earlier ones.
            map.insert(FamilyKey::new(m.store_id.as_str(), m.subcategory.as_str()), m.min_qty);
        }
        Self {
            manual: map,
            benchmarks,
            config,
        }
    }

    pub fn resolve(
        &self,
        store_id: &StoreId,
        cluster_id: &ClusterId,
        subcategory: &str,
    ) -> MinimumReference {
        let reference = |floor_value: f64, source: FloorSource| MinimumReference {
            store_id: store_id.clone(),
            subcategory: subcategory.to_string(),
            floor_value,
            source,
        };

        let key = FamilyKey::new(store_id.as_str(), subcategory);
        if let Some(&manual) = self.manual.get(&key) {
            if manual > 0.0 && manual.is_finite() {
                return reference(manual, FloorSource::ManualPlan);
            }
        }

        if let Some(stats) = self.benchmarks.subcategory_skus(cluster_id, subcategory) {
            if stats.store_count() >= self.config.min_cluster_size && stats.p10 > 0.0 {
                return reference(stats.p10, FloorSource::ClusterP10);
            }
        }

        reference(self.config.global_fallback_min_units, FloorSource::GlobalFallback)
    }
}
