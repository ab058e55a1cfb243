//! # Rollup Aggregator
//!
//! Per-store and per-(cluster, subcategory) summaries of the detail table.
//!
//! ## Invariants
//! - Pure summation over the detail records, visited in detail order
//! - Rollups are keyed and emitted in `BTreeMap` order
//! - `verify_rollups` holds: every rollup total equals the sum of its
//!   detail rows within `TOLERANCE`

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use shelfplan_models::{ClusterId, ConsolidatedRecord, StoreId, TOLERANCE};
use thiserror::Error;
use tracing::debug;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum AggregationError {
    #[error("store {store_id}: {field} rollup {rollup} != detail sum {detail}")]
    StoreMismatch {
        store_id: String,
        field: &'static str,
        rollup: f64,
        detail: f64,
    },

    #[error("cluster {cluster_id} / {subcategory}: {field} rollup {rollup} != detail sum {detail}")]
    ClusterSubcategoryMismatch {
        cluster_id: String,
        subcategory: String,
        field: &'static str,
        rollup: f64,
        detail: f64,
    },

    #[error("rollup group {group} has no detail rows")]
    OrphanRollup { group: String },

    #[error("detail group {group} has no rollup row")]
    MissingRollup { group: String },
}

// =============================================================================
// Summaries
// =============================================================================

/// Shared running totals for one rollup group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollupTotals {
    pub records: usize,
    pub increase_records: usize,
    pub reduction_records: usize,
    pub quantity_delta: f64,
    pub investment_delta: f64,
    pub increase_units: f64,
    pub reduction_units: f64,
}

impl RollupTotals {
    fn add(&mut self, record: &ConsolidatedRecord) {
        let delta = record.final_quantity_delta;
        self.records += 1;
        self.quantity_delta += delta;
        self.investment_delta += record.final_investment_delta;
        if delta > TOLERANCE {
            self.increase_records += 1;
            self.increase_units += delta;
        } else if delta < -TOLERANCE {
            self.reduction_records += 1;
            self.reduction_units += -delta;
        }
    }
}

/// One row of the store summary table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSummary {
    pub store_id: StoreId,
    pub cluster_id: ClusterId,
    #[serde(flatten)]
    pub totals: RollupTotals,
    /// Any record of the store was flagged below the store volume floor.
    pub below_store_floor: bool,
}

/// One row of the cluster × subcategory summary table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSubcategorySummary {
    pub cluster_id: ClusterId,
    pub subcategory: String,
    /// Distinct stores with at least one record in the group.
    pub stores: usize,
    #[serde(flatten)]
    pub totals: RollupTotals,
}

/// Both rollup tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rollups {
    pub stores: Vec<StoreSummary>,
    pub cluster_subcategories: Vec<ClusterSubcategorySummary>,
}

// =============================================================================
// Aggregation
// =============================================================================

/// Build both rollups from the detail records.
pub fn aggregate(records: &[ConsolidatedRecord]) -> Rollups {
    let mut stores: BTreeMap<StoreId, StoreSummary> = BTreeMap::new();
    let mut groups: BTreeMap<(ClusterId, String), (BTreeSet<StoreId>, RollupTotals)> =
        BTreeMap::new();

    for record in records {
        let store = stores
            .entry(record.store_id.clone())
            .or_insert_with(|| StoreSummary {
                store_id: record.store_id.clone(),
                cluster_id: record.cluster_id.clone(),
                totals: RollupTotals::default(),
                below_store_floor: false,
            });
        store.totals.add(record);
        store.below_store_floor |= record.below_store_floor;

        let (members, totals) = groups
            .entry((record.cluster_id.clone(), record.subcategory.clone()))
            .or_default();
        members.insert(record.store_id.clone());
        totals.add(record);
    }

    debug!(
        stores = stores.len(),
        groups = groups.len(),
        records = records.len(),
        "rollups aggregated"
    );

    Rollups {
        stores: stores.into_values().collect(),
        cluster_subcategories: groups
            .into_iter()
            .map(|((cluster_id, subcategory), (members, totals))| ClusterSubcategorySummary {
                cluster_id,
                subcategory,
                stores: members.len(),
                totals,
            })
            .collect(),
    }
}

// =============================================================================
// Verification
// =============================================================================

/// Check that every rollup row equals the sum of its detail rows.
pub fn verify_rollups(
    records: &[ConsolidatedRecord],
    rollups: &Rollups,
) -> Result<(), AggregationError> {
    let mut store_sums: BTreeMap<&StoreId, (f64, f64)> = BTreeMap::new();
    let mut group_sums: BTreeMap<(&ClusterId, &str), (f64, f64)> = BTreeMap::new();
    for record in records {
        let s = store_sums.entry(&record.store_id).or_default();
        s.0 += record.final_quantity_delta;
        s.1 += record.final_investment_delta;
        let g = group_sums
            .entry((&record.cluster_id, record.subcategory.as_str()))
            .or_default();
        g.0 += record.final_quantity_delta;
        g.1 += record.final_investment_delta;
    }

    for row in &rollups.stores {
        let Some(&(quantity, investment)) = store_sums.get(&row.store_id) else {
            return Err(AggregationError::OrphanRollup {
                group: format!("store {}", row.store_id),
            });
        };
        for (field, rollup, detail) in [
            ("quantity_delta", row.totals.quantity_delta, quantity),
            ("investment_delta", row.totals.investment_delta, investment),
        ] {
            if (rollup - detail).abs() > TOLERANCE {
                return Err(AggregationError::StoreMismatch {
                    store_id: row.store_id.to_string(),
                    field,
                    rollup,
                    detail,
                });
            }
        }
    }
    if store_sums.len() != rollups.stores.len() {
        let covered: BTreeSet<&StoreId> = rollups.stores.iter().map(|r| &r.store_id).collect();
        if let Some(missing) = store_sums.keys().find(|id| !covered.contains(*id)) {
            return Err(AggregationError::MissingRollup {
                group: format!("store {missing}"),
            });
        }
    }

    for row in &rollups.cluster_subcategories {
        let key = (&row.cluster_id, row.subcategory.as_str());
        let Some(&(quantity, investment)) = group_sums.get(&key) else {
            return Err(AggregationError::OrphanRollup {
                group: format!("{} / {}", row.cluster_id, row.subcategory),
            });
        };
        for (field, rollup, detail) in [
            ("quantity_delta", row.totals.quantity_delta, quantity),
            ("investment_delta", row.totals.investment_delta, investment),
        ] {
            if (rollup - detail).abs() > TOLERANCE {
                return Err(AggregationError::ClusterSubcategoryMismatch {
                    cluster_id: row.cluster_id.to_string(),
                    subcategory: row.subcategory.clone(),
                    field,
                    rollup,
                    detail,
                });
            }
        }
    }
    if group_sums.len() != rollups.cluster_subcategories.len() {
        let covered: BTreeSet<(&ClusterId, &str)> = rollups
            .cluster_subcategories
            .iter()
            .map(|r| (&r.cluster_id, r.subcategory.as_str()))
            .collect();
        if let Some((cluster, subcategory)) = group_sums.keys().find(|k| !covered.contains(*k)) {
            return Err(AggregationError::MissingRollup {
                group: format!("{cluster} / {subcategory}"),
            });
        }
    }

    Ok(())
}
