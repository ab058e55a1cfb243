//! # Peer Clusters & Benchmarks
//!
//! Store→cluster mapping and per-cluster quantity statistics computed from
//! the materialized run inputs.
//!
//! ## Invariants
//! - Stores absent from the cluster table resolve to `unassigned`, whose
//!   size is 0; their observations feed no peer statistics, so every
//!   cluster-based cap and floor is skipped for them
//! - Cluster-based caps and floors gate on `PeerStats::store_count`, the
//!   distinct stores behind a statistic, never on the cluster's size
//! - One observation per (store, product): the first one seen wins
//! - Percentiles use linear interpolation between closest ranks

use serde::{Deserialize, Serialize};
use shelfplan_models::{ClusterId, ProductId, StoreId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

// =============================================================================
// Peer Clusters
// =============================================================================

/// One row of the peer-cluster table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub store_id: StoreId,
    pub cluster_id: ClusterId,
}

/// Store→cluster mapping with cluster sizes.
#[derive(Debug, Clone, Default)]
pub struct PeerClusters {
    by_store: BTreeMap<StoreId, ClusterId>,
    sizes: BTreeMap<ClusterId, usize>,
}

impl PeerClusters {
    pub fn from_assignments(assignments: impl IntoIterator<Item = ClusterAssignment>) -> Self {
        let mut by_store = BTreeMap::new();
        for a in assignments {
            let store = StoreId::new(a.store_id.0);
            let cluster = ClusterId::new(a.cluster_id.0);
            if let Some(existing) = by_store.get(&store) {
                if existing != &cluster {
                    warn!(
                        store = %store,
                        kept = %existing,
                        ignored = %cluster,
                        "Store assigned to more than one cluster"
                    );
                }
                continue;
            }
            by_store.insert(store, cluster);
        }

        let mut sizes = BTreeMap::new();
        for cluster in by_store.values() {
            *sizes.entry(cluster.clone()).or_insert(0) += 1;
        }

        Self { by_store, sizes }
    }

    pub fn cluster_of(&self, store: &StoreId) -> Option<&ClusterId> {
        self.by_store.get(store)
    }

    /// Cluster for `store`, or `unassigned`.
    pub fn resolve(&self, store: &StoreId) -> ClusterId {
        self.cluster_of(store)
            .cloned()
            .unwrap_or_else(ClusterId::unassigned)
    }

    /// Stores in the cluster; 0 for `unassigned` and unknown clusters.
    pub fn cluster_size(&self, cluster: &ClusterId) -> usize {
        if cluster.is_unassigned() {
            return 0;
        }
        self.sizes.get(cluster).copied().unwrap_or(0)
    }

    pub fn store_count(&self) -> usize {
        self.by_store.len()
    }
}

// =============================================================================
// Percentiles
// =============================================================================

/// Linear-interpolated percentile of an ascending slice. `q` in [0, 1].
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Fraction of values at or below `value`.
pub fn percentile_rank(sorted: &[f64], value: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let at_or_below = sorted.partition_point(|v| *v <= value);
    Some(at_or_below as f64 / sorted.len() as f64)
}

/// Label for a percentile fraction, e.g. 0.75 → "P75".
pub fn percentile_label(q: f64) -> String {
    format!("P{}", (q * 100.0).round() as i64)
}

// =============================================================================
// Peer Benchmarks
// =============================================================================

/// Current inventory of one SKU at one store.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryObservation {
    pub store_id: StoreId,
    pub product_id: ProductId,
    pub subcategory: String,
    pub current_quantity: f64,
}

/// Statistics of one distribution of peer values.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerStats {
    /// Ascending values, one per observation.
    values: Vec<f64>,
    /// Distinct stores contributing values.
    stores: usize,
    pub median: f64,
    pub p10: f64,
    pub benchmark: f64,
}

impl PeerStats {
    fn from_values(mut values: Vec<f64>, stores: usize, benchmark_q: f64) -> Option<Self> {
        values.sort_by(f64::total_cmp);
        Some(Self {
            median: percentile(&values, 0.5)?,
            p10: percentile(&values, 0.10)?,
            benchmark: percentile(&values, benchmark_q)?,
            values,
            stores,
        })
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn store_count(&self) -> usize {
        self.stores
    }

    pub fn rank_of(&self, value: f64) -> Option<f64> {
        percentile_rank(&self.values, value)
    }
}

/// Per-cluster statistics of current quantity.
#[derive(Debug, Clone)]
pub struct PeerBenchmarks {
    benchmark_percentile: f64,
    /// (cluster, product) → across stores.
    by_product: BTreeMap<(ClusterId, ProductId), PeerStats>,
    /// (cluster, subcategory) → per-SKU values across all stores.
    by_subcategory_sku: BTreeMap<(ClusterId, String), PeerStats>,
    /// (cluster, subcategory) → per-store family totals.
    by_family: BTreeMap<(ClusterId, String), PeerStats>,
}

impl PeerBenchmarks {
    pub fn build(
        clusters: &PeerClusters,
        observations: impl IntoIterator<Item = InventoryObservation>,
        benchmark_percentile: f64,
    ) -> Self {
        let mut seen: BTreeSet<(StoreId, ProductId)> = BTreeSet::new();
        let mut product_values: BTreeMap<(ClusterId, ProductId), Vec<f64>> = BTreeMap::new();
        let mut sku_values: BTreeMap<(ClusterId, String), (Vec<f64>, BTreeSet<StoreId>)> =
            BTreeMap::new();
        let mut family_totals: BTreeMap<(ClusterId, String), BTreeMap<StoreId, f64>> =
            BTreeMap::new();

        for obs in observations {
            if !obs.current_quantity.is_finite() {
                continue;
            }
            if !seen.insert((obs.store_id.clone(), obs.product_id.clone())) {
                continue;
            }
            let Some(cluster) = clusters.cluster_of(&obs.store_id) else {
                continue;
            };
            product_values
                .entry((cluster.clone(), obs.product_id.clone()))
                .or_default()
                .push(obs.current_quantity);
            let (values, stores) = sku_values
                .entry((cluster.clone(), obs.subcategory.clone()))
                .or_default();
            values.push(obs.current_quantity);
            stores.insert(obs.store_id.clone());
            *family_totals
                .entry((cluster.clone(), obs.subcategory))
                .or_default()
                .entry(obs.store_id)
                .or_insert(0.0) += obs.current_quantity;
        }

        let stats = |values: Vec<f64>, stores: usize| {
            PeerStats::from_values(values, stores, benchmark_percentile)
        };

        Self {
            benchmark_percentile,
            // One observation per (store, product), so one value per store.
            by_product: product_values
                .into_iter()
                .filter_map(|(k, v)| {
                    let stores = v.len();
                    stats(v, stores).map(|s| (k, s))
                })
                .collect(),
            by_subcategory_sku: sku_values
                .into_iter()
                .filter_map(|(k, (v, stores))| stats(v, stores.len()).map(|s| (k, s)))
                .collect(),
            by_family: family_totals
                .into_iter()
                .filter_map(|(k, per_store)| {
                    let stores = per_store.len();
                    stats(per_store.into_values().collect(), stores).map(|s| (k, s))
                })
                .collect(),
        }
    }

    pub fn benchmark_percentile(&self) -> f64 {
        self.benchmark_percentile
    }

    pub fn benchmark_label(&self) -> String {
        percentile_label(self.benchmark_percentile)
    }

    pub fn product(&self, cluster: &ClusterId, product: &ProductId) -> Option<&PeerStats> {
        self.by_product.get(&(cluster.clone(), product.clone()))
    }

    pub fn subcategory_skus(&self, cluster: &ClusterId, subcategory: &str) -> Option<&PeerStats> {
        self.by_subcategory_sku
            .get(&(cluster.clone(), subcategory.to_string()))
    }

    pub fn family(&self, cluster: &ClusterId, subcategory: &str) -> Option<&PeerStats> {
        self.by_family.get(&(cluster.clone(), subcategory.to_string()))
    }
}
