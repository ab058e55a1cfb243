//! # Consolidator
//!
//! Folds surviving, capped contributions into exactly one entry per
//! (store, product), then applies the minimum store volume floor.
//!
//! ## Invariants
//! - One entry per `ItemKey`; iteration order is key order
//! - `contributing_rules` lists rules with a non-zero surviving delta, in
//!   the order contributions were added (stage order)
//! - Vetoes attach only to keys that have at least one contribution; a key
//!   with nothing but rejections produces no entry
//! - Top-ups only add increases and never touch keys with a net reduction
//! - Top-ups pass through the safety cap engine with the store floor's
//!   own guardrail
//! - The first contribution fixes a key's current quantity and unit price;
//!   later disagreeing rows are warned about and listed, never merged

use crate::boundary::ApprovedCandidates;
use crate::caps::{CapContext, apply_caps};
use crate::config::{StoreFloorBasis, StoreFloorConfig, StoreFloorPolicy};
use crate::peers::{PeerBenchmarks, PeerClusters};
use serde::{Deserialize, Serialize};
use shelfplan_models::{
    AdjustmentRecord, CapKind, ClusterId, FloorBinding, ItemKey, Rejection, SourceRule, StoreId,
    TOLERANCE, Veto,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

// =============================================================================
// Entries
// =============================================================================

/// One surviving contribution to a key.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub rule: SourceRule,
    /// Proposed delta before floor clamps and caps.
    pub uncapped_delta: f64,
    pub final_delta: f64,
    pub final_investment: f64,
    /// Floor clamp and binding cap, in application order.
    pub caps: Vec<CapKind>,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Everything known about one key before traceability is generated.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidationEntry {
    pub key: ItemKey,
    pub subcategory: String,
    pub cluster_id: ClusterId,
    pub current_quantity: f64,
    pub unit_price: f64,
    pub contributions: Vec<Contribution>,
    pub vetoes: Vec<Veto>,
    pub floor: Option<FloorBinding>,
    pub below_store_floor: bool,
}

impl ConsolidationEntry {
    /// Contributions moving in the direction of the final delta. A record
    /// whose final delta is zero is explained by all of its contributions.
    fn directional(&self) -> impl Iterator<Item = &Contribution> {
        let sign = self.final_delta();
        self.contributions.iter().filter(move |c| {
            sign.abs() <= TOLERANCE || (c.final_delta != 0.0 && c.final_delta.signum() == sign.signum())
        })
    }

    /// Pre-cap sum over the contributions that produced the final direction.
    pub fn uncapped_delta(&self) -> f64 {
        self.directional().map(|c| c.uncapped_delta).sum()
    }

    pub fn final_delta(&self) -> f64 {
        self.contributions.iter().map(|c| c.final_delta).sum()
    }

    pub fn final_investment(&self) -> f64 {
        self.contributions.iter().map(|c| c.final_investment).sum()
    }

    pub fn contributing_rules(&self) -> Vec<SourceRule> {
        let mut rules = Vec::new();
        for c in &self.contributions {
            if c.final_delta != 0.0 && !rules.contains(&c.rule) {
                rules.push(c.rule);
            }
        }
        rules
    }

    pub fn caps_applied(&self) -> Vec<CapKind> {
        let mut caps = Vec::new();
        for cap in self.directional().flat_map(|c| &c.caps) {
            if !caps.contains(cap) {
                caps.push(*cap);
            }
        }
        caps
    }

    pub fn contribution(&self, rule: SourceRule) -> Option<&Contribution> {
        self.contributions.iter().find(|c| c.rule == rule)
    }

    /// First value of a metadata column across contributions, in stage order.
    pub fn metadata(&self, column: &str) -> Option<&str> {
        self.contributions
            .iter()
            .find_map(|c| c.metadata.get(column))
            .map(String::as_str)
    }

    pub fn tags(&self) -> BTreeSet<&str> {
        self.contributions
            .iter()
            .flat_map(|c| c.tags.iter().map(String::as_str))
            .collect()
    }

    fn store_volume(&self, basis: StoreFloorBasis) -> f64 {
        let delta = self.final_delta();
        match basis {
            StoreFloorBasis::Positive => delta.max(0.0),
            StoreFloorBasis::Net => delta,
        }
    }
}

// =============================================================================
// Store Floor Report
// =============================================================================

/// Outcome of the minimum store volume floor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreFloorReport {
    pub stores_evaluated: usize,
    pub stores_below_floor: Vec<StoreId>,
    pub stores_topped_up: usize,
    pub top_up_records: usize,
    pub top_up_units: f64,
    /// Top-ups bounded by a safety cap (zeroed ones included).
    pub top_ups_capped: usize,
}

// =============================================================================
// Consolidator
// =============================================================================

#[derive(Debug, Default)]
pub struct Consolidator {
    entries: BTreeMap<ItemKey, ConsolidationEntry>,
    vetoes: BTreeMap<ItemKey, Vec<Veto>>,
    conflicts: BTreeSet<ItemKey>,
}

impl Consolidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one surviving contribution.
    ///
    /// `record` carries the final (clamped and capped) delta.
    pub fn add(
        &mut self,
        record: &AdjustmentRecord,
        uncapped_delta: f64,
        caps: Vec<CapKind>,
        floor: Option<FloorBinding>,
    ) {
        if let Some(existing) = self.entries.get(&record.key()) {
            if (existing.current_quantity - record.current_quantity).abs() > TOLERANCE
                || (existing.unit_price - record.unit_price).abs() > TOLERANCE
            {
                warn!(
                    key = %existing.key,
                    rule = %record.source_rule,
                    kept_quantity = existing.current_quantity,
                    seen_quantity = record.current_quantity,
                    kept_price = existing.unit_price,
                    seen_price = record.unit_price,
                    "Inputs disagree on current position; first row kept"
                );
                self.conflicts.insert(existing.key.clone());
            }
        }

        let entry = self
            .entries
            .entry(record.key())
            .or_insert_with(|| ConsolidationEntry {
                key: record.key(),
                subcategory: record.subcategory.clone(),
                cluster_id: record.cluster_id.clone(),
                current_quantity: record.current_quantity,
                unit_price: record.unit_price,
                contributions: Vec::new(),
                vetoes: Vec::new(),
                floor: None,
                below_store_floor: false,
            });

        entry.contributions.push(Contribution {
            rule: record.source_rule,
            uncapped_delta,
            final_delta: record.quantity_delta,
            final_investment: record.investment_delta,
            caps,
            tags: record.rationale_tags.clone(),
            metadata: record.metadata.clone(),
        });

        if let Some(binding) = floor {
            match &mut entry.floor {
                None => entry.floor = Some(binding),
                Some(existing) => existing.clamped |= binding.clamped,
            }
        }

        debug!(key = %entry.key, rule = %record.source_rule, delta = record.quantity_delta, "admitted → consolidated");
    }

    /// Remember a SKU-level rejection for provenance.
    pub fn veto(&mut self, rejection: &Rejection) {
        let Some(product_id) = &rejection.product_id else {
            return;
        };
        let key = ItemKey {
            store_id: rejection.store_id.clone(),
            product_id: product_id.clone(),
        };
        self.vetoes.entry(key).or_default().push(Veto {
            source_rule: rejection.source_rule,
            reason: rejection.reason,
            proposed_delta: rejection.proposed_delta,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &ItemKey) -> Option<&ConsolidationEntry> {
        self.entries.get(key)
    }

    /// Keys whose rows reported different current quantities or unit prices.
    pub fn input_conflicts(&self) -> &BTreeSet<ItemKey> {
        &self.conflicts
    }

    /// Apply the minimum store volume floor.
    pub fn apply_store_floor(
        &mut self,
        config: &StoreFloorConfig,
        approved: &ApprovedCandidates,
        clusters: &PeerClusters,
        benchmarks: &PeerBenchmarks,
    ) -> StoreFloorReport {
        let mut report = StoreFloorReport::default();
        if !config.is_enabled() {
            return report;
        }

        let mut stores: BTreeSet<StoreId> =
            self.entries.keys().map(|k| k.store_id.clone()).collect();
        stores.extend(approved.stores());
        report.stores_evaluated = stores.len();

        for store in stores {
            let volume: f64 = self
                .entries
                .values()
                .filter(|e| e.key.store_id == store)
                .map(|e| e.store_volume(config.basis))
                .sum();
            let mut shortfall = config.min_store_volume - volume;
            if shortfall <= TOLERANCE {
                continue;
            }

            if config.policy == StoreFloorPolicy::TopUp {
                let before = shortfall;
                for candidate in approved.ranked_for_store(&store) {
                    if shortfall <= TOLERANCE {
                        break;
                    }
                    let key = candidate.key();
                    let existing = self.entries.get(&key);
                    if existing.is_some_and(|e| e.final_delta() < 0.0) {
                        continue;
                    }
                    let subcategory = existing
                        .map(|e| e.subcategory.clone())
                        .or_else(|| candidate.subcategory.clone())
                        .filter(|s| !s.trim().is_empty());
                    let Some(subcategory) = subcategory else {
                        debug!(key = %key, "Top-up candidate skipped: no subcategory");
                        continue;
                    };
                    let current_quantity = existing
                        .map(|e| e.current_quantity)
                        .or(candidate.current_quantity)
                        .unwrap_or(0.0);
                    let unit_price = existing
                        .map(|e| e.unit_price)
                        .or(candidate.unit_price)
                        .unwrap_or(0.0);
                    let cluster_id = existing
                        .map(|e| e.cluster_id.clone())
                        .unwrap_or_else(|| clusters.resolve(&store));

                    let amount = config.top_up_max_units_per_sku.min(shortfall);
                    // Top-ups only increase, so the core reduction cap never applies.
                    let ctx = CapContext::from_peers(
                        false,
                        benchmarks.product(&cluster_id, &candidate.product_id),
                    );
                    let outcome =
                        apply_caps(amount, current_quantity, &config.top_up_guardrail, &ctx);
                    if outcome.was_capped() {
                        report.top_ups_capped += 1;
                    }
                    if outcome.capped_delta <= 0.0 {
                        debug!(key = %key, cap = ?outcome.binding, "Top-up capped to zero");
                        continue;
                    }

                    let record = AdjustmentRecord::new(
                        store.clone(),
                        candidate.product_id.clone(),
                        subcategory,
                        cluster_id,
                        SourceRule::StoreFloorTopUp,
                        outcome.capped_delta,
                        current_quantity,
                        unit_price,
                    );
                    self.add(&record, amount, outcome.binding.into_iter().collect(), None);
                    shortfall -= outcome.capped_delta;
                    report.top_up_records += 1;
                    report.top_up_units += outcome.capped_delta;
                }
                if shortfall < before {
                    report.stores_topped_up += 1;
                }
            }

            if shortfall > TOLERANCE {
                for entry in self.entries.values_mut().filter(|e| e.key.store_id == store) {
                    entry.below_store_floor = true;
                }
                debug!(store = %store, shortfall, "Store below minimum volume floor");
                report.stores_below_floor.push(store);
            }
        }

        info!(
            evaluated = report.stores_evaluated,
            below_floor = report.stores_below_floor.len(),
            topped_up = report.stores_topped_up,
            top_up_units = report.top_up_units,
            top_ups_capped = report.top_ups_capped,
            "Store volume floor applied"
        );
        report
    }

    /// Attach vetoes and return entries in key order.
    pub fn finish(mut self) -> Vec<ConsolidationEntry> {
        for (key, vetoes) in std::mem::take(&mut self.vetoes) {
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.vetoes = vetoes;
            }
        }
        self.entries.into_values().collect()
    }
}
