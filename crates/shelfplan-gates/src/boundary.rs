//! # Boundary / Precedence Enforcer
//!
//! Cross-stage contracts declared as data on each stage.
//!
//! ## Contracts
//! - `NeverTouchPriorIncreases`: a reduction on a key that an earlier stage
//!   increased is dropped (`blocked_by_prior_increase`)
//! - `RequireUpstreamCandidate`: a key absent from the approved candidate
//!   set is dropped (`missing_upstream_candidate`); the stage never
//!   originates keys
//! - `RespectMinimumFloor`: a reduction is clamped so the running position
//!   never drops below the resolved floor, and never flipped to an increase
//!
//! ## Per-key State Machine
//! `candidate → admitted → (capped) → consolidated` or
//! `candidate → rejected(reason)`.

use crate::config::{GuardrailConfig, PipelineConfig, StageConfig};
use serde::{Deserialize, Serialize};
use shelfplan_models::{
    AdjustmentRecord, Direction, FloorBinding, ItemKey, MinimumReference, ProductId, Rejection,
    RejectionReason, SourceRule, StoreId, TOLERANCE,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// =============================================================================
// Stage Descriptors
// =============================================================================

/// A cross-stage contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryContract {
    NeverTouchPriorIncreases,
    RequireUpstreamCandidate,
    RespectMinimumFloor,
}

/// One stage with its declared contracts.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    pub rule: SourceRule,
    pub direction: Direction,
    pub contracts: BTreeSet<BoundaryContract>,
    pub guardrail: GuardrailConfig,
}

impl StageDescriptor {
    pub fn from_config(stage: &StageConfig) -> Self {
        let direction = stage.rule.direction();
        let mut contracts = BTreeSet::new();
        if direction == Direction::Reduction {
            contracts.insert(BoundaryContract::RespectMinimumFloor);
            if stage.guardrail.respect_prior_increases {
                contracts.insert(BoundaryContract::NeverTouchPriorIncreases);
            }
        }
        if stage.guardrail.require_upstream_candidate {
            contracts.insert(BoundaryContract::RequireUpstreamCandidate);
        }
        Self {
            rule: stage.rule,
            direction,
            contracts,
            guardrail: stage.guardrail.clone(),
        }
    }

    pub fn has(&self, contract: BoundaryContract) -> bool {
        self.contracts.contains(&contract)
    }
}

/// Declared stage precedence.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDescriptor {
    pub stages: Vec<StageDescriptor>,
}

impl PipelineDescriptor {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            stages: config.stages.iter().map(StageDescriptor::from_config).collect(),
        }
    }

    pub fn position(&self, rule: SourceRule) -> Option<usize> {
        self.stages.iter().position(|s| s.rule == rule)
    }

    pub fn rules(&self) -> impl Iterator<Item = SourceRule> + '_ {
        self.stages.iter().map(|s| s.rule)
    }
}

// =============================================================================
// Approved Candidates
// =============================================================================

/// One row of the approved-candidate table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovedCandidate {
    pub store_id: StoreId,
    pub product_id: ProductId,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub current_quantity: Option<f64>,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub score: Option<f64>,
}

impl ApprovedCandidate {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.store_id.as_str(), self.product_id.as_str())
    }
}

/// Approved candidate set keyed by (store, product). First row wins.
#[derive(Debug, Clone, Default)]
pub struct ApprovedCandidates {
    by_key: BTreeMap<ItemKey, ApprovedCandidate>,
}

impl ApprovedCandidates {
    pub fn from_rows(rows: impl IntoIterator<Item = ApprovedCandidate>) -> Self {
        let mut by_key = BTreeMap::new();
        for mut row in rows {
            row.store_id = StoreId::new(row.store_id.0);
            row.product_id = ProductId::new(row.product_id.0);
            by_key.entry(row.key()).or_insert(row);
        }
        Self { by_key }
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &ItemKey) -> Option<&ApprovedCandidate> {
        self.by_key.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ApprovedCandidate> {
        self.by_key.values()
    }

    pub fn stores(&self) -> BTreeSet<StoreId> {
        self.by_key.keys().map(|k| k.store_id.clone()).collect()
    }

    /// Candidates for one store: score descending (missing last), then product id.
    pub fn ranked_for_store(&self, store: &StoreId) -> Vec<&ApprovedCandidate> {
        let mut ranked: Vec<&ApprovedCandidate> = self
            .by_key
            .values()
            .filter(|c| &c.store_id == store)
            .collect();
        ranked.sort_by(|a, b| {
            let sa = a.score.unwrap_or(f64::NEG_INFINITY);
            let sb = b.score.unwrap_or(f64::NEG_INFINITY);
            sb.total_cmp(&sa).then_with(|| a.product_id.cmp(&b.product_id))
        });
        ranked
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// Running per-key state across stages.
///
/// Increases become visible to `NeverTouchPriorIncreases` only after the
/// stage that produced them is committed; net deltas are visible at once.
#[derive(Debug, Clone, Default)]
pub struct BoundaryLedger {
    net: BTreeMap<ItemKey, f64>,
    increased: BTreeSet<ItemKey>,
    pending_increases: BTreeSet<ItemKey>,
}

impl BoundaryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn net_so_far(&self, key: &ItemKey) -> f64 {
        self.net.get(key).copied().unwrap_or(0.0)
    }

    pub fn was_increased(&self, key: &ItemKey) -> bool {
        self.increased.contains(key)
    }

    /// Record a surviving, capped delta.
    pub fn record(&mut self, key: &ItemKey, capped_delta: f64) {
        *self.net.entry(key.clone()).or_insert(0.0) += capped_delta;
        if capped_delta > 0.0 {
            self.pending_increases.insert(key.clone());
        }
    }

    /// Close the current stage.
    pub fn commit_stage(&mut self) {
        self.increased.append(&mut self.pending_increases);
    }
}

// =============================================================================
// Enforcer
// =============================================================================

/// Floor clamp applied to one reduction.
#[derive(Debug, Clone, PartialEq)]
pub struct FloorOutcome {
    pub binding: FloorBinding,
    pub delta_before: f64,
    pub delta_after: f64,
}

/// Verdict for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundaryVerdict {
    Admitted {
        record: AdjustmentRecord,
        floor: Option<FloorOutcome>,
    },
    Rejected(Rejection),
}

pub struct BoundaryEnforcer<'a> {
    approved: &'a ApprovedCandidates,
}

impl<'a> BoundaryEnforcer<'a> {
    pub fn new(approved: &'a ApprovedCandidates) -> Self {
        Self { approved }
    }

    /// Rejecting contracts for `key`, checked in declaration order.
    pub fn violation(
        &self,
        stage: &StageDescriptor,
        key: &ItemKey,
        ledger: &BoundaryLedger,
    ) -> Option<(RejectionReason, String)> {
        if stage.has(BoundaryContract::NeverTouchPriorIncreases) && ledger.was_increased(key) {
            return Some((
                RejectionReason::BlockedByPriorIncrease,
                format!("{key} was increased by an earlier stage"),
            ));
        }
        if stage.has(BoundaryContract::RequireUpstreamCandidate) && !self.approved.contains(key) {
            return Some((
                RejectionReason::MissingUpstreamCandidate,
                format!("{key} is not an approved candidate"),
            ));
        }
        None
    }

    /// Apply every contract of `stage` to one SKU-level record.
    ///
    /// `floor` is the resolved reference for the record's (store, subcategory),
    /// consulted only by stages carrying `RespectMinimumFloor`.
    pub fn enforce(
        &self,
        stage: &StageDescriptor,
        record: &AdjustmentRecord,
        ledger: &BoundaryLedger,
        floor: Option<&MinimumReference>,
    ) -> BoundaryVerdict {
        let key = record.key();

        if let Some((reason, detail)) = self.violation(stage, &key, ledger) {
            debug!(rule = %stage.rule, key = %key, reason = %reason, "candidate → rejected");
            return BoundaryVerdict::Rejected(Rejection {
                source_rule: record.source_rule,
                store_id: record.store_id.clone(),
                product_id: Some(record.product_id.clone()),
                subcategory: record.subcategory.clone(),
                proposed_delta: record.quantity_delta,
                reason,
                detail,
            });
        }

        let floor_outcome = match floor {
            Some(reference)
                if stage.has(BoundaryContract::RespectMinimumFloor)
                    && record.quantity_delta < 0.0 =>
            {
                let position = record.current_quantity + ledger.net_so_far(&key);
                Some(clamp_to_floor(reference, position, record.quantity_delta))
            }
            _ => None,
        };

        let admitted = match &floor_outcome {
            Some(f) if f.binding.clamped => {
                debug!(
                    rule = %stage.rule,
                    key = %key,
                    before = f.delta_before,
                    after = f.delta_after,
                    floor = f.binding.reference.floor_value,
                    "candidate → admitted (floor clamped)"
                );
                record.with_quantity_delta(f.delta_after)
            }
            _ => {
                debug!(rule = %stage.rule, key = %key, delta = record.quantity_delta, "candidate → admitted");
                record.clone()
            }
        };

        BoundaryVerdict::Admitted {
            record: admitted,
            floor: floor_outcome,
        }
    }
}

/// Clamp a reduction so `position + delta` stays at or above the floor.
pub fn clamp_to_floor(reference: &MinimumReference, position: f64, delta: f64) -> FloorOutcome {
    let after = reference.clamp_reduction(position, delta);
    FloorOutcome {
        binding: FloorBinding {
            reference: reference.clone(),
            enforced: position >= reference.floor_value - TOLERANCE,
            clamped: (after - delta).abs() > TOLERANCE,
        },
        delta_before: delta,
        delta_after: after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfplan_models::{ClusterId, FloorSource};

    fn stage(rule: SourceRule) -> StageDescriptor {
        let config = PipelineConfig::standard();
        StageDescriptor::from_config(config.stage(rule).unwrap())
    }

    fn record(rule: SourceRule, product: &str, delta: f64, current: f64) -> AdjustmentRecord {
        AdjustmentRecord::new(
            StoreId::new("S1"),
            ProductId::new(product),
            "socks",
            ClusterId::new("C1"),
            rule,
            delta,
            current,
            10.0,
        )
    }

    fn floor(value: f64) -> MinimumReference {
        MinimumReference {
            store_id: StoreId::new("S1"),
            subcategory: "socks".into(),
            floor_value: value,
            source: FloorSource::GlobalFallback,
        }
    }

    #[test]
    fn test_contracts_follow_config() {
        let over = stage(SourceRule::Overcapacity);
        assert!(over.has(BoundaryContract::NeverTouchPriorIncreases));
        assert!(over.has(BoundaryContract::RespectMinimumFloor));
        assert!(!over.has(BoundaryContract::RequireUpstreamCandidate));

        let scaling = stage(SourceRule::GrowthScaling);
        assert_eq!(
            scaling.contracts,
            BTreeSet::from([BoundaryContract::RequireUpstreamCandidate])
        );
    }

    #[test]
    fn test_reduction_blocked_after_committed_increase() {
        let approved = ApprovedCandidates::default();
        let enforcer = BoundaryEnforcer::new(&approved);
        let mut ledger = BoundaryLedger::new();
        let key = ItemKey::new("S1", "P1");

        ledger.record(&key, 3.0);
        // Not yet visible inside the same stage.
        assert!(!ledger.was_increased(&key));
        ledger.commit_stage();

        let verdict = enforcer.enforce(
            &stage(SourceRule::Overcapacity),
            &record(SourceRule::Overcapacity, "P1", -5.0, 20.0),
            &ledger,
            Some(&floor(1.0)),
        );
        match verdict {
            BoundaryVerdict::Rejected(r) => {
                assert_eq!(r.reason, RejectionReason::BlockedByPriorIncrease)
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_upstream_gate_rejects_unapproved_keys() {
        let approved = ApprovedCandidates::from_rows([ApprovedCandidate {
            store_id: StoreId::new("S1"),
            product_id: ProductId::new("P1"),
            subcategory: None,
            current_quantity: None,
            unit_price: None,
            score: None,
        }]);
        let enforcer = BoundaryEnforcer::new(&approved);
        let ledger = BoundaryLedger::new();
        let scaling = stage(SourceRule::GrowthScaling);

        let ok = enforcer.enforce(
            &scaling,
            &record(SourceRule::GrowthScaling, "P1", 2.0, 5.0),
            &ledger,
            None,
        );
        assert!(matches!(ok, BoundaryVerdict::Admitted { floor: None, .. }));

        let missing = enforcer.enforce(
            &scaling,
            &record(SourceRule::GrowthScaling, "P2", 2.0, 5.0),
            &ledger,
            None,
        );
        assert!(matches!(
            missing,
            BoundaryVerdict::Rejected(Rejection {
                reason: RejectionReason::MissingUpstreamCandidate,
                ..
            })
        ));
    }

    #[test]
    fn test_floor_clamp_uses_running_position() {
        let approved = ApprovedCandidates::default();
        let enforcer = BoundaryEnforcer::new(&approved);
        let mut ledger = BoundaryLedger::new();
        let key = ItemKey::new("S1", "P1");
        ledger.record(&key, -2.0);

        let verdict = enforcer.enforce(
            &stage(SourceRule::Overcapacity),
            &record(SourceRule::Overcapacity, "P1", -10.0, 12.0),
            &ledger,
            Some(&floor(4.0)),
        );
        let BoundaryVerdict::Admitted { record, floor } = verdict else {
            panic!("expected admission");
        };
        // position 10, floor 4 → at most -6
        assert_eq!(record.quantity_delta, -6.0);
        assert_eq!(record.investment_delta, -60.0);
        let floor = floor.unwrap();
        assert!(floor.binding.enforced);
        assert!(floor.binding.clamped);
    }

    #[test]
    fn test_floor_never_flips_reduction() {
        let outcome = clamp_to_floor(&floor(5.0), 3.0, -2.0);
        assert_eq!(outcome.delta_after, 0.0);
        assert!(!outcome.binding.enforced);
        assert!(outcome.binding.clamped);
    }

    #[test]
    fn test_ranked_candidates_by_score_then_product() {
        let row = |p: &str, score: Option<f64>| ApprovedCandidate {
            store_id: StoreId::new("S1"),
            product_id: ProductId::new(p),
            subcategory: None,
            current_quantity: None,
            unit_price: None,
            score,
        };
        let approved = ApprovedCandidates::from_rows([
            row("B", Some(0.5)),
            row("A", Some(0.5)),
            row("C", Some(0.9)),
            row("D", None),
        ]);
        let ranked: Vec<_> = approved
            .ranked_for_store(&StoreId::new("S1"))
            .iter()
            .map(|c| c.product_id.as_str().to_string())
            .collect();
        assert_eq!(ranked, vec!["C", "A", "B", "D"]);
    }
}
