//! # Consolidation Pipeline
//!
//! Entry point that runs every stage over fully materialized inputs.
//!
//! ## Order
//! normalize → boundary-enforce → cap → allocate → consolidate →
//! store floor → traceability.
//!
//! ## Hard Laws
//! - L1: Single pass, single thread, no global state
//! - L2: Config and core categories are explicit immutable inputs
//! - L3: Only structural defects abort (`SchemaError`, `ConfigError`,
//!   `AllocationError`); every dropped candidate is a counted `Rejection`
//! - L4: Same inputs and config ⇒ identical output

use crate::allocation::{AllocationError, SiblingCatalog, distribute};
use crate::boundary::{
    ApprovedCandidates, BoundaryContract, BoundaryEnforcer, BoundaryLedger, BoundaryVerdict,
    PipelineDescriptor, StageDescriptor, clamp_to_floor,
};
use crate::caps::{CapContext, apply_caps};
use crate::config::{ConfigError, PipelineConfig};
use crate::consolidator::{Consolidator, StoreFloorReport};
use crate::core_categories::CoreCategorySet;
use crate::minimum::{FloorResolver, ManualMinimum};
use crate::normalizer::{NormalizedBatch, RuleNormalizer, RuleSchema, RuleTable, SchemaError};
use crate::peers::{InventoryObservation, PeerBenchmarks, PeerClusters};
use crate::traceability::TraceabilityGenerator;
use serde::{Deserialize, Serialize};
use shelfplan_models::{
    AdjustmentRecord, CapKind, ConsolidatedRecord, Direction, FamilyAdjustment, ItemKey,
    Rejection, RejectionReason, SourceRule, StoreId, TAG_CORE_PROTECTED, TAG_EXPLORATION,
    TAG_FAMILY_ALLOCATED,
};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),
}

// =============================================================================
// Inputs / Outputs
// =============================================================================

/// Fully materialized inputs of one run.
#[derive(Debug, Clone, Default)]
pub struct PipelineInputs {
    /// One table per rule; absent tables are empty stages.
    pub rule_tables: BTreeMap<SourceRule, RuleTable>,
    pub clusters: PeerClusters,
    pub approved: ApprovedCandidates,
    pub siblings: SiblingCatalog,
    pub manual_minimums: Vec<ManualMinimum>,
}

/// Counters for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub rule: Option<SourceRule>,
    pub rows_read: usize,
    pub records_in: usize,
    pub families_in: usize,
    pub admitted: usize,
    pub rejected: BTreeMap<RejectionReason, usize>,
    /// Binding caps and floor clamps.
    pub caps: BTreeMap<CapKind, usize>,
    pub families_allocated: usize,
    pub allocated_records: usize,
    pub uncapped_units: f64,
    pub final_units: f64,
}

impl StageStats {
    fn new(rule: SourceRule) -> Self {
        Self {
            rule: Some(rule),
            ..Self::default()
        }
    }

    fn reject(&mut self, reason: RejectionReason) {
        *self.rejected.entry(reason).or_insert(0) += 1;
    }

    fn cap(&mut self, kind: CapKind) {
        *self.caps.entry(kind).or_insert(0) += 1;
    }

    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// One record per (store, product), in key order.
    pub records: Vec<ConsolidatedRecord>,
    pub rejections: Vec<Rejection>,
    pub stage_stats: Vec<StageStats>,
    pub store_floor: StoreFloorReport,
    pub config_fingerprint: String,
    pub warnings: Vec<String>,
}

// =============================================================================
// Entry Point
// =============================================================================

/// Run the consolidation pipeline.
pub fn run_pipeline(
    inputs: &PipelineInputs,
    config: &PipelineConfig,
    core: &CoreCategorySet,
) -> Result<PipelineOutput, PipelineError> {
    config.validate()?;
    let descriptor = PipelineDescriptor::from_config(config);
    let mut warnings = Vec::new();

    for rule in inputs.rule_tables.keys() {
        if descriptor.position(*rule).is_none() {
            warn!(rule = %rule, "Rule table supplied for an undeclared stage; ignored");
            warnings.push(format!("rule table '{rule}' ignored: no such stage declared"));
        }
    }

    // Normalize every stage up front; benchmarks need all observations.
    let normalizer = RuleNormalizer::new(&inputs.clusters, core);
    let mut batches = Vec::with_capacity(descriptor.stages.len());
    for stage in &descriptor.stages {
        let batch = match inputs.rule_tables.get(&stage.rule) {
            Some(table) => {
                let schema =
                    RuleSchema::builtin(stage.rule).ok_or(SchemaError::NoSchema { rule: stage.rule })?;
                normalizer.normalize(&schema, table)?
            }
            None => {
                info!(rule = %stage.rule, "No table for stage; treated as empty");
                NormalizedBatch::empty(stage.rule)
            }
        };
        batches.push(batch);
    }

    let unclustered = unclustered_stores(&batches, &inputs.clusters);
    if !unclustered.is_empty() {
        warnings.push(format!(
            "{} store(s) missing from peer-cluster table assigned to 'unassigned': {}",
            unclustered.len(),
            unclustered
                .iter()
                .map(StoreId::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    let benchmarks = PeerBenchmarks::build(
        &inputs.clusters,
        observations(inputs, &batches),
        config.floor.benchmark_percentile,
    );
    let resolver = FloorResolver::new(&inputs.manual_minimums, &benchmarks, &config.floor);

    let mut run = StageRunner {
        inputs,
        config,
        benchmarks: &benchmarks,
        resolver: &resolver,
        enforcer: BoundaryEnforcer::new(&inputs.approved),
        ledger: BoundaryLedger::new(),
        consolidator: Consolidator::new(),
        rejections: Vec::new(),
    };

    let mut stage_stats = Vec::with_capacity(descriptor.stages.len());
    for (stage, batch) in descriptor.stages.iter().zip(batches) {
        stage_stats.push(run.run_stage(stage, batch)?);
    }

    let StageRunner {
        mut consolidator,
        rejections,
        ..
    } = run;

    let store_floor = consolidator.apply_store_floor(
        &config.store_floor,
        &inputs.approved,
        &inputs.clusters,
        &benchmarks,
    );

    let conflicts = consolidator.input_conflicts();
    if !conflicts.is_empty() {
        warnings.push(format!(
            "{} key(s) reported with differing current quantity or unit price across stages; first row kept: {}",
            conflicts.len(),
            conflicts
                .iter()
                .map(ItemKey::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    let generator = TraceabilityGenerator::new(&benchmarks);
    let records: Vec<ConsolidatedRecord> = consolidator
        .finish()
        .iter()
        .map(|entry| generator.finalize(entry))
        .collect();

    info!(
        records = records.len(),
        rejections = rejections.len(),
        stores_below_floor = store_floor.stores_below_floor.len(),
        "Consolidation complete"
    );

    Ok(PipelineOutput {
        records,
        rejections,
        stage_stats,
        store_floor,
        config_fingerprint: config.fingerprint(),
        warnings,
    })
}

fn unclustered_stores(batches: &[NormalizedBatch], clusters: &PeerClusters) -> BTreeSet<StoreId> {
    batches
        .iter()
        .flat_map(|b| {
            b.records
                .iter()
                .map(|r| &r.store_id)
                .chain(b.families.iter().map(|f| &f.store_id))
        })
        .filter(|s| clusters.cluster_of(s).is_none())
        .cloned()
        .collect()
}

fn observations(inputs: &PipelineInputs, batches: &[NormalizedBatch]) -> Vec<InventoryObservation> {
    let mut obs: Vec<InventoryObservation> = inputs
        .siblings
        .iter()
        .map(|s| InventoryObservation {
            store_id: s.store_id.clone(),
            product_id: s.product_id.clone(),
            subcategory: s.subcategory.clone(),
            current_quantity: s.current_quantity,
        })
        .collect();
    obs.extend(batches.iter().flat_map(|b| &b.records).map(|r| InventoryObservation {
        store_id: r.store_id.clone(),
        product_id: r.product_id.clone(),
        subcategory: r.subcategory.clone(),
        current_quantity: r.current_quantity,
    }));
    obs.extend(inputs.approved.iter().filter_map(|c| {
        Some(InventoryObservation {
            store_id: c.store_id.clone(),
            product_id: c.product_id.clone(),
            subcategory: c.subcategory.clone()?,
            current_quantity: c.current_quantity?,
        })
    }));
    obs
}

// =============================================================================
// Stage Runner
// =============================================================================

struct StageRunner<'a> {
    inputs: &'a PipelineInputs,
    config: &'a PipelineConfig,
    benchmarks: &'a PeerBenchmarks,
    resolver: &'a FloorResolver<'a>,
    enforcer: BoundaryEnforcer<'a>,
    ledger: BoundaryLedger,
    consolidator: Consolidator,
    rejections: Vec<Rejection>,
}

impl StageRunner<'_> {
    fn run_stage(
        &mut self,
        stage: &StageDescriptor,
        batch: NormalizedBatch,
    ) -> Result<StageStats, PipelineError> {
        let mut stats = StageStats::new(stage.rule);
        stats.rows_read = batch.rows_read;
        stats.records_in = batch.records.len();
        stats.families_in = batch.families.len();

        for rejection in batch.rejections {
            self.push_rejection(&mut stats, rejection);
        }

        for record in &batch.records {
            self.process_record(stage, record, &mut stats);
        }

        for family in &batch.families {
            self.process_family(stage, family, &mut stats)?;
        }

        self.ledger.commit_stage();

        info!(
            rule = %stage.rule,
            admitted = stats.admitted,
            rejected = stats.rejected_total(),
            capped = stats.caps.values().sum::<usize>(),
            families = stats.families_allocated,
            uncapped_units = stats.uncapped_units,
            final_units = stats.final_units,
            "Stage complete"
        );
        Ok(stats)
    }

    fn push_rejection(&mut self, stats: &mut StageStats, rejection: Rejection) {
        stats.reject(rejection.reason);
        self.consolidator.veto(&rejection);
        self.rejections.push(rejection);
    }

    fn process_record(
        &mut self,
        stage: &StageDescriptor,
        record: &AdjustmentRecord,
        stats: &mut StageStats,
    ) {
        let (benchmarks, resolver) = (self.benchmarks, self.resolver);
        let floor = (stage.direction == Direction::Reduction)
            .then(|| resolver.resolve(&record.store_id, &record.cluster_id, &record.subcategory));

        let (admitted, floor) = match self.enforcer.enforce(stage, record, &self.ledger, floor.as_ref()) {
            BoundaryVerdict::Rejected(rejection) => {
                self.push_rejection(stats, rejection);
                return;
            }
            BoundaryVerdict::Admitted { record, floor } => (record, floor),
        };
        stats.admitted += 1;

        let ctx = CapContext::from_peers(
            admitted.has_tag(TAG_CORE_PROTECTED),
            benchmarks.product(&admitted.cluster_id, &admitted.product_id),
        );
        let outcome = apply_caps(
            admitted.quantity_delta,
            admitted.current_quantity,
            &stage.guardrail,
            &ctx,
        );

        let mut caps = Vec::new();
        if floor.as_ref().is_some_and(|f| f.binding.clamped) {
            caps.push(CapKind::MinimumFloor);
        }
        caps.extend(outcome.binding);
        for cap in &caps {
            stats.cap(*cap);
        }
        if let Some(kind) = outcome.binding {
            debug!(rule = %stage.rule, key = %admitted.key(), cap = %kind, before = outcome.input_delta, after = outcome.capped_delta, "admitted → capped");
        }

        let capped = admitted.with_quantity_delta(outcome.capped_delta);
        self.ledger.record(&capped.key(), capped.quantity_delta);
        stats.uncapped_units += record.quantity_delta;
        stats.final_units += capped.quantity_delta;
        self.consolidator
            .add(&capped, record.quantity_delta, caps, floor.map(|f| f.binding));
    }

    fn process_family(
        &mut self,
        stage: &StageDescriptor,
        family: &FamilyAdjustment,
        stats: &mut StageStats,
    ) -> Result<(), PipelineError> {
        let (inputs, benchmarks, resolver) = (self.inputs, self.benchmarks, self.resolver);
        let family_key = family.family_key();
        let siblings = inputs.siblings.siblings(&family_key);
        let eligible: Vec<_> = siblings
            .iter()
            .copied()
            .filter(|s| {
                let key = ItemKey {
                    store_id: family.store_id.clone(),
                    product_id: s.product_id.clone(),
                };
                self.enforcer.violation(stage, &key, &self.ledger).is_none()
            })
            .collect();

        if eligible.is_empty() {
            debug!(rule = %stage.rule, family = %family_key, "family candidate → rejected(no_eligible_sibling)");
            self.push_rejection(
                stats,
                Rejection {
                    source_rule: family.source_rule,
                    store_id: family.store_id.clone(),
                    product_id: None,
                    subcategory: family.subcategory.clone(),
                    proposed_delta: family.total_delta,
                    reason: RejectionReason::NoEligibleSibling,
                    detail: format!(
                        "family {family_key}: {} sibling(s), none eligible",
                        siblings.len()
                    ),
                },
            );
            return Ok(());
        }
        stats.admitted += 1;

        let aggregate = family.as_aggregate_record();
        let ctx = CapContext::from_peers(
            aggregate.has_tag(TAG_CORE_PROTECTED),
            benchmarks.family(&family.cluster_id, &family.subcategory),
        );
        let outcome = apply_caps(
            family.total_delta,
            family.current_quantity,
            &stage.guardrail,
            &ctx,
        );
        if let Some(kind) = outcome.binding {
            stats.cap(kind);
        }
        stats.uncapped_units += family.total_delta;

        if outcome.capped_delta == 0.0 {
            debug!(rule = %stage.rule, family = %family_key, "family capped to zero; nothing allocated");
            return Ok(());
        }

        let shares = distribute(
            &family_key,
            outcome.capped_delta,
            &eligible,
            &self.config.allocation,
        )?;
        stats.families_allocated += 1;
        // Spread the pre-cap total in the same proportions.
        let uncapped_scale = family.total_delta / outcome.capped_delta;

        for (share, sibling) in shares.iter().zip(&eligible) {
            if share.quantity == 0.0 {
                continue;
            }
            let mut record = AdjustmentRecord::new(
                family.store_id.clone(),
                share.product_id.clone(),
                family.subcategory.clone(),
                family.cluster_id.clone(),
                family.source_rule,
                share.quantity,
                sibling.current_quantity,
                sibling.unit_price,
            );
            record.rationale_tags = family.rationale_tags.clone();
            record.rationale_tags.insert(TAG_FAMILY_ALLOCATED.to_string());
            if share.exploration {
                record.rationale_tags.insert(TAG_EXPLORATION.to_string());
            }
            record.metadata = family.metadata.clone();

            let mut caps: Vec<CapKind> = Vec::new();
            let mut floor_binding = None;
            if stage.has(BoundaryContract::RespectMinimumFloor) && record.quantity_delta < 0.0 {
                let reference = resolver.resolve(
                    &record.store_id,
                    &record.cluster_id,
                    &record.subcategory,
                );
                let position = record.current_quantity + self.ledger.net_so_far(&record.key());
                let clamp = clamp_to_floor(&reference, position, record.quantity_delta);
                if clamp.binding.clamped {
                    caps.push(CapKind::MinimumFloor);
                    stats.cap(CapKind::MinimumFloor);
                    record = record.with_quantity_delta(clamp.delta_after);
                }
                floor_binding = Some(clamp.binding);
            }
            caps.extend(outcome.binding);

            debug!(rule = %stage.rule, key = %record.key(), delta = record.quantity_delta, exploration = share.exploration, "family share → admitted");
            self.ledger.record(&record.key(), record.quantity_delta);
            stats.allocated_records += 1;
            stats.final_units += record.quantity_delta;
            self.consolidator
                .add(&record, share.quantity * uncapped_scale, caps, floor_binding);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::SiblingSales;
    use crate::boundary::ApprovedCandidate;
    use crate::peers::ClusterAssignment;
    use shelfplan_models::{ClusterId, ProductId};

    fn table(delta_col: &str, rows: &[(&str, &str, &str, f64, f64)]) -> RuleTable {
        RuleTable::new(
            ["store_id", "product_id", "subcategory", "current_quantity", "unit_price", delta_col]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            rows.iter()
                .map(|(s, p, sub, cur, d)| {
                    vec![
                        s.to_string(),
                        p.to_string(),
                        sub.to_string(),
                        cur.to_string(),
                        "10".to_string(),
                        d.to_string(),
                    ]
                })
                .collect(),
        )
    }

    fn inputs() -> PipelineInputs {
        PipelineInputs {
            clusters: PeerClusters::from_assignments((1..=3).map(|i| ClusterAssignment {
                store_id: StoreId::new(format!("S{i}")),
                cluster_id: ClusterId::new("C1"),
            })),
            ..PipelineInputs::default()
        }
    }

    #[test]
    fn test_empty_inputs_produce_empty_output() {
        let out = run_pipeline(
            &PipelineInputs::default(),
            &PipelineConfig::standard(),
            &CoreCategorySet::builtin(),
        )
        .unwrap();
        assert!(out.records.is_empty());
        assert!(out.rejections.is_empty());
        assert_eq!(out.stage_stats.len(), 4);
        assert_eq!(out.config_fingerprint, PipelineConfig::standard().fingerprint());
    }

    #[test]
    fn test_invalid_config_aborts() {
        let mut config = PipelineConfig::standard();
        config.stages.clear();
        assert!(matches!(
            run_pipeline(&inputs(), &config, &CoreCategorySet::builtin()),
            Err(PipelineError::Config(ConfigError::EmptyStages))
        ));
    }

    #[test]
    fn test_prior_increase_blocks_reduction() {
        let mut inputs = inputs();
        inputs.rule_tables.insert(
            SourceRule::BelowMinimum,
            table("increase_qty", &[("S1", "P1", "socks", 10.0, 3.0)]),
        );
        inputs.rule_tables.insert(
            SourceRule::Overcapacity,
            table("reduce_qty", &[("S1", "P1", "socks", 10.0, 5.0)]),
        );
        let out = run_pipeline(&inputs, &PipelineConfig::standard(), &CoreCategorySet::builtin())
            .unwrap();
        assert_eq!(out.records.len(), 1);
        let r = &out.records[0];
        assert_eq!(r.final_quantity_delta, 3.0);
        assert_eq!(r.contributing_rules, vec![SourceRule::BelowMinimum]);
        assert_eq!(r.vetoes.len(), 1);
        assert_eq!(out.rejections[0].reason, RejectionReason::BlockedByPriorIncrease);
        assert_eq!(out.stage_stats[1].rejected_total(), 1);
    }

    #[test]
    fn test_family_row_allocated_to_eligible_siblings() {
        let mut inputs = inputs();
        let sibling = |p: &str, sales: f64| SiblingSales {
            store_id: StoreId::new("S1"),
            product_id: ProductId::new(p),
            subcategory: "socks".into(),
            trailing_sales_amount: sales,
            current_quantity: 20.0,
            unit_price: 10.0,
        };
        inputs.siblings = SiblingCatalog::from_rows([sibling("A", 600.0), sibling("B", 400.0)]);
        inputs.rule_tables.insert(
            SourceRule::GrowthCandidate,
            table("growth_qty", &[("S1", "", "socks", 40.0, 10.0)]),
        );
        let out = run_pipeline(&inputs, &PipelineConfig::standard(), &CoreCategorySet::builtin())
            .unwrap();
        assert_eq!(out.records.len(), 2);
        assert!((out.records[0].final_quantity_delta - 6.0).abs() < 1e-9);
        assert!((out.records[1].final_quantity_delta - 4.0).abs() < 1e-9);
        assert_eq!(out.stage_stats[2].families_allocated, 1);
    }

    #[test]
    fn test_family_without_siblings_rejected() {
        let mut inputs = inputs();
        inputs.rule_tables.insert(
            SourceRule::GrowthCandidate,
            table("growth_qty", &[("S1", "", "socks", 40.0, 10.0)]),
        );
        let out = run_pipeline(&inputs, &PipelineConfig::standard(), &CoreCategorySet::builtin())
            .unwrap();
        assert!(out.records.is_empty());
        assert_eq!(out.rejections[0].reason, RejectionReason::NoEligibleSibling);
    }

    #[test]
    fn test_family_growth_scaling_only_reaches_approved_siblings() {
        let mut inputs = inputs();
        let sibling = |p: &str| SiblingSales {
            store_id: StoreId::new("S1"),
            product_id: ProductId::new(p),
            subcategory: "socks".into(),
            trailing_sales_amount: 100.0,
            current_quantity: 20.0,
            unit_price: 10.0,
        };
        inputs.siblings = SiblingCatalog::from_rows([sibling("A"), sibling("B")]);
        inputs.approved = ApprovedCandidates::from_rows([ApprovedCandidate {
            store_id: StoreId::new("S1"),
            product_id: ProductId::new("B"),
            subcategory: None,
            current_quantity: None,
            unit_price: None,
            score: None,
        }]);
        inputs.rule_tables.insert(
            SourceRule::GrowthScaling,
            table("scaled_qty", &[("S1", "", "socks", 40.0, 4.0)]),
        );
        let out = run_pipeline(&inputs, &PipelineConfig::standard(), &CoreCategorySet::builtin())
            .unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].product_id, ProductId::new("B"));
        assert_eq!(out.records[0].final_quantity_delta, 4.0);
    }

    #[test]
    fn test_undeclared_table_is_warned() {
        let mut inputs = inputs();
        inputs.rule_tables.insert(
            SourceRule::GrowthScaling,
            table("scaled_qty", &[("S1", "P1", "socks", 10.0, 1.0)]),
        );
        let mut config = PipelineConfig::standard();
        config.stages.retain(|s| s.rule != SourceRule::GrowthScaling);
        let out = run_pipeline(&inputs, &config, &CoreCategorySet::builtin()).unwrap();
        assert!(out.records.is_empty());
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn test_unclustered_store_warned() {
        let mut inputs = inputs();
        inputs.rule_tables.insert(
            SourceRule::BelowMinimum,
            table("increase_qty", &[("S9", "P1", "socks", 10.0, 2.0)]),
        );
        let out = run_pipeline(&inputs, &PipelineConfig::standard(), &CoreCategorySet::builtin())
            .unwrap();
        assert!(out.records[0].cluster_id.is_unassigned());
        assert!(out.warnings[0].contains("S9"));
    }

    #[test]
    fn test_disagreeing_stage_inputs_are_warned() {
        let mut inputs = inputs();
        inputs.rule_tables.insert(
            SourceRule::BelowMinimum,
            table("increase_qty", &[("S1", "P1", "socks", 10.0, 3.0)]),
        );
        inputs.rule_tables.insert(
            SourceRule::GrowthCandidate,
            table("growth_qty", &[("S1", "P1", "socks", 14.0, 2.0)]),
        );
        let out = run_pipeline(&inputs, &PipelineConfig::standard(), &CoreCategorySet::builtin())
            .unwrap();
        assert_eq!(out.records[0].current_quantity, 10.0);
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("S1/P1"));
    }
}
