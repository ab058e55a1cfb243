//! End-to-end consolidation scenarios and pipeline-wide invariants.
//!
//! This integration test verifies:
//! 1. Family totals split by trailing sales share (600/400 → 6/4)
//! 2. Near-zero sellers receive at most the exploration cap
//! 3. A reduction never undoes an earlier increase
//! 4. Growth scaling never originates keys outside the approved set
//! 5. Uniqueness, floors, monotonic caps and determinism over a mixed fixture
//! 6. A zeroed increase never distorts a later reduction on the same key
//! 7. Peer floors need enough distinct stores carrying the subcategory

use shelfplan_gates::{
    ApprovedCandidate, ApprovedCandidates, ClusterAssignment, CoreCategorySet, ManualMinimum,
    PipelineConfig, PipelineInputs, PipelineOutput, RuleTable, SiblingCatalog, SiblingSales,
    run_pipeline,
};
use shelfplan_models::{
    CapKind, ClusterId, ConsolidatedRecord, GuardrailStage, ItemKey, ProductId, RejectionReason,
    SourceRule, StoreId, TOLERANCE,
};
use std::collections::BTreeSet;

// =============================================================================
// Fixture helpers
// =============================================================================

const COLUMNS: [&str; 5] = [
    "store_id",
    "product_id",
    "subcategory",
    "current_quantity",
    "unit_price",
];

/// (store, product, subcategory, current_quantity, magnitude)
type Row<'a> = (&'a str, &'a str, &'a str, f64, f64);

fn rule_table(delta_column: &str, rows: &[Row]) -> RuleTable {
    let mut columns: Vec<String> = COLUMNS.iter().map(|c| c.to_string()).collect();
    columns.push(delta_column.to_string());
    RuleTable::new(
        columns,
        rows.iter()
            .map(|(store, product, subcategory, current, delta)| {
                vec![
                    store.to_string(),
                    product.to_string(),
                    subcategory.to_string(),
                    current.to_string(),
                    "25".to_string(),
                    delta.to_string(),
                ]
            })
            .collect(),
    )
}

fn sibling(store: &str, product: &str, subcategory: &str, sales: f64, current: f64) -> SiblingSales {
    SiblingSales {
        store_id: StoreId::new(store),
        product_id: ProductId::new(product),
        subcategory: subcategory.to_string(),
        trailing_sales_amount: sales,
        current_quantity: current,
        unit_price: 25.0,
    }
}

fn approved(store: &str, product: &str) -> ApprovedCandidate {
    ApprovedCandidate {
        store_id: StoreId::new(store),
        product_id: ProductId::new(product),
        subcategory: Some("socks".to_string()),
        current_quantity: None,
        unit_price: None,
        score: Some(1.0),
    }
}

fn base_inputs() -> PipelineInputs {
    PipelineInputs {
        clusters: shelfplan_gates::PeerClusters::from_assignments(
            [("S1", "C1"), ("S2", "C1"), ("S3", "C1"), ("S4", "C2")]
                .into_iter()
                .map(|(s, c)| ClusterAssignment {
                    store_id: StoreId::new(s),
                    cluster_id: ClusterId::new(c),
                }),
        ),
        ..PipelineInputs::default()
    }
}

fn run(inputs: &PipelineInputs) -> PipelineOutput {
    run_pipeline(inputs, &PipelineConfig::standard(), &CoreCategorySet::builtin()).unwrap()
}

fn find<'a>(out: &'a PipelineOutput, store: &str, product: &str) -> Option<&'a ConsolidatedRecord> {
    let key = ItemKey::new(store, product);
    out.records.iter().find(|r| r.key() == key)
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_family_total_split_by_sales_share() {
    let mut inputs = base_inputs();
    inputs.siblings = SiblingCatalog::from_rows([
        sibling("S1", "A", "socks", 600.0, 20.0),
        sibling("S1", "B", "socks", 400.0, 20.0),
    ]);
    inputs.rule_tables.insert(
        SourceRule::GrowthCandidate,
        rule_table("growth_qty", &[("S1", "", "socks", 40.0, 10.0)]),
    );

    let out = run(&inputs);
    let a = find(&out, "S1", "A").unwrap();
    let b = find(&out, "S1", "B").unwrap();
    assert!((a.final_quantity_delta - 6.0).abs() < TOLERANCE);
    assert!((b.final_quantity_delta - 4.0).abs() < TOLERANCE);
    assert!((a.final_investment_delta - 150.0).abs() < TOLERANCE);
    assert_eq!(a.contributing_rules, vec![SourceRule::GrowthCandidate]);
}

#[test]
fn test_near_zero_sibling_gets_exploration_share_only() {
    let mut inputs = base_inputs();
    inputs.siblings = SiblingCatalog::from_rows([
        sibling("S1", "SELLER", "socks", 5000.0, 20.0),
        sibling("S1", "NEW", "socks", 0.5, 20.0),
    ]);
    inputs.rule_tables.insert(
        SourceRule::GrowthCandidate,
        rule_table("growth_qty", &[("S1", "", "socks", 40.0, 10.0)]),
    );

    let out = run(&inputs);
    let newcomer = find(&out, "S1", "NEW").unwrap();
    let seller = find(&out, "S1", "SELLER").unwrap();
    assert!(newcomer.final_quantity_delta <= 1.5 + TOLERANCE);
    assert!(newcomer.final_quantity_delta > 0.0);
    assert!((newcomer.final_quantity_delta + seller.final_quantity_delta - 10.0).abs() < TOLERANCE);
    assert!(
        newcomer
            .traceability
            .explanation_text
            .contains("growth_candidate")
    );
}

#[test]
fn test_reduction_after_increase_is_rejected() {
    let mut inputs = base_inputs();
    inputs.rule_tables.insert(
        SourceRule::BelowMinimum,
        rule_table("increase_qty", &[("S1", "P1", "socks", 10.0, 3.0)]),
    );
    inputs.rule_tables.insert(
        SourceRule::Overcapacity,
        rule_table("reduce_qty", &[("S1", "P1", "socks", 10.0, 5.0)]),
    );

    let out = run(&inputs);
    let record = find(&out, "S1", "P1").unwrap();
    assert_eq!(record.final_quantity_delta, 3.0);
    assert_eq!(record.contributing_rules, vec![SourceRule::BelowMinimum]);
    assert_eq!(record.vetoes.len(), 1);
    assert_eq!(record.vetoes[0].source_rule, SourceRule::Overcapacity);
    assert_eq!(record.vetoes[0].reason, RejectionReason::BlockedByPriorIncrease);

    let prior = &record.traceability.clearances[0];
    assert_eq!(prior.stage, GuardrailStage::PriorIncreaseProtection);
    assert!(prior.intervened);

    assert_eq!(
        out.rejections
            .iter()
            .filter(|r| r.reason == RejectionReason::BlockedByPriorIncrease)
            .count(),
        1
    );
}

#[test]
fn test_zeroed_increase_then_reduction_stays_monotonic() {
    let mut inputs = base_inputs();
    inputs.manual_minimums = vec![ManualMinimum {
        store_id: StoreId::new("S1"),
        subcategory: "socks".to_string(),
        min_qty: 2.0,
    }];
    inputs.rule_tables.insert(
        SourceRule::BelowMinimum,
        rule_table("increase_qty", &[("S1", "P1", "socks", 20.0, 0.5)]),
    );
    inputs.rule_tables.insert(
        SourceRule::Overcapacity,
        rule_table("reduce_qty", &[("S1", "P1", "socks", 20.0, 8.0)]),
    );

    let out = run(&inputs);
    let record = find(&out, "S1", "P1").unwrap();
    assert_eq!(record.contributing_rules, vec![SourceRule::Overcapacity]);
    assert!((record.final_quantity_delta + 8.0).abs() < TOLERANCE);
    assert!((record.uncapped_quantity_delta + 8.0).abs() < TOLERANCE);
    assert!(record.final_quantity_delta.abs() <= record.uncapped_quantity_delta.abs() + TOLERANCE);
    assert!(record.caps_applied.is_empty());

    let caps = record
        .traceability
        .clearances
        .iter()
        .find(|c| c.stage == GuardrailStage::SafetyCaps)
        .unwrap();
    assert!(!caps.intervened, "{}", caps.statement);
}

#[test]
fn test_lone_store_in_cluster_gets_global_floor() {
    // C1 has three stores but only S1 carries socks.
    let mut inputs = base_inputs();
    inputs.rule_tables.insert(
        SourceRule::Overcapacity,
        rule_table("reduce_qty", &[("S1", "P1", "socks", 20.0, 8.0)]),
    );

    let out = run(&inputs);
    let record = find(&out, "S1", "P1").unwrap();
    let floor = record.floor.as_ref().unwrap();
    assert_eq!(floor.reference.source, shelfplan_models::FloorSource::GlobalFallback);
    assert_eq!(floor.reference.floor_value, 2.0);
    assert!((record.final_quantity_delta + 8.0).abs() < TOLERANCE);
    assert!(!record.caps_applied.contains(&CapKind::MinimumFloor));
}

#[test]
fn test_unapproved_growth_scaling_absent_from_detail() {
    let mut inputs = base_inputs();
    inputs.approved = ApprovedCandidates::from_rows([approved("S1", "P1")]);
    inputs.rule_tables.insert(
        SourceRule::GrowthScaling,
        rule_table(
            "scaled_qty",
            &[("S1", "P1", "socks", 10.0, 2.0), ("S1", "P2", "socks", 10.0, 2.0)],
        ),
    );

    let out = run(&inputs);
    assert!(find(&out, "S1", "P1").is_some());
    assert!(find(&out, "S1", "P2").is_none());
    let missing: Vec<_> = out
        .rejections
        .iter()
        .filter(|r| r.reason == RejectionReason::MissingUpstreamCandidate)
        .collect();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].product_id, Some(ProductId::new("P2")));
}

// =============================================================================
// Invariants over a mixed fixture
// =============================================================================

fn mixed_inputs() -> PipelineInputs {
    let mut inputs = base_inputs();
    inputs.siblings = SiblingCatalog::from_rows([
        sibling("S1", "P5", "socks", 600.0, 6.0),
        sibling("S1", "P6", "socks", 400.0, 8.0),
        sibling("S1", "P7", "socks", 2.0, 1.0),
        sibling("S2", "P5", "socks", 100.0, 9.0),
        sibling("S3", "P5", "socks", 300.0, 14.0),
        sibling("S3", "P3", "socks", 250.0, 22.0),
        sibling("S3", "P8", "socks", 0.0, 4.0),
    ]);
    inputs.approved = ApprovedCandidates::from_rows([approved("S1", "P6"), approved("S3", "P8")]);
    inputs.manual_minimums = vec![ManualMinimum {
        store_id: StoreId::new("S1"),
        subcategory: "socks".to_string(),
        min_qty: 4.0,
    }];

    inputs.rule_tables.insert(
        SourceRule::BelowMinimum,
        rule_table(
            "increase_qty",
            &[("S1", "P1", "jeans", 4.0, 2.0), ("S2", "P2", "socks", 0.0, 3.0)],
        ),
    );
    inputs.rule_tables.insert(
        SourceRule::Overcapacity,
        rule_table(
            "reduce_qty",
            &[
                ("S1", "P1", "jeans", 4.0, 10.0),
                ("S2", "P3", "socks", 25.0, 20.0),
                ("S3", "P4", "jeans", 12.0, 9.0),
                ("S1", "P5", "socks", 6.0, 5.0),
                ("S3", "", "socks", 40.0, 6.0),
                ("S4", "P9", "socks", 50.0, 40.0),
            ],
        ),
    );
    inputs.rule_tables.insert(
        SourceRule::GrowthCandidate,
        rule_table(
            "growth_qty",
            &[("S2", "P1", "jeans", 5.0, 4.0), ("S1", "", "socks", 15.0, 10.0)],
        ),
    );
    inputs.rule_tables.insert(
        SourceRule::GrowthScaling,
        rule_table(
            "scaled_qty",
            &[
                ("S1", "P6", "socks", 8.0, 3.0),
                ("S2", "P6", "socks", 8.0, 3.0),
                ("S3", "P8", "socks", 4.0, 1.5),
            ],
        ),
    );
    inputs
}

#[test]
fn test_one_record_per_key() {
    let out = run(&mixed_inputs());
    let keys: BTreeSet<ItemKey> = out.records.iter().map(|r| r.key()).collect();
    assert_eq!(keys.len(), out.records.len());
    assert!(!out.records.is_empty());
}

#[test]
fn test_floor_respected_where_in_force() {
    let out = run(&mixed_inputs());
    let mut checked = 0;
    for record in &out.records {
        if let Some(floor) = &record.floor {
            if floor.enforced {
                checked += 1;
                assert!(
                    record.resulting_quantity() >= floor.reference.floor_value - TOLERANCE,
                    "{} fell below floor {}",
                    record.key(),
                    floor.reference.floor_value
                );
            }
        }
    }
    assert!(checked > 0);

    // S1/P5: current 6, manual floor 4 → reduction of 5 clamped to 2 units.
    let p5 = find(&out, "S1", "P5").unwrap();
    assert!(p5.caps_applied.contains(&CapKind::MinimumFloor));
}

#[test]
fn test_capping_monotonic_and_sign_preserving() {
    let out = run(&mixed_inputs());
    for record in &out.records {
        let uncapped = record.uncapped_quantity_delta;
        let fin = record.final_quantity_delta;
        assert!(fin.abs() <= uncapped.abs() + TOLERANCE, "{}", record.key());
        assert!(fin == 0.0 || fin.signum() == uncapped.signum(), "{}", record.key());
    }

    // Core reduction bound by the tighter core cap: 0.2 × 12.
    let core = find(&out, "S3", "P4").unwrap();
    assert!((core.final_quantity_delta + 2.4).abs() < TOLERANCE);
    assert!(core.caps_applied.contains(&CapKind::CoreCurrentQuantityPct));
}

#[test]
fn test_no_reduction_on_prior_increase_keys() {
    let out = run(&mixed_inputs());
    for record in &out.records {
        if record.has_contribution_from(SourceRule::BelowMinimum) {
            assert!(!record.has_contribution_from(SourceRule::Overcapacity));
        }
    }
    let p1 = find(&out, "S1", "P1").unwrap();
    assert_eq!(p1.final_quantity_delta, 2.0);
}

#[test]
fn test_growth_scaling_subset_of_approved() {
    let inputs = mixed_inputs();
    let out = run(&inputs);
    for record in &out.records {
        if record.has_contribution_from(SourceRule::GrowthScaling) {
            assert!(inputs.approved.contains(&record.key()), "{}", record.key());
        }
    }
    assert!(find(&out, "S2", "P6").is_none());
}

#[test]
fn test_small_cluster_skips_cluster_caps() {
    let out = run(&mixed_inputs());
    // S4 is alone in C2: size 1 < min_cluster_size, so only the pct and
    // absolute caps apply: min(0.4 × 50, 30) = 20.
    let p9 = find(&out, "S4", "P9").unwrap();
    assert!((p9.final_quantity_delta + 20.0).abs() < TOLERANCE);
}

#[test]
fn test_every_record_fully_traced() {
    let out = run(&mixed_inputs());
    for record in &out.records {
        let t = &record.traceability;
        assert_eq!(t.clearances.len(), GuardrailStage::ALL.len());
        assert_eq!(t.final_quantity_delta, record.final_quantity_delta);
        assert!(!t.justification_text.is_empty());
        assert!(!t.no_conflict_text.is_empty());
        assert!(!t.explanation_text.is_empty());
    }
}

#[test]
fn test_run_is_deterministic() {
    let inputs = mixed_inputs();
    let a = run(&inputs);
    let b = run(&inputs);
    assert_eq!(a.records, b.records);
    assert_eq!(a.rejections, b.rejections);
    assert_eq!(a.stage_stats, b.stage_stats);
}
