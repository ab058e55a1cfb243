//! # Rule Normalizer
//!
//! Maps each rule generator table into canonical `AdjustmentRecord`s and
//! family-level `FamilyAdjustment`s.
//!
//! ## Hard Laws
//! - L1: A missing required column is fatal (`SchemaError`)
//! - L2: A bad row is never fatal: it becomes a counted `Rejection`
//! - L3: Signs are validated, never flipped
//! - L4: Unknown columns are preserved verbatim as metadata
//! - L5: Pure: the same table always yields the same batch

use crate::core_categories::CoreCategorySet;
use crate::peers::PeerClusters;
use shelfplan_models::{
    AdjustmentRecord, ClusterId, FamilyAdjustment, FamilyKey, ItemKey, ProductId, Rejection,
    RejectionReason, SourceRule, StoreId, TAG_CORE_PROTECTED,
};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

// =============================================================================
// Columns
// =============================================================================

pub const COL_STORE_ID: &str = "store_id";
pub const COL_PRODUCT_ID: &str = "product_id";
pub const COL_SUBCATEGORY: &str = "subcategory";
pub const COL_CURRENT_QUANTITY: &str = "current_quantity";
pub const COL_UNIT_PRICE: &str = "unit_price";
pub const COL_RATIONALE_TAGS: &str = "rationale_tags";

// =============================================================================
// Tables & Schemas
// =============================================================================

/// A rule generator table: header plus string cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RuleTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.trim() == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// How the delta column encodes direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaConvention {
    /// Cell carries the sign.
    Signed,
    /// Cell is a non-negative magnitude; the rule fixes the sign.
    Magnitude,
}

/// Column layout of one rule table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSchema {
    pub rule: SourceRule,
    pub delta_column: String,
    pub convention: DeltaConvention,
}

impl RuleSchema {
    /// Built-in schema for a table rule. `None` for internal rules.
    pub fn builtin(rule: SourceRule) -> Option<Self> {
        let delta_column = match rule {
            SourceRule::BelowMinimum => "increase_qty",
            SourceRule::Overcapacity => "reduce_qty",
            SourceRule::GrowthCandidate => "growth_qty",
            SourceRule::GrowthScaling => "scaled_qty",
            SourceRule::StoreFloorTopUp => return None,
        };
        Some(Self {
            rule,
            delta_column: delta_column.to_string(),
            convention: DeltaConvention::Magnitude,
        })
    }

    pub fn required_columns(&self) -> [&str; 5] {
        [
            COL_STORE_ID,
            COL_SUBCATEGORY,
            COL_CURRENT_QUANTITY,
            COL_UNIT_PRICE,
            self.delta_column.as_str(),
        ]
    }

    fn is_known_column(&self, name: &str) -> bool {
        name == COL_PRODUCT_ID
            || name == COL_RATIONALE_TAGS
            || self.required_columns().contains(&name)
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("Rule table '{rule}' is missing required column '{column}'")]
    MissingColumn { rule: SourceRule, column: String },

    #[error("Rule table '{rule}' declares column '{column}' more than once")]
    DuplicateColumn { rule: SourceRule, column: String },

    #[error("Rule '{rule}' has no table schema")]
    NoSchema { rule: SourceRule },
}

// =============================================================================
// Output
// =============================================================================

/// Normalized output of one rule table.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
    pub rule: SourceRule,
    pub rows_read: usize,
    pub records: Vec<AdjustmentRecord>,
    pub families: Vec<FamilyAdjustment>,
    pub rejections: Vec<Rejection>,
}

impl NormalizedBatch {
    pub fn empty(rule: SourceRule) -> Self {
        Self {
            rule,
            rows_read: 0,
            records: Vec::new(),
            families: Vec::new(),
            rejections: Vec::new(),
        }
    }
}

/// Resolved column positions for one table.
struct ColumnMap {
    store_id: usize,
    product_id: Option<usize>,
    subcategory: usize,
    current_quantity: usize,
    unit_price: usize,
    delta: usize,
    rationale_tags: Option<usize>,
    extra: Vec<(usize, String)>,
}

impl ColumnMap {
    fn resolve(schema: &RuleSchema, table: &RuleTable) -> Result<Self, SchemaError> {
        let mut seen = BTreeSet::new();
        for column in &table.columns {
            let name = column.trim();
            if !seen.insert(name) {
                return Err(SchemaError::DuplicateColumn {
                    rule: schema.rule,
                    column: name.to_string(),
                });
            }
        }

        let require = |name: &str| {
            table
                .column_index(name)
                .ok_or_else(|| SchemaError::MissingColumn {
                    rule: schema.rule,
                    column: name.to_string(),
                })
        };

        let extra = table
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !schema.is_known_column(c.trim()))
            .map(|(i, c)| (i, c.trim().to_string()))
            .collect();

        Ok(Self {
            store_id: require(COL_STORE_ID)?,
            product_id: table.column_index(COL_PRODUCT_ID),
            subcategory: require(COL_SUBCATEGORY)?,
            current_quantity: require(COL_CURRENT_QUANTITY)?,
            unit_price: require(COL_UNIT_PRICE)?,
            delta: require(schema.delta_column.as_str())?,
            rationale_tags: table.column_index(COL_RATIONALE_TAGS),
            extra,
        })
    }
}

// =============================================================================
// Normalizer
// =============================================================================

/// Parsed row before it becomes a record.
struct ParsedRow {
    store_id: StoreId,
    product_id: Option<ProductId>,
    subcategory: String,
    current_quantity: f64,
    unit_price: f64,
    raw_delta: f64,
    tags: BTreeSet<String>,
    metadata: BTreeMap<String, String>,
}

pub struct RuleNormalizer<'a> {
    clusters: &'a PeerClusters,
    core: &'a CoreCategorySet,
}

impl<'a> RuleNormalizer<'a> {
    pub fn new(clusters: &'a PeerClusters, core: &'a CoreCategorySet) -> Self {
        Self { clusters, core }
    }

    pub fn normalize(
        &self,
        schema: &RuleSchema,
        table: &RuleTable,
    ) -> Result<NormalizedBatch, SchemaError> {
        if schema.rule == SourceRule::StoreFloorTopUp {
            return Err(SchemaError::NoSchema { rule: schema.rule });
        }
        let columns = ColumnMap::resolve(schema, table)?;
        let rule = schema.rule;
        let direction = rule.direction();

        let mut batch = NormalizedBatch::empty(rule);
        batch.rows_read = table.rows.len();

        let mut seen_items: BTreeSet<ItemKey> = BTreeSet::new();
        let mut seen_families: BTreeSet<FamilyKey> = BTreeSet::new();
        let mut unclustered: BTreeSet<StoreId> = BTreeSet::new();

        for (index, row) in table.rows.iter().enumerate() {
            let cell = |i: usize| row.get(i).map(|s| s.trim()).unwrap_or("");
            let store_id = StoreId::new(cell(columns.store_id));
            let product_id = columns
                .product_id
                .map(cell)
                .filter(|p| !p.is_empty())
                .map(ProductId::new);
            let subcategory = cell(columns.subcategory).to_string();

            let reject = |reason: RejectionReason, proposed_delta: f64, detail: String| Rejection {
                source_rule: rule,
                store_id: store_id.clone(),
                product_id: product_id.clone(),
                subcategory: subcategory.clone(),
                proposed_delta,
                reason,
                detail,
            };

            let parsed = match parse_row(row, &columns, &cell) {
                Ok(p) => p,
                Err(detail) => {
                    debug!(rule = %rule, row = index + 1, %detail, "candidate → rejected(malformed_row)");
                    batch.rejections.push(reject(
                        RejectionReason::MalformedRow,
                        0.0,
                        format!("row {}: {detail}", index + 1),
                    ));
                    continue;
                }
            };

            if parsed.raw_delta == 0.0 {
                batch
                    .rejections
                    .push(reject(RejectionReason::ZeroDelta, 0.0, format!("row {}", index + 1)));
                continue;
            }

            let delta = match schema.convention {
                DeltaConvention::Magnitude if parsed.raw_delta < 0.0 => {
                    batch.rejections.push(reject(
                        RejectionReason::SignMismatch,
                        parsed.raw_delta,
                        format!(
                            "row {}: negative magnitude in '{}'",
                            index + 1,
                            schema.delta_column
                        ),
                    ));
                    continue;
                }
                DeltaConvention::Magnitude => direction.signum() * parsed.raw_delta,
                DeltaConvention::Signed => parsed.raw_delta,
            };

            if !direction.matches(delta) {
                batch.rejections.push(reject(
                    RejectionReason::SignMismatch,
                    delta,
                    format!("row {}: {rule} requires {}", index + 1, direction.as_str()),
                ));
                continue;
            }

            let cluster_id = match self.clusters.cluster_of(&parsed.store_id) {
                Some(c) => c.clone(),
                None => {
                    if unclustered.insert(parsed.store_id.clone()) {
                        warn!(rule = %rule, store = %parsed.store_id, "Store missing from peer-cluster table; using 'unassigned'");
                    }
                    ClusterId::unassigned()
                }
            };

            let mut tags = parsed.tags;
            if self.core.is_core(&parsed.subcategory) {
                tags.insert(TAG_CORE_PROTECTED.to_string());
            }

            match parsed.product_id {
                Some(product_id) => {
                    let key = ItemKey {
                        store_id: parsed.store_id.clone(),
                        product_id: product_id.clone(),
                    };
                    if !seen_items.insert(key.clone()) {
                        batch.rejections.push(reject(
                            RejectionReason::DuplicateRecord,
                            delta,
                            format!("row {}: {key} already emitted", index + 1),
                        ));
                        continue;
                    }
                    let mut record = AdjustmentRecord::new(
                        parsed.store_id,
                        product_id,
                        parsed.subcategory,
                        cluster_id,
                        rule,
                        delta,
                        parsed.current_quantity,
                        parsed.unit_price,
                    );
                    record.rationale_tags = tags;
                    record.metadata = parsed.metadata;
                    batch.records.push(record);
                }
                None => {
                    let key = FamilyKey {
                        store_id: parsed.store_id.clone(),
                        subcategory: parsed.subcategory.clone(),
                    };
                    if !seen_families.insert(key.clone()) {
                        batch.rejections.push(reject(
                            RejectionReason::DuplicateRecord,
                            delta,
                            format!("row {}: family {key} already emitted", index + 1),
                        ));
                        continue;
                    }
                    batch.families.push(FamilyAdjustment {
                        store_id: parsed.store_id,
                        subcategory: parsed.subcategory,
                        cluster_id,
                        source_rule: rule,
                        total_delta: delta,
                        current_quantity: parsed.current_quantity,
                        unit_price: parsed.unit_price,
                        rationale_tags: tags,
                        metadata: parsed.metadata,
                    });
                }
            }
        }

        info!(
            rule = %rule,
            rows = batch.rows_read,
            records = batch.records.len(),
            families = batch.families.len(),
            rejected = batch.rejections.len(),
            "Normalized rule table"
        );

        Ok(batch)
    }
}

fn parse_row<'r>(
    row: &'r [String],
    columns: &ColumnMap,
    cell: &impl Fn(usize) -> &'r str,
) -> Result<ParsedRow, String> {
    let store_id = cell(columns.store_id);
    if store_id.is_empty() {
        return Err("empty store_id".to_string());
    }
    let subcategory = cell(columns.subcategory);
    if subcategory.is_empty() {
        return Err("empty subcategory".to_string());
    }

    let number = |i: usize, name: &str| -> Result<f64, String> {
        let raw = cell(i);
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("'{name}' is not a number: '{raw}'"))
    };
    let non_negative = |i: usize, name: &str| -> Result<f64, String> {
        let v = number(i, name)?;
        if v < 0.0 {
            return Err(format!("'{name}' is negative: {v}"));
        }
        Ok(v)
    };

    let current_quantity = non_negative(columns.current_quantity, COL_CURRENT_QUANTITY)?;
    let unit_price = non_negative(columns.unit_price, COL_UNIT_PRICE)?;
    let raw_delta = number(columns.delta, "delta")?;

    let tags = columns
        .rationale_tags
        .map(|i| {
            cell(i)
                .split(';')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let metadata = columns
        .extra
        .iter()
        .map(|(i, name)| (name.clone(), row.get(*i).cloned().unwrap_or_default()))
        .collect();

    Ok(ParsedRow {
        store_id: StoreId::new(store_id),
        product_id: columns
            .product_id
            .map(|i| cell(i))
            .filter(|p| !p.is_empty())
            .map(ProductId::new),
        subcategory: subcategory.to_string(),
        current_quantity,
        unit_price,
        raw_delta,
        tags,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::ClusterAssignment;

    fn table(columns: &[&str], rows: &[&[&str]]) -> RuleTable {
        RuleTable::new(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    fn clusters() -> PeerClusters {
        PeerClusters::from_assignments([ClusterAssignment {
            store_id: StoreId::new("S1"),
            cluster_id: ClusterId::new("C1"),
        }])
    }

    const OVERCAP_COLS: &[&str] = &[
        "store_id",
        "product_id",
        "subcategory",
        "current_quantity",
        "unit_price",
        "reduce_qty",
    ];

    #[test]
    fn test_missing_required_column_is_fatal() {
        let clusters = clusters();
        let core = CoreCategorySet::builtin();
        let n = RuleNormalizer::new(&clusters, &core);
        let schema = RuleSchema::builtin(SourceRule::Overcapacity).unwrap();
        let t = table(&["store_id", "product_id", "subcategory", "unit_price", "reduce_qty"], &[]);
        assert_eq!(
            n.normalize(&schema, &t).unwrap_err(),
            SchemaError::MissingColumn {
                rule: SourceRule::Overcapacity,
                column: "current_quantity".into()
            }
        );
    }

    #[test]
    fn test_magnitude_is_emitted_with_rule_sign() {
        let clusters = clusters();
        let core = CoreCategorySet::builtin();
        let n = RuleNormalizer::new(&clusters, &core);
        let schema = RuleSchema::builtin(SourceRule::Overcapacity).unwrap();
        let t = table(OVERCAP_COLS, &[&["S1", "P1", "socks", "20", "5.0", "4"]]);
        let batch = n.normalize(&schema, &t).unwrap();
        assert_eq!(batch.records.len(), 1);
        let r = &batch.records[0];
        assert_eq!(r.quantity_delta, -4.0);
        assert_eq!(r.investment_delta, -20.0);
        assert_eq!(r.cluster_id, ClusterId::new("C1"));
        assert!(!r.has_tag(TAG_CORE_PROTECTED));
    }

    #[test]
    fn test_row_defects_become_counted_rejections() {
        let clusters = clusters();
        let core = CoreCategorySet::builtin();
        let n = RuleNormalizer::new(&clusters, &core);
        let schema = RuleSchema::builtin(SourceRule::Overcapacity).unwrap();
        let t = table(
            OVERCAP_COLS,
            &[
                &["S1", "P1", "socks", "abc", "5.0", "4"],
                &["S1", "P2", "socks", "10", "5.0", "0"],
                &["S1", "P3", "socks", "10", "5.0", "-2"],
                &["S1", "P4", "socks", "10", "5.0", "1"],
                &["S1", "P4", "socks", "10", "5.0", "2"],
            ],
        );
        let batch = n.normalize(&schema, &t).unwrap();
        let reasons: Vec<_> = batch.rejections.iter().map(|r| r.reason).collect();
        assert_eq!(
            reasons,
            vec![
                RejectionReason::MalformedRow,
                RejectionReason::ZeroDelta,
                RejectionReason::SignMismatch,
                RejectionReason::DuplicateRecord,
            ]
        );
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].quantity_delta, -1.0);
        assert_eq!(batch.rows_read, 5);
    }

    #[test]
    fn test_signed_convention_rejects_wrong_sign() {
        let clusters = clusters();
        let core = CoreCategorySet::builtin();
        let n = RuleNormalizer::new(&clusters, &core);
        let schema = RuleSchema {
            rule: SourceRule::GrowthCandidate,
            delta_column: "delta".into(),
            convention: DeltaConvention::Signed,
        };
        let t = table(
            &["store_id", "product_id", "subcategory", "current_quantity", "unit_price", "delta"],
            &[&["S1", "P1", "socks", "3", "5", "-2"], &["S1", "P2", "socks", "3", "5", "2"]],
        );
        let batch = n.normalize(&schema, &t).unwrap();
        assert_eq!(batch.rejections.len(), 1);
        assert_eq!(batch.rejections[0].reason, RejectionReason::SignMismatch);
        assert_eq!(batch.records[0].quantity_delta, 2.0);
    }

    #[test]
    fn test_extra_columns_and_tags_preserved() {
        let clusters = clusters();
        let core = CoreCategorySet::builtin();
        let n = RuleNormalizer::new(&clusters, &core);
        let schema = RuleSchema::builtin(SourceRule::GrowthScaling).unwrap();
        let t = table(
            &[
                "store_id",
                "product_id",
                "subcategory",
                "current_quantity",
                "unit_price",
                "scaled_qty",
                "rationale_tags",
                "base_factor",
            ],
            &[&[" S1 ", "P1", "Jeans", "8", "30", "3", "peer-benchmark-lag; top-seller", "1.2"]],
        );
        let batch = n.normalize(&schema, &t).unwrap();
        let r = &batch.records[0];
        assert_eq!(r.store_id, StoreId::new("S1"));
        assert!(r.has_tag("peer-benchmark-lag"));
        assert!(r.has_tag("top-seller"));
        assert!(r.has_tag(TAG_CORE_PROTECTED));
        assert_eq!(r.metadata.get("base_factor").map(String::as_str), Some("1.2"));
        assert!(!r.metadata.contains_key("rationale_tags"));
    }

    #[test]
    fn test_empty_product_is_family_row() {
        let clusters = clusters();
        let core = CoreCategorySet::builtin();
        let n = RuleNormalizer::new(&clusters, &core);
        let schema = RuleSchema::builtin(SourceRule::GrowthCandidate).unwrap();
        let t = table(
            &["store_id", "product_id", "subcategory", "current_quantity", "unit_price", "growth_qty"],
            &[&["S1", "", "socks", "40", "5", "10"], &["S1", " ", "socks", "40", "5", "10"]],
        );
        let batch = n.normalize(&schema, &t).unwrap();
        assert_eq!(batch.families.len(), 1);
        assert_eq!(batch.families[0].total_delta, 10.0);
        assert_eq!(batch.rejections[0].reason, RejectionReason::DuplicateRecord);
        assert!(batch.rejections[0].is_family_level());
    }

    #[test]
    fn test_unknown_store_gets_unassigned_cluster() {
        let clusters = clusters();
        let core = CoreCategorySet::builtin();
        let n = RuleNormalizer::new(&clusters, &core);
        let schema = RuleSchema::builtin(SourceRule::BelowMinimum).unwrap();
        let t = table(
            &["store_id", "product_id", "subcategory", "current_quantity", "unit_price", "increase_qty"],
            &[&["S9", "P1", "socks", "0", "5", "2"]],
        );
        let batch = n.normalize(&schema, &t).unwrap();
        assert!(batch.records[0].cluster_id.is_unassigned());
    }

    #[test]
    fn test_internal_rule_has_no_schema() {
        assert!(RuleSchema::builtin(SourceRule::StoreFloorTopUp).is_none());
    }
}
