//! CSV input tables.
//!
//! Rule tables are read as raw string cells so that the normalizer owns
//! every per-row decision (malformed cells become counted rejections, not
//! read errors). Reference tables deserialize straight into their row types.
//! A file that cannot be read or parsed as CSV aborts the run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::{ReaderBuilder, Trim};
use serde::de::DeserializeOwned;
use shelfplan_gates::{
    ApprovedCandidate, ApprovedCandidates, ClusterAssignment, ManualMinimum, PeerClusters,
    PipelineInputs, RuleTable, SiblingCatalog, SiblingSales,
};
use shelfplan_models::SourceRule;
use tracing::info;

/// Read a rule table as header + raw rows.
pub fn read_rule_table(path: &Path) -> Result<RuleTable> {
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .from_path(path)
        .with_context(|| format!("open rule table: {}", path.display()))?;
    let columns: Vec<String> = reader
        .headers()
        .with_context(|| format!("read header: {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect();
    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("{}: row {}", path.display(), i + 2))?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(RuleTable::new(columns, rows))
}

/// Deserialize every row of a reference table.
pub fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .from_path(path)
        .with_context(|| format!("open table: {}", path.display()))?;
    let mut rows = Vec::new();
    for (i, row) in reader.deserialize().enumerate() {
        rows.push(row.with_context(|| format!("{}: row {}", path.display(), i + 2))?);
    }
    Ok(rows)
}

fn read_optional_rows<T: DeserializeOwned>(path: Option<&Path>) -> Result<Vec<T>> {
    match path {
        Some(path) => read_rows(path),
        None => Ok(Vec::new()),
    }
}

// =============================================================================
// Input Set
// =============================================================================

/// Locations of every input table for one run.
#[derive(Debug, Clone, Default)]
pub struct InputPaths {
    pub clusters: PathBuf,
    pub rule_tables: BTreeMap<SourceRule, PathBuf>,
    pub approved: Option<PathBuf>,
    pub siblings: Option<PathBuf>,
    pub manual_minimums: Option<PathBuf>,
}

impl InputPaths {
    /// Read all tables into memory.
    pub fn load(&self) -> Result<PipelineInputs> {
        let assignments: Vec<ClusterAssignment> = read_rows(&self.clusters)?;
        let clusters = PeerClusters::from_assignments(assignments);

        let mut rule_tables = BTreeMap::new();
        for (rule, path) in &self.rule_tables {
            let table = read_rule_table(path)?;
            info!(rule = %rule, path = %path.display(), rows = table.len(), "Rule table loaded");
            rule_tables.insert(*rule, table);
        }

        let approved: Vec<ApprovedCandidate> = read_optional_rows(self.approved.as_deref())?;
        let siblings: Vec<SiblingSales> = read_optional_rows(self.siblings.as_deref())?;
        let manual_minimums: Vec<ManualMinimum> =
            read_optional_rows(self.manual_minimums.as_deref())?;

        info!(
            stores = clusters.store_count(),
            approved = approved.len(),
            siblings = siblings.len(),
            manual_minimums = manual_minimums.len(),
            "Reference tables loaded"
        );

        Ok(PipelineInputs {
            rule_tables,
            clusters,
            approved: ApprovedCandidates::from_rows(approved),
            siblings: SiblingCatalog::from_rows(siblings),
            manual_minimums,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfplan_models::{ClusterId, StoreId};
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_rule_table_keeps_raw_cells() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "below.csv",
            "store_id,product_id,subcategory,current_quantity,unit_price,increase_qty\n\
             S1 , 00123,socks,2,9.5,abc\n",
        );
        let table = read_rule_table(&path).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.column_index("increase_qty"), Some(5));
        assert_eq!(table.rows[0][0], "S1");
        assert_eq!(table.rows[0][1], "00123");
        assert_eq!(table.rows[0][5], "abc");
    }

    #[test]
    fn test_ragged_rule_table_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "bad.csv", "store_id,product_id\nS1\n");
        assert!(read_rule_table(&path).is_err());
    }

    #[test]
    fn test_approved_optional_columns() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "approved.csv",
            "store_id,product_id,subcategory,current_quantity,unit_price,score\n\
             S1,P1,socks,3,10,0.9\n\
             S2,P2,,,,\n",
        );
        let rows: Vec<ApprovedCandidate> = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].score, Some(0.9));
        assert_eq!(rows[1].subcategory, None);
        assert_eq!(rows[1].current_quantity, None);
    }

    #[test]
    fn test_load_input_set() {
        let dir = TempDir::new().unwrap();
        let clusters = write(&dir, "clusters.csv", "store_id,cluster_id\nS1,C1\nS2,C1\n");
        let below = write(
            &dir,
            "below.csv",
            "store_id,product_id,subcategory,current_quantity,unit_price,increase_qty\n\
             S1,P1,socks,2,9.5,3\n",
        );
        let minimums = write(&dir, "min.csv", "store_id,subcategory,min_qty\nS1,socks,4\n");

        let mut paths = InputPaths {
            clusters,
            manual_minimums: Some(minimums),
            ..InputPaths::default()
        };
        paths.rule_tables.insert(SourceRule::BelowMinimum, below);
        let inputs = paths.load().unwrap();

        assert_eq!(inputs.clusters.store_count(), 2);
        assert_eq!(
            inputs.clusters.cluster_of(&StoreId::new("S2")),
            Some(&ClusterId::new("C1"))
        );
        assert_eq!(inputs.rule_tables[&SourceRule::BelowMinimum].len(), 1);
        assert_eq!(inputs.manual_minimums.len(), 1);
        assert!(inputs.approved.is_empty());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let paths = InputPaths {
            clusters: PathBuf::from("/nonexistent/clusters.csv"),
            ..InputPaths::default()
        };
        let err = paths.load().unwrap_err();
        assert!(format!("{err:#}").contains("clusters.csv"));
    }
}
