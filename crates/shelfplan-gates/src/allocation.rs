//! # Allocation Share Distributor
//!
//! Splits a family-level total across sibling SKUs at one store.
//!
//! ## Hard Laws
//! - L1: Shares sum to the family total within `TOLERANCE` (checked; a
//!   violation is an error, never silently repaired)
//! - L2: An exploration sibling receives at most
//!   `min(exploration_cap_fraction, 1/n) × total`
//! - L3: Established siblings split the remainder by trailing sales share
//! - L4: When every sibling is exploration, the total is split equally
//! - L5: Every share carries the sign of the total

use crate::config::AllocationConfig;
use serde::{Deserialize, Serialize};
use shelfplan_models::{FamilyKey, ProductId, StoreId, TOLERANCE};
use std::collections::BTreeMap;
use thiserror::Error;

// =============================================================================
// Sibling Catalog
// =============================================================================

/// One row of the sibling sales table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiblingSales {
    pub store_id: StoreId,
    pub product_id: ProductId,
    pub subcategory: String,
    pub trailing_sales_amount: f64,
    pub current_quantity: f64,
    pub unit_price: f64,
}

/// Sibling SKUs per family, ordered by product id.
#[derive(Debug, Clone, Default)]
pub struct SiblingCatalog {
    by_family: BTreeMap<FamilyKey, BTreeMap<ProductId, SiblingSales>>,
}

impl SiblingCatalog {
    /// Build from table rows. The first row for a (store, product) wins.
    pub fn from_rows(rows: impl IntoIterator<Item = SiblingSales>) -> Self {
        let mut by_family: BTreeMap<FamilyKey, BTreeMap<ProductId, SiblingSales>> =
            BTreeMap::new();
        let mut seen = std::collections::BTreeSet::new();
        for mut row in rows {
            row.store_id = StoreId::new(row.store_id.0);
            row.product_id = ProductId::new(row.product_id.0);
            row.subcategory = row.subcategory.trim().to_string();
            if !seen.insert((row.store_id.clone(), row.product_id.clone())) {
                continue;
            }
            let family = FamilyKey::new(row.store_id.as_str(), row.subcategory.as_str());
            by_family
                .entry(family)
                .or_default()
                .insert(row.product_id.clone(), row);
        }
        Self { by_family }
    }

    pub fn siblings(&self, family: &FamilyKey) -> Vec<&SiblingSales> {
        self.by_family
            .get(family)
            .map(|m| m.values().collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SiblingSales> {
        self.by_family.values().flat_map(|m| m.values())
    }
}

// =============================================================================
// Distribution
// =============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AllocationError {
    #[error("Family {family} has no siblings to allocate {total}")]
    NoSiblings { family: FamilyKey, total: f64 },

    #[error("Allocation for family {family} does not conserve total: {allocated} != {total}")]
    ConservationViolated {
        family: FamilyKey,
        total: f64,
        allocated: f64,
    },
}

/// One sibling's share of a family total.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationShare {
    pub product_id: ProductId,
    /// Trailing sales share among the eligible siblings (0 when no sales).
    pub sales_share: f64,
    pub quantity: f64,
    pub exploration: bool,
}

/// Split `total` across `siblings`.
pub fn distribute(
    family: &FamilyKey,
    total: f64,
    siblings: &[&SiblingSales],
    config: &AllocationConfig,
) -> Result<Vec<AllocationShare>, AllocationError> {
    let n = siblings.len();
    if n == 0 {
        return Err(AllocationError::NoSiblings {
            family: family.clone(),
            total,
        });
    }

    let sales: Vec<f64> = siblings
        .iter()
        .map(|s| {
            if s.trailing_sales_amount.is_finite() {
                s.trailing_sales_amount.max(0.0)
            } else {
                0.0
            }
        })
        .collect();
    let total_sales: f64 = sales.iter().sum();
    let shares: Vec<f64> = sales
        .iter()
        .map(|s| if total_sales > 0.0 { s / total_sales } else { 0.0 })
        .collect();
    let exploration: Vec<bool> = sales
        .iter()
        .zip(&shares)
        .map(|(s, share)| *s <= 0.0 || *share < config.exploration_share_threshold)
        .collect();

    let explorers = exploration.iter().filter(|e| **e).count();
    let quantities: Vec<f64> = if explorers == n {
        vec![total / n as f64; n]
    } else {
        let per_explorer = config.exploration_cap_fraction.min(1.0 / n as f64) * total;
        let remainder = total - per_explorer * explorers as f64;
        let established_share: f64 = shares
            .iter()
            .zip(&exploration)
            .filter(|(_, e)| !**e)
            .map(|(s, _)| s)
            .sum();
        shares
            .iter()
            .zip(&exploration)
            .map(|(share, is_explorer)| {
                if *is_explorer {
                    per_explorer
                } else {
                    remainder * share / established_share
                }
            })
            .collect()
    };

    let allocated: f64 = quantities.iter().sum();
    if !allocated.is_finite() || (allocated - total).abs() > TOLERANCE {
        return Err(AllocationError::ConservationViolated {
            family: family.clone(),
            total,
            allocated,
        });
    }

    Ok(siblings
        .iter()
        .zip(quantities)
        .zip(shares.iter().zip(&exploration))
        .map(|((sibling, quantity), (share, is_explorer))| AllocationShare {
            product_id: sibling.product_id.clone(),
            sales_share: *share,
            quantity,
            exploration: *is_explorer,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sibling(product: &str, sales: f64) -> SiblingSales {
        SiblingSales {
            store_id: StoreId::new("S1"),
            product_id: ProductId::new(product),
            subcategory: "jeans".into(),
            trailing_sales_amount: sales,
            current_quantity: 10.0,
            unit_price: 50.0,
        }
    }

    fn config() -> AllocationConfig {
        AllocationConfig {
            exploration_cap_fraction: 0.15,
            exploration_share_threshold: 0.05,
        }
    }

    fn family() -> FamilyKey {
        FamilyKey::new("S1", "jeans")
    }

    #[test]
    fn test_proportional_split() {
        let a = sibling("A", 600.0);
        let b = sibling("B", 400.0);
        let shares = distribute(&family(), 10.0, &[&a, &b], &config()).unwrap();
        assert!((shares[0].quantity - 6.0).abs() < 1e-9);
        assert!((shares[1].quantity - 4.0).abs() < 1e-9);
        assert!(shares.iter().all(|s| !s.exploration));
    }

    #[test]
    fn test_exploration_sibling_is_capped() {
        let seller = sibling("A", 999.0);
        let newcomer = sibling("B", 1.0);
        let shares = distribute(&family(), 10.0, &[&seller, &newcomer], &config()).unwrap();
        assert!(shares[1].exploration);
        assert!(shares[1].quantity <= 1.5 + 1e-9);
        assert!((shares[0].quantity + shares[1].quantity - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_exploration_cap_limited_by_one_over_n() {
        let mut cfg = config();
        cfg.exploration_cap_fraction = 0.9;
        let seller = sibling("A", 1000.0);
        let newcomer = sibling("B", 0.0);
        let shares = distribute(&family(), 10.0, &[&seller, &newcomer], &cfg).unwrap();
        assert_eq!(shares[1].quantity, 5.0);
        assert_eq!(shares[0].quantity, 5.0);
    }

    #[test]
    fn test_all_exploration_splits_equally() {
        let a = sibling("A", 0.0);
        let b = sibling("B", -3.0);
        let c = sibling("C", 0.0);
        let shares = distribute(&family(), 9.0, &[&a, &b, &c], &config()).unwrap();
        assert!(shares.iter().all(|s| s.exploration && s.quantity == 3.0));
    }

    #[test]
    fn test_negative_total_keeps_sign() {
        let a = sibling("A", 750.0);
        let b = sibling("B", 250.0);
        let shares = distribute(&family(), -8.0, &[&a, &b], &config()).unwrap();
        assert!((shares[0].quantity + 6.0).abs() < 1e-9);
        assert!((shares[1].quantity + 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_siblings_is_an_error() {
        assert!(matches!(
            distribute(&family(), 4.0, &[], &config()),
            Err(AllocationError::NoSiblings { .. })
        ));
    }

    #[test]
    fn test_conservation_holds_for_many_siblings() {
        let rows: Vec<SiblingSales> = (0..7)
            .map(|i| sibling(&format!("P{i}"), [0.0, 3.0, 120.0, 7.0, 55.5, 1.0, 900.0][i]))
            .collect();
        let refs: Vec<&SiblingSales> = rows.iter().collect();
        for total in [1.0, 13.0, -7.5, 250.0] {
            let shares = distribute(&family(), total, &refs, &config()).unwrap();
            let sum: f64 = shares.iter().map(|s| s.quantity).sum();
            assert!((sum - total).abs() <= TOLERANCE);
        }
    }

    #[test]
    fn test_catalog_groups_by_family() {
        let mut other = sibling("Z", 5.0);
        other.subcategory = "socks".into();
        let catalog = SiblingCatalog::from_rows([sibling("B", 1.0), sibling("A", 2.0), other, sibling("A", 9.0)]);
        let jeans = catalog.siblings(&family());
        assert_eq!(jeans.len(), 2);
        assert_eq!(jeans[0].product_id, ProductId::new("A"));
        assert_eq!(jeans[0].trailing_sales_amount, 2.0);
        assert_eq!(catalog.siblings(&FamilyKey::new("S1", "socks")).len(), 1);
    }
}
