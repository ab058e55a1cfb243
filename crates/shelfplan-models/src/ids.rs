//! Identifier newtypes.
//!
//! Store and product identifiers are read and compared as trimmed strings.
//! Numeric-looking identifiers ("00123") are never coerced.

use serde::{Deserialize, Serialize};

// =============================================================================
// Store / Product / Cluster
// =============================================================================

/// Store identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(pub String);

impl StoreId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Product (SKU) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub String);

impl ProductId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Peer cluster identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub String);

impl ClusterId {
    /// Cluster assigned to stores missing from the peer-cluster table.
    pub const UNASSIGNED: &'static str = "unassigned";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn unassigned() -> Self {
        Self(Self::UNASSIGNED.to_string())
    }

    pub fn is_unassigned(&self) -> bool {
        self.0 == Self::UNASSIGNED
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Composite Keys
// =============================================================================

/// Consolidation key: exactly one decision per (store, product).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub store_id: StoreId,
    pub product_id: ProductId,
}

impl ItemKey {
    pub fn new(store_id: impl Into<String>, product_id: impl Into<String>) -> Self {
        Self {
            store_id: StoreId::new(store_id),
            product_id: ProductId::new(product_id),
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.store_id, self.product_id)
    }
}

/// Family key: a subcategory at one store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FamilyKey {
    pub store_id: StoreId,
    pub subcategory: String,
}

impl FamilyKey {
    pub fn new(store_id: impl Into<String>, subcategory: impl Into<String>) -> Self {
        Self {
            store_id: StoreId::new(store_id),
            subcategory: subcategory.into().trim().to_string(),
        }
    }
}

impl std::fmt::Display for FamilyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.store_id, self.subcategory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_trimmed_strings() {
        let key = ItemKey::new(" 00123 ", "SKU-9 ");
        assert_eq!(key.store_id.as_str(), "00123");
        assert_eq!(key.product_id.as_str(), "SKU-9");
        assert_ne!(StoreId::new("0123"), StoreId::new("123"));
    }

    #[test]
    fn test_item_key_ordering_is_store_then_product() {
        let mut keys = vec![
            ItemKey::new("S2", "A"),
            ItemKey::new("S1", "B"),
            ItemKey::new("S1", "A"),
        ];
        keys.sort();
        assert_eq!(keys[0], ItemKey::new("S1", "A"));
        assert_eq!(keys[1], ItemKey::new("S1", "B"));
        assert_eq!(keys[2], ItemKey::new("S2", "A"));
    }
}
