//! Rejection taxonomy.
//!
//! Every record dropped by the pipeline carries exactly one reason. Reasons
//! are counted in the run summary, so no record disappears silently.

use crate::adjustment::SourceRule;
use crate::ids::{ProductId, StoreId};
use serde::{Deserialize, Serialize};

/// Error class a rejection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionClass {
    /// A later stage would violate an earlier stage's invariant.
    GuardrailViolation,
    /// Growth record without an approving upstream row (steady state).
    MissingUpstreamCandidate,
    /// Row-level input defect (bad cell, wrong sign, duplicate).
    InputQuality,
}

/// Why a record was rejected.
///
/// Frozen: `code()` strings appear in output tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// A numeric cell could not be parsed.
    MalformedRow,
    /// Delta is zero; nothing to recommend.
    ZeroDelta,
    /// Delta sign contradicts the rule's fixed direction.
    SignMismatch,
    /// Same key already emitted by this stage.
    DuplicateRecord,
    /// Reduction on a key increased by an earlier stage.
    BlockedByPriorIncrease,
    /// Key absent from the approved candidate set.
    MissingUpstreamCandidate,
    /// Family adjustment with no sibling eligible for allocation.
    NoEligibleSibling,
}

impl RejectionReason {
    pub const ALL: [RejectionReason; 7] = [
        RejectionReason::MalformedRow,
        RejectionReason::ZeroDelta,
        RejectionReason::SignMismatch,
        RejectionReason::DuplicateRecord,
        RejectionReason::BlockedByPriorIncrease,
        RejectionReason::MissingUpstreamCandidate,
        RejectionReason::NoEligibleSibling,
    ];

    pub fn code(self) -> &'static str {
        match self {
            RejectionReason::MalformedRow => "malformed_row",
            RejectionReason::ZeroDelta => "zero_delta",
            RejectionReason::SignMismatch => "sign_mismatch",
            RejectionReason::DuplicateRecord => "duplicate_record",
            RejectionReason::BlockedByPriorIncrease => "blocked_by_prior_increase",
            RejectionReason::MissingUpstreamCandidate => "missing_upstream_candidate",
            RejectionReason::NoEligibleSibling => "no_eligible_sibling",
        }
    }

    pub fn class(self) -> RejectionClass {
        match self {
            RejectionReason::MalformedRow
            | RejectionReason::ZeroDelta
            | RejectionReason::SignMismatch
            | RejectionReason::DuplicateRecord => RejectionClass::InputQuality,
            RejectionReason::BlockedByPriorIncrease | RejectionReason::NoEligibleSibling => {
                RejectionClass::GuardrailViolation
            }
            RejectionReason::MissingUpstreamCandidate => RejectionClass::MissingUpstreamCandidate,
        }
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A rejected candidate, kept for the run summary and traceability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub source_rule: SourceRule,
    pub store_id: StoreId,
    /// `None` for family-level rows.
    pub product_id: Option<ProductId>,
    pub subcategory: String,
    pub proposed_delta: f64,
    pub reason: RejectionReason,
    pub detail: String,
}

impl Rejection {
    pub fn is_family_level(&self) -> bool {
        self.product_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_unique() {
        let mut codes: Vec<_> = RejectionReason::ALL.iter().map(|r| r.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), RejectionReason::ALL.len());
    }

    #[test]
    fn test_classes() {
        assert_eq!(
            RejectionReason::MissingUpstreamCandidate.class(),
            RejectionClass::MissingUpstreamCandidate
        );
        assert_eq!(
            RejectionReason::BlockedByPriorIncrease.class(),
            RejectionClass::GuardrailViolation
        );
        assert_eq!(RejectionReason::MalformedRow.class(), RejectionClass::InputQuality);
    }
}
