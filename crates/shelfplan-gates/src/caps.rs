//! # Safety Cap Engine
//!
//! Bounds one admitted delta with every applicable cap family at once.
//!
//! ## Hard Laws
//! - L1: Smallest cap wins
//! - L2: Caps only shrink magnitude toward zero; the sign is preserved
//! - L3: At most one binding cap is reported; ties go to the lexically-first name
//! - L4: A capped magnitude below `min_recommend_qty` is zeroed, not rounded
//!
//! ## Cap Families
//! | Cap | Limit |
//! |-----|-------|
//! | `current_quantity_pct` | pct × current quantity (increase skipped when current is 0) |
//! | `core_current_quantity_pct` | core pct × current quantity (core reductions) |
//! | `cluster_median_pct` | pct × peer cluster median (enough peer stores, median > 0) |
//! | `absolute_units` | fixed ceiling |
//! | `min_quantity_threshold` | zeroes sub-threshold results |

use crate::config::GuardrailConfig;
use crate::peers::PeerStats;
use shelfplan_models::{CapKind, Direction, TOLERANCE};

/// Peer context for one record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapContext {
    pub is_core: bool,
    /// Distinct cluster stores behind `cluster_median`.
    pub peer_stores: usize,
    pub cluster_median: Option<f64>,
}

impl CapContext {
    pub fn from_peers(is_core: bool, peers: Option<&PeerStats>) -> Self {
        Self {
            is_core,
            peer_stores: peers.map_or(0, PeerStats::store_count),
            cluster_median: peers.map(|p| p.median),
        }
    }
}

/// Result of capping one delta.
#[derive(Debug, Clone, PartialEq)]
pub struct CapOutcome {
    pub input_delta: f64,
    pub capped_delta: f64,
    pub binding: Option<CapKind>,
    /// Every limit evaluated, in cap-name order.
    pub limits: Vec<(CapKind, f64)>,
}

impl CapOutcome {
    pub fn was_capped(&self) -> bool {
        self.binding.is_some()
    }
}

/// Cap `delta` (signed) for an item holding `current_quantity`.
pub fn apply_caps(
    delta: f64,
    current_quantity: f64,
    guardrail: &GuardrailConfig,
    ctx: &CapContext,
) -> CapOutcome {
    let direction = if delta >= 0.0 {
        Direction::Increase
    } else {
        Direction::Reduction
    };
    let magnitude = delta.abs();

    let mut limits: Vec<(CapKind, f64)> = Vec::with_capacity(3);

    match direction {
        Direction::Increase => {
            if current_quantity > 0.0 {
                limits.push((
                    CapKind::CurrentQuantityPct,
                    guardrail.max_increase_pct * current_quantity,
                ));
            }
        }
        Direction::Reduction => {
            let (kind, pct) = if ctx.is_core {
                (
                    CapKind::CoreCurrentQuantityPct,
                    guardrail.core_subcategory_max_reduction_pct,
                )
            } else {
                (CapKind::CurrentQuantityPct, guardrail.max_reduction_pct)
            };
            limits.push((kind, pct * current_quantity.max(0.0)));
        }
    }

    if ctx.peer_stores >= guardrail.min_cluster_size {
        if let Some(median) = ctx.cluster_median.filter(|m| *m > 0.0) {
            limits.push((
                CapKind::ClusterMedianPct,
                guardrail.max_cluster_median_pct * median,
            ));
        }
    }

    limits.push((CapKind::AbsoluteUnits, guardrail.max_abs_units));
    limits.sort_by(|a, b| a.0.cmp(&b.0));

    // Tightest limit; near-ties keep the lexically-first cap.
    let mut tightest: Option<(CapKind, f64)> = None;
    for &(kind, limit) in &limits {
        match tightest {
            Some((_, best)) if limit >= best - TOLERANCE => {}
            _ => tightest = Some((kind, limit)),
        }
    }

    let mut capped = magnitude;
    let mut binding = None;
    if let Some((kind, limit)) = tightest {
        if magnitude - limit > TOLERANCE {
            capped = limit.max(0.0);
            binding = Some(kind);
        }
    }

    if capped > 0.0 && capped < guardrail.min_recommend_qty {
        capped = 0.0;
        binding = Some(CapKind::MinQuantityThreshold);
    }

    CapOutcome {
        input_delta: delta,
        capped_delta: direction.signum() * capped,
        binding,
        limits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guardrail() -> GuardrailConfig {
        GuardrailConfig {
            max_increase_pct: 0.5,
            max_reduction_pct: 0.4,
            min_cluster_size: 3,
            core_subcategory_max_reduction_pct: 0.2,
            respect_prior_increases: true,
            require_upstream_candidate: false,
            max_cluster_median_pct: 0.6,
            max_abs_units: 30.0,
            min_recommend_qty: 1.0,
        }
    }

    fn ctx(is_core: bool, peer_stores: usize, median: Option<f64>) -> CapContext {
        CapContext {
            is_core,
            peer_stores,
            cluster_median: median,
        }
    }

    #[test]
    fn test_uncapped_passes_through() {
        let out = apply_caps(3.0, 20.0, &guardrail(), &ctx(false, 0, None));
        assert_eq!(out.capped_delta, 3.0);
        assert!(!out.was_capped());
    }

    #[test]
    fn test_reduction_capped_by_current_quantity_pct() {
        let out = apply_caps(-15.0, 20.0, &guardrail(), &ctx(false, 0, None));
        assert_eq!(out.capped_delta, -8.0);
        assert_eq!(out.binding, Some(CapKind::CurrentQuantityPct));
    }

    #[test]
    fn test_core_reduction_uses_tighter_cap() {
        let out = apply_caps(-15.0, 20.0, &guardrail(), &ctx(true, 0, None));
        assert_eq!(out.capped_delta, -4.0);
        assert_eq!(out.binding, Some(CapKind::CoreCurrentQuantityPct));
    }

    #[test]
    fn test_cluster_median_skipped_with_few_peer_stores() {
        let g = guardrail();
        let small = apply_caps(10.0, 40.0, &g, &ctx(false, 2, Some(5.0)));
        assert_eq!(small.capped_delta, 10.0);

        let valid = apply_caps(10.0, 40.0, &g, &ctx(false, 3, Some(5.0)));
        assert_eq!(valid.capped_delta, 3.0);
        assert_eq!(valid.binding, Some(CapKind::ClusterMedianPct));

        let zero_median = apply_caps(10.0, 40.0, &g, &ctx(false, 3, Some(0.0)));
        assert_eq!(zero_median.capped_delta, 10.0);
    }

    #[test]
    fn test_increase_from_zero_skips_pct_cap() {
        let out = apply_caps(50.0, 0.0, &guardrail(), &ctx(false, 0, None));
        assert_eq!(out.capped_delta, 30.0);
        assert_eq!(out.binding, Some(CapKind::AbsoluteUnits));
    }

    #[test]
    fn test_tie_breaks_to_lexically_first() {
        // pct cap = 0.5 * 60 = 30 = absolute cap
        let out = apply_caps(50.0, 60.0, &guardrail(), &ctx(false, 0, None));
        assert_eq!(out.capped_delta, 30.0);
        assert_eq!(out.binding, Some(CapKind::AbsoluteUnits));
    }

    #[test]
    fn test_sub_threshold_is_zeroed() {
        // 0.4 * 2 = 0.8 < min_recommend_qty
        let out = apply_caps(-5.0, 2.0, &guardrail(), &ctx(false, 0, None));
        assert_eq!(out.capped_delta, 0.0);
        assert_eq!(out.binding, Some(CapKind::MinQuantityThreshold));

        let small_input = apply_caps(0.5, 20.0, &guardrail(), &ctx(false, 0, None));
        assert_eq!(small_input.capped_delta, 0.0);
    }

    #[test]
    fn test_capping_is_monotonic_and_sign_preserving() {
        let g = guardrail();
        for delta in [-40.0, -12.5, -3.0, 2.0, 9.0, 55.0] {
            for current in [0.0, 4.0, 25.0, 100.0] {
                for c in [ctx(false, 5, Some(12.0)), ctx(true, 1, None)] {
                    let out = apply_caps(delta, current, &g, &c);
                    assert!(out.capped_delta.abs() <= delta.abs() + TOLERANCE);
                    assert!(out.capped_delta == 0.0 || out.capped_delta.signum() == delta.signum());
                }
            }
        }
    }
}
