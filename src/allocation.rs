// =============================================================================
// Allocation Policies — distribute one logical order across active venues
// =============================================================================
//
// Pure policy math, separated from the venue registry so every strategy is
// unit-testable without I/O. Invariant for every non-empty allocation:
//
//     | Σ allocations - amount |  <=  1e-5 * amount
//
// WEIGHTED shares are rounded to a configurable number of decimals; the
// rounding residual is folded back into the largest share so the sum
// invariant holds exactly. CUSTOM ratios may under-allocate; a remainder
// greater than 1e-5 goes to the top-priority venue.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::EngineError;

/// Relative tolerance for the sum-preservation invariant.
pub const ALLOCATION_EPSILON: f64 = 1e-5;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Which policy distributes order amounts across venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationStrategyKind {
    Priority,
    RoundRobin,
    SplitEqual,
    Weighted,
    Custom,
}

impl Default for AllocationStrategyKind {
    fn default() -> Self {
        Self::Priority
    }
}

impl std::fmt::Display for AllocationStrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Priority => "PRIORITY",
            Self::RoundRobin => "ROUND_ROBIN",
            Self::SplitEqual => "SPLIT_EQUAL",
            Self::Weighted => "WEIGHTED",
            Self::Custom => "CUSTOM",
        };
        write!(f, "{s}")
    }
}

/// Full allocation policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    pub strategy: AllocationStrategyKind,
    /// Per-venue weights (WEIGHTED). Only positive weights participate.
    #[serde(default)]
    pub weights: HashMap<String, f64>,
    /// Per-venue ratios in [0, 1] (CUSTOM).
    #[serde(default)]
    pub custom_ratios: HashMap<String, f64>,
    /// Decimal places for WEIGHTED share rounding.
    #[serde(default = "default_rounding_decimals")]
    pub rounding_decimals: u32,
}

fn default_rounding_decimals() -> u32 {
    2
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            strategy: AllocationStrategyKind::Priority,
            weights: HashMap::new(),
            custom_ratios: HashMap::new(),
            rounding_decimals: default_rounding_decimals(),
        }
    }
}

/// A venue as seen by the allocator: id plus priority, already filtered to
/// active venues and sorted ascending by priority (ties by insertion order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveVenue {
    pub id: String,
    pub priority: i32,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate an allocation config against the current active set.
///
/// WEIGHTED requires a positive weight for every active venue; CUSTOM
/// requires a ratio entry for every active venue.
pub fn validate_allocation(
    config: &AllocationConfig,
    active: &[ActiveVenue],
) -> Result<(), EngineError> {
    match config.strategy {
        AllocationStrategyKind::Weighted => {
            for venue in active {
                let w = config.weights.get(&venue.id).copied().unwrap_or(0.0);
                if w <= 0.0 {
                    return Err(EngineError::InvalidAllocation(format!(
                        "WEIGHTED requires a positive weight for active venue '{}'",
                        venue.id
                    )));
                }
            }
        }
        AllocationStrategyKind::Custom => {
            for venue in active {
                if !config.custom_ratios.contains_key(&venue.id) {
                    return Err(EngineError::InvalidAllocation(format!(
                        "CUSTOM requires a ratio entry for active venue '{}'",
                        venue.id
                    )));
                }
            }
            let total: f64 = config.custom_ratios.values().sum();
            if total > 1.0 + ALLOCATION_EPSILON {
                warn!(total, "CUSTOM ratios sum above 1.0 — order will over-allocate");
            }
        }
        _ => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Distribute `amount` across the active venues under `config`.
///
/// Returns `(venue_id, amount)` pairs in active-set order. The round-robin
/// counter is shared by the caller so concurrent allocations advance it
/// atomically.
pub fn allocate(
    amount: f64,
    active: &[ActiveVenue],
    config: &AllocationConfig,
    round_robin: &AtomicUsize,
) -> Result<Vec<(String, f64)>, EngineError> {
    if active.is_empty() {
        return Err(EngineError::NoActiveVenue);
    }

    let allocations = match config.strategy {
        AllocationStrategyKind::Priority => allocate_priority(amount, active),
        AllocationStrategyKind::RoundRobin => {
            let idx = round_robin.fetch_add(1, Ordering::Relaxed) % active.len();
            vec![(active[idx].id.clone(), amount)]
        }
        AllocationStrategyKind::SplitEqual => {
            let share = amount / active.len() as f64;
            active.iter().map(|v| (v.id.clone(), share)).collect()
        }
        AllocationStrategyKind::Weighted => allocate_weighted(amount, active, config),
        AllocationStrategyKind::Custom => allocate_custom(amount, active, config),
    };

    let total: f64 = allocations.iter().map(|(_, a)| a).sum();
    debug_assert!(
        (total - amount).abs() <= ALLOCATION_EPSILON * amount.abs(),
        "allocation sum invariant violated: {total} vs {amount}"
    );

    debug!(
        strategy = %config.strategy,
        amount,
        venues = allocations.len(),
        "order amount allocated"
    );

    Ok(allocations)
}

fn allocate_priority(amount: f64, active: &[ActiveVenue]) -> Vec<(String, f64)> {
    vec![(active[0].id.clone(), amount)]
}

/// WEIGHTED: proportional shares rounded to `rounding_decimals`; the rounding
/// residual is folded into the largest raw share so Σ equals the requested
/// amount exactly. Zero total weight falls back to PRIORITY.
fn allocate_weighted(
    amount: f64,
    active: &[ActiveVenue],
    config: &AllocationConfig,
) -> Vec<(String, f64)> {
    let weighted: Vec<(&ActiveVenue, f64)> = active
        .iter()
        .filter_map(|v| {
            let w = config.weights.get(&v.id).copied().unwrap_or(0.0);
            (w > 0.0).then_some((v, w))
        })
        .collect();

    let total_weight: f64 = weighted.iter().map(|(_, w)| w).sum();
    if total_weight <= 0.0 {
        warn!("WEIGHTED allocation has no positive weights — falling back to PRIORITY");
        return allocate_priority(amount, active);
    }

    let quantum = 10f64.powi(config.rounding_decimals as i32);
    let mut shares: Vec<(String, f64, f64)> = weighted
        .iter()
        .map(|(v, w)| {
            let raw = amount * w / total_weight;
            let rounded = (raw * quantum).round() / quantum;
            (v.id.clone(), rounded, raw)
        })
        .collect();

    // Fold the rounding residual into the largest raw share (first on ties).
    let total_rounded: f64 = shares.iter().map(|(_, r, _)| r).sum();
    let residual = amount - total_rounded;
    if residual.abs() > f64::EPSILON * amount.abs() {
        let idx = shares
            .iter()
            .enumerate()
            .max_by(|(_, (_, _, a)), (_, (_, _, b))| a.partial_cmp(b).unwrap())
            .map(|(i, _)| i)
            .unwrap_or(0);
        shares[idx].1 += residual;
    }

    shares.into_iter().map(|(id, r, _)| (id, r)).collect()
}

/// CUSTOM: each venue with a positive ratio receives amount * ratio. Any
/// remainder above 1e-5 goes to the top-priority venue.
fn allocate_custom(
    amount: f64,
    active: &[ActiveVenue],
    config: &AllocationConfig,
) -> Vec<(String, f64)> {
    let mut allocations: Vec<(String, f64)> = Vec::new();
    let mut allocated = 0.0;

    for venue in active {
        let ratio = config.custom_ratios.get(&venue.id).copied().unwrap_or(0.0);
        if ratio > 0.0 {
            let share = amount * ratio;
            allocated += share;
            allocations.push((venue.id.clone(), share));
        }
    }

    let remainder = amount - allocated;
    if remainder > ALLOCATION_EPSILON {
        let top = &active[0].id;
        match allocations.iter_mut().find(|(id, _)| id == top) {
            Some(entry) => entry.1 += remainder,
            None => allocations.insert(0, (top.clone(), remainder)),
        }
        debug!(remainder, venue = %top, "custom allocation remainder assigned to top priority");
    }

    allocations
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn venues(ids: &[&str]) -> Vec<ActiveVenue> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| ActiveVenue {
                id: id.to_string(),
                priority: (i + 1) as i32,
            })
            .collect()
    }

    fn config(kind: AllocationStrategyKind) -> AllocationConfig {
        AllocationConfig {
            strategy: kind,
            ..AllocationConfig::default()
        }
    }

    fn sum(allocs: &[(String, f64)]) -> f64 {
        allocs.iter().map(|(_, a)| a).sum()
    }

    #[test]
    fn priority_takes_entire_amount() {
        let active = venues(&["binance", "bybit"]);
        let counter = AtomicUsize::new(0);
        let allocs = allocate(4.0, &active, &config(AllocationStrategyKind::Priority), &counter)
            .unwrap();
        assert_eq!(allocs, vec![("binance".to_string(), 4.0)]);
    }

    #[test]
    fn weighted_two_venues_splits_three_to_one() {
        let active = venues(&["binance", "bybit"]);
        let mut cfg = config(AllocationStrategyKind::Weighted);
        cfg.weights.insert("binance".into(), 3.0);
        cfg.weights.insert("bybit".into(), 1.0);
        let counter = AtomicUsize::new(0);

        let allocs = allocate(4.0, &active, &cfg, &counter).unwrap();
        assert_eq!(allocs.len(), 2);
        assert_eq!(allocs[0].0, "binance");
        assert!((allocs[0].1 - 3.0).abs() < 1e-9);
        assert_eq!(allocs[1].0, "bybit");
        assert!((allocs[1].1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn weighted_rounding_preserves_sum() {
        // One third shares do not terminate at 2 decimals; the residual must
        // fold back so the sum still equals the requested amount.
        let active = venues(&["a", "b", "c"]);
        let mut cfg = config(AllocationStrategyKind::Weighted);
        for id in ["a", "b", "c"] {
            cfg.weights.insert(id.into(), 1.0);
        }
        let counter = AtomicUsize::new(0);

        let allocs = allocate(1.0, &active, &cfg, &counter).unwrap();
        assert!((sum(&allocs) - 1.0).abs() <= ALLOCATION_EPSILON);
    }

    #[test]
    fn weighted_zero_weights_falls_back_to_priority() {
        let active = venues(&["binance", "bybit"]);
        let cfg = config(AllocationStrategyKind::Weighted);
        let counter = AtomicUsize::new(0);

        let allocs = allocate(2.0, &active, &cfg, &counter).unwrap();
        assert_eq!(allocs, vec![("binance".to_string(), 2.0)]);
    }

    #[test]
    fn round_robin_wraps_cyclically() {
        let active = venues(&["a", "b", "c"]);
        let cfg = config(AllocationStrategyKind::RoundRobin);
        let counter = AtomicUsize::new(0);

        let targets: Vec<String> = (0..4)
            .map(|_| allocate(1.0, &active, &cfg, &counter).unwrap()[0].0.clone())
            .collect();
        assert_eq!(targets, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn split_equal_divides_evenly() {
        let active = venues(&["a", "b", "c", "d"]);
        let cfg = config(AllocationStrategyKind::SplitEqual);
        let counter = AtomicUsize::new(0);

        let allocs = allocate(2.0, &active, &cfg, &counter).unwrap();
        assert_eq!(allocs.len(), 4);
        for (_, amount) in &allocs {
            assert!((amount - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn custom_remainder_goes_to_top_priority() {
        let active = venues(&["binance", "bybit"]);
        let mut cfg = config(AllocationStrategyKind::Custom);
        cfg.custom_ratios.insert("binance".into(), 0.5);
        cfg.custom_ratios.insert("bybit".into(), 0.3);
        let counter = AtomicUsize::new(0);

        let allocs = allocate(10.0, &active, &cfg, &counter).unwrap();
        // 5.0 + 3.0 allocated; remainder 2.0 folds into binance.
        let binance = allocs.iter().find(|(id, _)| id == "binance").unwrap();
        assert!((binance.1 - 7.0).abs() < 1e-9);
        assert!((sum(&allocs) - 10.0).abs() <= ALLOCATION_EPSILON * 10.0);
    }

    #[test]
    fn empty_active_set_is_an_error() {
        let counter = AtomicUsize::new(0);
        let err = allocate(1.0, &[], &AllocationConfig::default(), &counter).unwrap_err();
        assert!(matches!(err, EngineError::NoActiveVenue));
    }

    #[test]
    fn sum_invariant_across_strategies() {
        let active = venues(&["a", "b", "c"]);
        let counter = AtomicUsize::new(0);

        for kind in [
            AllocationStrategyKind::Priority,
            AllocationStrategyKind::RoundRobin,
            AllocationStrategyKind::SplitEqual,
        ] {
            for amount in [0.1, 1.0, 3.7, 1234.567] {
                let allocs = allocate(amount, &active, &config(kind), &counter).unwrap();
                assert!(
                    (sum(&allocs) - amount).abs() <= ALLOCATION_EPSILON * amount,
                    "strategy {kind} amount {amount}"
                );
            }
        }
    }

    #[test]
    fn validate_weighted_rejects_missing_weight() {
        let active = venues(&["binance", "bybit"]);
        let mut cfg = config(AllocationStrategyKind::Weighted);
        cfg.weights.insert("binance".into(), 1.0);

        let err = validate_allocation(&cfg, &active).unwrap_err();
        assert!(matches!(err, EngineError::InvalidAllocation(_)));
    }

    #[test]
    fn validate_custom_rejects_missing_ratio() {
        let active = venues(&["binance", "bybit"]);
        let mut cfg = config(AllocationStrategyKind::Custom);
        cfg.custom_ratios.insert("binance".into(), 1.0);

        let err = validate_allocation(&cfg, &active).unwrap_err();
        assert!(matches!(err, EngineError::InvalidAllocation(_)));
    }

    #[test]
    fn validate_passes_for_complete_configs() {
        let active = venues(&["binance", "bybit"]);

        let mut weighted = config(AllocationStrategyKind::Weighted);
        weighted.weights.insert("binance".into(), 3.0);
        weighted.weights.insert("bybit".into(), 1.0);
        assert!(validate_allocation(&weighted, &active).is_ok());

        let mut custom = config(AllocationStrategyKind::Custom);
        custom.custom_ratios.insert("binance".into(), 0.6);
        custom.custom_ratios.insert("bybit".into(), 0.4);
        assert!(validate_allocation(&custom, &active).is_ok());
    }
}
