// =============================================================================
// Operational Metrics — lock-free counters for the execution plane
// =============================================================================
//
// Per-venue order placement attempts/successes/failures, gateway retry
// totals, OCO-emulation fallbacks, symbol-info cache hit ratio, and
// reconciliation drift events. Counters are atomics that any task may bump
// without locking; the per-venue map itself is read-mostly.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Per-venue counters
// ---------------------------------------------------------------------------

#[derive(Default)]
struct VenueCounters {
    order_attempts: AtomicU64,
    order_successes: AtomicU64,
    order_failures: AtomicU64,
    retries: AtomicU64,
    oco_fallbacks: AtomicU64,
}

/// Serialisable snapshot of one venue's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueMetricsSnapshot {
    pub order_attempts: u64,
    pub order_successes: u64,
    pub order_failures: u64,
    pub retries: u64,
    pub oco_fallbacks: u64,
}

/// Serialisable snapshot of the whole registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub venues: HashMap<String, VenueMetricsSnapshot>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub reconcile_drift_events: u64,
}

impl MetricsSnapshot {
    /// Cache hit ratio in [0, 1]; 0 when nothing was requested yet.
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Shared metrics registry. Cheap to clone via `Arc`.
pub struct MetricsRegistry {
    venues: RwLock<HashMap<String, Arc<VenueCounters>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    reconcile_drift_events: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            venues: RwLock::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            reconcile_drift_events: AtomicU64::new(0),
        }
    }

    fn venue(&self, venue_id: &str) -> Arc<VenueCounters> {
        if let Some(c) = self.venues.read().get(venue_id) {
            return c.clone();
        }
        let mut map = self.venues.write();
        map.entry(venue_id.to_string())
            .or_insert_with(|| Arc::new(VenueCounters::default()))
            .clone()
    }

    pub fn record_order_attempt(&self, venue_id: &str) {
        self.venue(venue_id).order_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_order_success(&self, venue_id: &str) {
        self.venue(venue_id).order_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_order_failure(&self, venue_id: &str) {
        self.venue(venue_id).order_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self, venue_id: &str) {
        self.venue(venue_id).retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oco_fallback(&self, venue_id: &str) {
        self.venue(venue_id).oco_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconcile_drift(&self) {
        self.reconcile_drift_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Produce a serialisable snapshot of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let venues = self
            .venues
            .read()
            .iter()
            .map(|(id, c)| {
                (
                    id.clone(),
                    VenueMetricsSnapshot {
                        order_attempts: c.order_attempts.load(Ordering::Relaxed),
                        order_successes: c.order_successes.load(Ordering::Relaxed),
                        order_failures: c.order_failures.load(Ordering::Relaxed),
                        retries: c.retries.load(Ordering::Relaxed),
                        oco_fallbacks: c.oco_fallbacks.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            venues,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            reconcile_drift_events: self.reconcile_drift_events.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("MetricsRegistry")
            .field("venues", &snap.venues.len())
            .field("cache_hits", &snap.cache_hits)
            .field("cache_misses", &snap.cache_misses)
            .field("reconcile_drift_events", &snap.reconcile_drift_events)
            .finish()
    }
}
