// =============================================================================
// Unified Order Manager — multi-venue registry, allocation, and fan-out
// =============================================================================
//
// Venues register with a priority (lower wins, ties by insertion order).
// The active index is recomputed on registry mutation, not per order, since
// registry changes are rare relative to order flow. One `create_order`
// computes its full allocation before any per-venue submission begins, so
// the decision is observed atomically.
//
// Per-venue failures never abort the fan-out: successful venues appear in
// the result map, failed ones are logged and omitted. An empty map means
// total failure across all active venues.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::allocation::{allocate, validate_allocation, ActiveVenue, AllocationConfig};
use crate::errors::EngineError;
use crate::metrics::MetricsRegistry;
use crate::oms::{Oms, OrderFilter};
use crate::types::{now_ms, Order, OrderRequest, Position, Side, FLAT_EPSILON};
use crate::venue::gateway::VenueGateway;

/// Priority used when the caller does not specify one.
pub const DEFAULT_VENUE_PRIORITY: i32 = 100;

/// One registered venue: gateway, its OMS, and routing metadata.
pub struct VenueRegistration {
    pub id: String,
    pub gateway: Arc<dyn VenueGateway>,
    pub oms: Arc<Oms>,
    pub active: bool,
    pub priority: i32,
    insertion: usize,
}

/// Routes logical orders across registered venues under the configured
/// allocation policy and aggregates resulting positions.
pub struct UnifiedOrderManager {
    venues: RwLock<Vec<VenueRegistration>>,
    /// Active venues sorted by (priority, insertion order); rebuilt on every
    /// registry mutation.
    active_index: RwLock<Vec<ActiveVenue>>,
    allocation: RwLock<AllocationConfig>,
    round_robin: AtomicUsize,
    insertion_seq: AtomicUsize,
    metrics: Arc<MetricsRegistry>,
}

impl UnifiedOrderManager {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            venues: RwLock::new(Vec::new()),
            active_index: RwLock::new(Vec::new()),
            allocation: RwLock::new(AllocationConfig::default()),
            round_robin: AtomicUsize::new(0),
            insertion_seq: AtomicUsize::new(0),
            metrics,
        }
    }

    // -------------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------------

    /// Register a venue with [`DEFAULT_VENUE_PRIORITY`].
    pub fn add_venue(&self, id: &str, gateway: Arc<dyn VenueGateway>) -> bool {
        self.add_venue_with_priority(id, gateway, DEFAULT_VENUE_PRIORITY)
    }

    /// Register a venue. Returns `false` when the id is already taken.
    pub fn add_venue_with_priority(
        &self,
        id: &str,
        gateway: Arc<dyn VenueGateway>,
        priority: i32,
    ) -> bool {
        let mut venues = self.venues.write();
        if venues.iter().any(|v| v.id == id) {
            warn!(venue = id, "venue id already registered");
            return false;
        }

        let oms = Arc::new(Oms::new(gateway.clone(), self.metrics.clone()));
        venues.push(VenueRegistration {
            id: id.to_string(),
            gateway,
            oms,
            active: true,
            priority,
            insertion: self
                .insertion_seq
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        });
        drop(venues);

        self.rebuild_active_index();
        info!(venue = id, priority, "venue registered");
        true
    }

    /// Unregister a venue. Returns `false` when unknown.
    pub fn remove_venue(&self, id: &str) -> bool {
        let mut venues = self.venues.write();
        let before = venues.len();
        venues.retain(|v| v.id != id);
        let removed = venues.len() != before;
        drop(venues);

        if removed {
            self.rebuild_active_index();
            info!(venue = id, "venue removed");
        }
        removed
    }

    /// Activate or deactivate a venue for routing. Returns `false` when
    /// unknown.
    pub fn set_venue_active(&self, id: &str, active: bool) -> bool {
        let mut venues = self.venues.write();
        let Some(venue) = venues.iter_mut().find(|v| v.id == id) else {
            return false;
        };
        venue.active = active;
        drop(venues);

        self.rebuild_active_index();
        info!(venue = id, active, "venue activation changed");
        true
    }

    /// OMS handle for one venue.
    pub fn oms(&self, id: &str) -> Option<Arc<Oms>> {
        self.venues
            .read()
            .iter()
            .find(|v| v.id == id)
            .map(|v| v.oms.clone())
    }

    fn rebuild_active_index(&self) {
        let venues = self.venues.read();
        let mut active: Vec<(&VenueRegistration, usize)> = venues
            .iter()
            .filter(|v| v.active)
            .map(|v| (v, v.insertion))
            .collect();
        active.sort_by_key(|(v, insertion)| (v.priority, *insertion));

        *self.active_index.write() = active
            .into_iter()
            .map(|(v, _)| ActiveVenue {
                id: v.id.clone(),
                priority: v.priority,
            })
            .collect();
    }

    fn active_snapshot(&self) -> Vec<ActiveVenue> {
        self.active_index.read().clone()
    }

    // -------------------------------------------------------------------------
    // Allocation policy
    // -------------------------------------------------------------------------

    /// Install a new allocation policy after validating it against the
    /// currently active venues.
    pub fn set_allocation_strategy(&self, config: AllocationConfig) -> Result<(), EngineError> {
        let active = self.active_snapshot();
        validate_allocation(&config, &active)?;
        info!(strategy = %config.strategy, "allocation strategy updated");
        *self.allocation.write() = config;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Order flow
    // -------------------------------------------------------------------------

    /// Allocate `request.amount` across active venues and fan the per-venue
    /// orders out in parallel.
    ///
    /// Returns venue id -> local order id for every venue whose OMS accepted
    /// the intent. An empty map means every active venue failed.
    pub async fn create_order(
        &self,
        request: OrderRequest,
    ) -> Result<HashMap<String, String>, EngineError> {
        request.validate()?;

        let active = self.active_snapshot();
        let config = self.allocation.read().clone();
        let allocations = allocate(request.amount, &active, &config, &self.round_robin)?;

        let submissions = allocations
            .into_iter()
            .filter(|(_, amount)| *amount > FLAT_EPSILON)
            .filter_map(|(venue_id, amount)| {
                let oms = self.oms(&venue_id)?;
                let mut venue_request = request.clone();
                venue_request.amount = amount;
                Some(async move {
                    let outcome = oms.create_order(venue_request).await;
                    (venue_id, outcome)
                })
            });

        let mut result = HashMap::new();
        for (venue_id, outcome) in join_all(submissions).await {
            match outcome {
                Ok(order_id) => {
                    result.insert(venue_id, order_id);
                }
                Err(e) => {
                    warn!(venue = %venue_id, error = %e, "per-venue order submission failed");
                }
            }
        }

        if result.is_empty() {
            warn!(symbol = %request.symbol, "order failed on every active venue");
        } else {
            debug!(
                symbol = %request.symbol,
                venues = result.len(),
                "order fanned out"
            );
        }
        Ok(result)
    }

    /// Cancel one order on one venue.
    pub async fn cancel_order(&self, venue_id: &str, order_id: &str) -> bool {
        match self.oms(venue_id) {
            Some(oms) => oms.cancel_order(order_id).await,
            None => {
                warn!(venue = venue_id, "cancel for unknown venue");
                false
            }
        }
    }

    /// Cancel active orders, optionally restricted to one venue and/or one
    /// symbol. Returns the number of successful cancellations.
    pub async fn cancel_all_orders(&self, venue_id: Option<&str>, symbol: Option<&str>) -> usize {
        let targets: Vec<Arc<Oms>> = {
            let venues = self.venues.read();
            venues
                .iter()
                .filter(|v| venue_id.map_or(true, |id| v.id == id))
                .map(|v| v.oms.clone())
                .collect()
        };

        let counts = join_all(targets.iter().map(|oms| oms.cancel_all_orders(symbol))).await;
        counts.into_iter().sum()
    }

    /// Orders across venues, keyed by venue id.
    pub fn get_all_orders(&self, filter: &OrderFilter) -> HashMap<String, Vec<Order>> {
        self.venues
            .read()
            .iter()
            .map(|v| (v.id.clone(), v.oms.get_orders(filter)))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Per-venue position lists, keyed by venue id.
    pub fn get_all_positions(&self, symbol: Option<&str>) -> HashMap<String, Vec<Position>> {
        self.venues
            .read()
            .iter()
            .map(|v| (v.id.clone(), v.oms.get_positions(symbol)))
            .collect()
    }

    /// Consolidated position for one symbol across venues.
    pub fn get_total_position(&self, symbol: &str) -> Option<Position> {
        let per_venue: Vec<Position> = self
            .venues
            .read()
            .iter()
            .flat_map(|v| v.oms.get_positions_by_symbol(symbol))
            .collect();
        consolidate(symbol, &per_venue)
    }

    /// Consolidated positions for every symbol with non-flat net exposure.
    pub fn get_consolidated_positions(&self) -> Vec<Position> {
        let mut by_symbol: HashMap<String, Vec<Position>> = HashMap::new();
        for positions in self.get_all_positions(None).into_values() {
            for pos in positions {
                by_symbol.entry(pos.symbol.clone()).or_default().push(pos);
            }
        }

        by_symbol
            .into_iter()
            .filter_map(|(symbol, positions)| consolidate(&symbol, &positions))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Sync every active venue's OMS in parallel; a failing venue never
    /// blocks the others.
    pub async fn sync_all_orders(&self) {
        let targets: Vec<Arc<Oms>> = {
            let venues = self.venues.read();
            venues
                .iter()
                .filter(|v| v.active)
                .map(|v| v.oms.clone())
                .collect()
        };
        join_all(targets.iter().map(|oms| oms.sync_order_status())).await;
        debug!(venues = targets.len(), "all venue OMS synced");
    }
}

impl std::fmt::Debug for UnifiedOrderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let venues = self.venues.read();
        f.debug_struct("UnifiedOrderManager")
            .field("venues", &venues.len())
            .field("active", &venues.iter().filter(|v| v.active).count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Consolidation math
// ---------------------------------------------------------------------------

/// Net several per-venue positions for one symbol into a single view.
///
/// entry = Σ signed cost / |Σ signed amount|; near-zero nets are dropped.
fn consolidate(symbol: &str, positions: &[Position]) -> Option<Position> {
    if positions.is_empty() {
        return None;
    }

    let mut signed_amount = 0.0;
    let mut signed_cost = 0.0;
    let mut unrealized = 0.0;
    let mut latest_price = 0.0;
    let mut latest_ts = i64::MIN;

    for pos in positions {
        signed_amount += pos.side.sign() * pos.amount;
        signed_cost += pos.side.sign() * pos.cost;
        unrealized += pos.unrealized_pnl;
        if pos.timestamp >= latest_ts {
            latest_ts = pos.timestamp;
            latest_price = pos.current_price;
        }
    }

    if signed_amount.abs() < FLAT_EPSILON {
        return None;
    }

    let side = if signed_amount > 0.0 { Side::Buy } else { Side::Sell };
    let amount = signed_amount.abs();
    let entry_price = (signed_cost / signed_amount).abs();

    Some(Position {
        symbol: symbol.to_string(),
        side,
        amount,
        entry_price,
        current_price: latest_price,
        cost: amount * entry_price,
        unrealized_pnl: unrealized,
        timestamp: now_ms(),
    })
}
