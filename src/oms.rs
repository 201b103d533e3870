// =============================================================================
// OMS — per-venue order management and derived positions
// =============================================================================
//
// Owns the ordered collection of local orders for one venue and the
// positions derived from their fills. All writes go through this object
// (single logical writer per venue), readers get snapshot copies.
//
// Lifecycle: orders are created Pending, transition along the status DAG,
// and are only ever logically destroyed by reaching a terminal status. A
// terminal status never changes again; a venue report that disagrees with a
// terminal local status is recorded as reconciliation drift, never applied.
//
// Fill accounting: same-side fills re-average the entry price by cost;
// cross-side fills net the position down and, when they cross zero, flip
// the side with the entry price reset to the crossing fill's price.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::metrics::MetricsRegistry;
use crate::types::{
    now_ms, Order, OrderRequest, OrderStatus, Position, Side, FLAT_EPSILON,
};
use crate::venue::gateway::{VenueGateway, VenueOrderUpdate};

// ---------------------------------------------------------------------------
// Filters and snapshots
// ---------------------------------------------------------------------------

/// Query filter for [`Oms::get_orders`].
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub symbol: Option<String>,
    pub status: Option<OrderStatus>,
    /// Only orders that have not reached a terminal status.
    pub active_only: bool,
}

/// Crash-recovery document: open orders, positions, and the last sync time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmsSnapshot {
    pub orders: Vec<Order>,
    pub positions: Vec<Position>,
    pub last_sync_ts: i64,
}

// ---------------------------------------------------------------------------
// OMS
// ---------------------------------------------------------------------------

/// Order management system for a single venue.
pub struct Oms {
    venue_id: String,
    venue: RwLock<Arc<dyn VenueGateway>>,
    orders: RwLock<Vec<Order>>,
    positions: RwLock<HashMap<String, Position>>,
    last_sync_ts: AtomicI64,
    metrics: Arc<MetricsRegistry>,
}

impl Oms {
    pub fn new(venue: Arc<dyn VenueGateway>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            venue_id: venue.venue_id().to_string(),
            venue: RwLock::new(venue),
            orders: RwLock::new(Vec::new()),
            positions: RwLock::new(HashMap::new()),
            last_sync_ts: AtomicI64::new(0),
            metrics,
        }
    }

    pub fn venue_id(&self) -> &str {
        &self.venue_id
    }

    /// Swap the venue gateway (e.g. after credential rotation).
    pub fn set_venue_gateway(&self, venue: Arc<dyn VenueGateway>) {
        *self.venue.write() = venue;
    }

    fn venue(&self) -> Arc<dyn VenueGateway> {
        self.venue.read().clone()
    }

    // -------------------------------------------------------------------------
    // Order creation
    // -------------------------------------------------------------------------

    /// Persist the order intent locally, then submit it to the venue.
    ///
    /// Venue rejection becomes order status Rejected; the local id is
    /// returned either way so the caller can reconcile later. Only a local
    /// constraint violation fails the call itself.
    pub async fn create_order(&self, request: OrderRequest) -> Result<String, EngineError> {
        request.validate()?;

        let id = Uuid::new_v4().to_string();
        let order = Order::pending(id.clone(), request.clone());
        self.orders.write().push(order);

        debug!(
            venue = %self.venue_id,
            order_id = %id,
            symbol = %request.symbol,
            side = %request.side,
            amount = request.amount,
            "order persisted as pending"
        );

        match self.venue().execute_order(&request).await {
            Ok(venue_order_id) => {
                let mut orders = self.orders.write();
                if let Some(order) = orders.iter_mut().find(|o| o.id == id) {
                    order.venue_order_id = venue_order_id.clone();
                    order.status = OrderStatus::Placed;
                    order.updated_at = now_ms();
                }
                if venue_order_id.is_none() {
                    warn!(
                        venue = %self.venue_id,
                        order_id = %id,
                        "venue accepted order without returning an id"
                    );
                }
                info!(
                    venue = %self.venue_id,
                    order_id = %id,
                    venue_order_id = ?venue_order_id,
                    "order placed"
                );
            }
            Err(e) => {
                let mut orders = self.orders.write();
                if let Some(order) = orders.iter_mut().find(|o| o.id == id) {
                    order.status = OrderStatus::Rejected;
                    order.updated_at = now_ms();
                }
                warn!(
                    venue = %self.venue_id,
                    order_id = %id,
                    error = %e,
                    "order rejected by venue"
                );
            }
        }

        Ok(id)
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    /// Cancel one order by local id. Returns `true` when the order reached
    /// Canceled as a result of this call.
    pub async fn cancel_order(&self, order_id: &str) -> bool {
        let (venue_order_id, symbol, status) = {
            let orders = self.orders.read();
            match orders.iter().find(|o| o.id == order_id) {
                Some(o) => (
                    o.venue_order_id.clone(),
                    o.request.symbol.clone(),
                    o.status,
                ),
                None => {
                    warn!(venue = %self.venue_id, order_id, "cancel for unknown order");
                    return false;
                }
            }
        };

        if status.is_terminal() {
            return false;
        }

        if let Some(ref vid) = venue_order_id {
            if let Err(e) = self.venue().cancel_order(vid, &symbol).await {
                warn!(
                    venue = %self.venue_id,
                    order_id,
                    venue_order_id = %vid,
                    error = %e,
                    "venue cancel failed"
                );
                return false;
            }
        }

        let mut orders = self.orders.write();
        if let Some(order) = orders.iter_mut().find(|o| o.id == order_id) {
            if order.status.can_transition_to(OrderStatus::Canceled) {
                order.status = OrderStatus::Canceled;
                order.updated_at = now_ms();
                info!(venue = %self.venue_id, order_id, "order cancelled");
                return true;
            }
        }
        false
    }

    /// Cancel every active order, optionally restricted to one symbol.
    /// Returns the number of successful cancellations.
    pub async fn cancel_all_orders(&self, symbol: Option<&str>) -> usize {
        let targets: Vec<String> = {
            let orders = self.orders.read();
            orders
                .iter()
                .filter(|o| !o.status.is_terminal())
                .filter(|o| symbol.map_or(true, |s| o.request.symbol == s))
                .map(|o| o.id.clone())
                .collect()
        };

        let mut cancelled = 0;
        for id in targets {
            if self.cancel_order(&id).await {
                cancelled += 1;
            }
        }
        info!(venue = %self.venue_id, cancelled, symbol = ?symbol, "bulk cancel finished");
        cancelled
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Snapshot of tracked orders matching `filter`, in creation order.
    pub fn get_orders(&self, filter: &OrderFilter) -> Vec<Order> {
        self.orders
            .read()
            .iter()
            .filter(|o| filter.symbol.as_deref().map_or(true, |s| o.request.symbol == s))
            .filter(|o| filter.status.map_or(true, |s| o.status == s))
            .filter(|o| !filter.active_only || !o.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Snapshot of derived positions, optionally for one symbol.
    pub fn get_positions(&self, symbol: Option<&str>) -> Vec<Position> {
        let positions = self.positions.read();
        match symbol {
            Some(s) => positions.get(s).cloned().into_iter().collect(),
            None => positions.values().cloned().collect(),
        }
    }

    /// Positions for one symbol (at most one entry by construction).
    pub fn get_positions_by_symbol(&self, symbol: &str) -> Vec<Position> {
        self.get_positions(Some(symbol))
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Reconcile every non-terminal order that has a venue id against
    /// venue-reported state, applying status transitions and fill deltas.
    pub async fn sync_order_status(&self) {
        let pending: Vec<(String, String, String)> = {
            let orders = self.orders.read();
            orders
                .iter()
                .filter(|o| !o.status.is_terminal())
                .filter_map(|o| {
                    o.venue_order_id
                        .as_ref()
                        .map(|vid| (o.id.clone(), vid.clone(), o.request.symbol.clone()))
                })
                .collect()
        };

        for (order_id, venue_order_id, symbol) in pending {
            match self
                .venue()
                .fetch_order_and_convert(&venue_order_id, &symbol)
                .await
            {
                Ok(Some(update)) => self.apply_update(&order_id, &update),
                Ok(None) => {
                    warn!(
                        venue = %self.venue_id,
                        order_id = %order_id,
                        venue_order_id = %venue_order_id,
                        "venue no longer knows this order — possible drift"
                    );
                    self.metrics.record_reconcile_drift();
                }
                Err(e) => {
                    warn!(
                        venue = %self.venue_id,
                        order_id = %order_id,
                        error = %e,
                        "order status fetch failed — will retry next sync"
                    );
                }
            }
        }

        self.last_sync_ts.store(now_ms(), Ordering::Relaxed);
    }

    /// Apply one venue-reported update to the local order and position.
    fn apply_update(&self, order_id: &str, update: &VenueOrderUpdate) {
        let mut orders = self.orders.write();
        let Some(order) = orders.iter_mut().find(|o| o.id == order_id) else {
            return;
        };

        if order.status.is_terminal() {
            if order.status != update.status {
                warn!(
                    venue = %self.venue_id,
                    order_id,
                    local = %order.status,
                    venue_status = %update.status,
                    "venue disagrees with terminal local status — drift recorded"
                );
                self.metrics.record_reconcile_drift();
            }
            return;
        }

        // Fill delta before the status transition so a jump straight to
        // Filled still books the fill.
        let fill_delta = update.filled_amount - order.filled_amount;
        if fill_delta < -FLAT_EPSILON {
            warn!(
                venue = %self.venue_id,
                order_id,
                local_filled = order.filled_amount,
                venue_filled = update.filled_amount,
                "venue reports shrinking fill — drift recorded"
            );
            self.metrics.record_reconcile_drift();
        } else if fill_delta > FLAT_EPSILON {
            // Price of the newly filled portion, cost-weighted out of the
            // averages; falls back to the reported average.
            let delta_price = if order.filled_amount > 0.0 && order.avg_fill_price > 0.0 {
                let prior_cost = order.avg_fill_price * order.filled_amount;
                let new_cost = update.avg_fill_price * update.filled_amount;
                let p = (new_cost - prior_cost) / fill_delta;
                if p > 0.0 { p } else { update.avg_fill_price }
            } else {
                update.avg_fill_price
            };

            order.filled_amount = update.filled_amount;
            order.avg_fill_price = update.avg_fill_price;

            let symbol = order.request.symbol.clone();
            let side = order.request.side;
            drop(orders);
            self.apply_fill(&symbol, side, fill_delta, delta_price);
            orders = self.orders.write();
        }

        let Some(order) = orders.iter_mut().find(|o| o.id == order_id) else {
            return;
        };

        // Prefer the venue's terminal/partial signal; a positive partial
        // fill with a non-terminal venue status reads as PartiallyFilled.
        let target = if !update.status.is_terminal()
            && order.filled_amount > FLAT_EPSILON
            && order.filled_amount + FLAT_EPSILON < order.request.amount
        {
            OrderStatus::PartiallyFilled
        } else {
            update.status
        };

        if target != order.status {
            if order.status.can_transition_to(target) {
                debug!(
                    venue = %self.venue_id,
                    order_id,
                    from = %order.status,
                    to = %target,
                    "order status transition"
                );
                order.status = target;
                order.updated_at = now_ms();
            } else {
                debug!(
                    venue = %self.venue_id,
                    order_id,
                    local = %order.status,
                    venue_status = %target,
                    "ignoring stale venue status"
                );
            }
        }
    }

    /// Merge a signed fill into the symbol's position.
    fn apply_fill(&self, symbol: &str, side: Side, fill_amount: f64, fill_price: f64) {
        let mut positions = self.positions.write();

        let updated = match positions.remove(symbol) {
            None => Some(Position {
                symbol: symbol.to_string(),
                side,
                amount: fill_amount,
                entry_price: fill_price,
                current_price: fill_price,
                cost: fill_amount * fill_price,
                unrealized_pnl: 0.0,
                timestamp: now_ms(),
            }),
            Some(mut pos) if pos.side == side => {
                // Same side: cost-weighted re-average.
                let new_amount = pos.amount + fill_amount;
                let new_cost = pos.cost + fill_amount * fill_price;
                pos.amount = new_amount;
                pos.cost = new_cost;
                pos.entry_price = if new_amount > 0.0 { new_cost / new_amount } else { 0.0 };
                pos.timestamp = now_ms();
                Some(pos)
            }
            Some(mut pos) => {
                // Cross side: net down; crossing zero flips the side with
                // the entry reset to the crossing fill's price.
                if fill_amount < pos.amount - FLAT_EPSILON {
                    pos.amount -= fill_amount;
                    pos.cost = pos.amount * pos.entry_price;
                    pos.timestamp = now_ms();
                    Some(pos)
                } else if fill_amount > pos.amount + FLAT_EPSILON {
                    let flipped = fill_amount - pos.amount;
                    Some(Position {
                        symbol: symbol.to_string(),
                        side,
                        amount: flipped,
                        entry_price: fill_price,
                        current_price: fill_price,
                        cost: flipped * fill_price,
                        unrealized_pnl: 0.0,
                        timestamp: now_ms(),
                    })
                } else {
                    None
                }
            }
        };

        match updated {
            Some(pos) if !pos.is_flat() => {
                debug!(
                    venue = %self.venue_id,
                    symbol,
                    side = %pos.side,
                    amount = pos.amount,
                    entry_price = pos.entry_price,
                    "position updated"
                );
                positions.insert(symbol.to_string(), pos);
            }
            _ => {
                debug!(venue = %self.venue_id, symbol, "position flat — removed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot persistence
    // -------------------------------------------------------------------------

    /// In-memory snapshot of open state for crash recovery.
    pub fn snapshot(&self) -> OmsSnapshot {
        OmsSnapshot {
            orders: self.orders.read().clone(),
            positions: self.positions.read().values().cloned().collect(),
            last_sync_ts: self.last_sync_ts.load(Ordering::Relaxed),
        }
    }

    /// Replace local state from a snapshot.
    pub fn restore(&self, snapshot: OmsSnapshot) {
        let mut positions = HashMap::new();
        for pos in snapshot.positions {
            positions.insert(pos.symbol.clone(), pos);
        }
        *self.orders.write() = snapshot.orders;
        *self.positions.write() = positions;
        self.last_sync_ts
            .store(snapshot.last_sync_ts, Ordering::Relaxed);
        info!(venue = %self.venue_id, "OMS state restored from snapshot");
    }

    /// Persist the snapshot as JSON with an atomic tmp + rename write.
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(&self.snapshot())
            .context("failed to serialise OMS snapshot")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;

        debug!(venue = %self.venue_id, path = %path.display(), "OMS snapshot saved");
        Ok(())
    }

    /// Load a snapshot document from disk.
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<OmsSnapshot> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read OMS snapshot from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse OMS snapshot from {}", path.display()))
    }
}

impl std::fmt::Debug for Oms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oms")
            .field("venue_id", &self.venue_id)
            .field("orders", &self.orders.read().len())
            .field("positions", &self.positions.read().len())
            .finish()
    }
}
