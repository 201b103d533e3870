// =============================================================================
// Venue Gateway contract — the uniform interface one venue must implement
// =============================================================================
//
// New venues plug in by implementing this trait. Raw venue payloads never
// cross this boundary upward: order state returns as `VenueOrderUpdate`,
// OCO placements as the tagged `OcoOrderIds` sum.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::market_data::Candle;
use crate::types::{OrderRequest, OrderStatus, Side, Ticker};

// ---------------------------------------------------------------------------
// Boundary types
// ---------------------------------------------------------------------------

/// Identifiers returned by an OCO placement.
///
/// Venues with a single linked-order id return `Single`; array-style venues
/// and the sequential emulation path return both legs as `Pair`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OcoOrderIds {
    Single(String),
    Pair { limit: String, stop: String },
}

impl OcoOrderIds {
    /// The id callers track by default. For a `Pair` this is the LIMIT
    /// (take-profit) leg; callers that need the stop leg must take it from
    /// the pair explicitly.
    pub fn primary(&self) -> &str {
        match self {
            Self::Single(id) => id,
            Self::Pair { limit, .. } => limit,
        }
    }
}

/// Parameters for an OCO (one-cancels-the-other) placement.
#[derive(Debug, Clone)]
pub struct OcoRequest {
    pub symbol: String,
    pub side: Side,
    pub amount: f64,
    /// Stop-loss trigger price.
    pub stop_price: f64,
    /// Take-profit limit price.
    pub limit_price: f64,
    /// Optional limit price for the stop leg (stop-limit instead of stop).
    pub stop_limit_price: Option<f64>,
}

/// Normalised view of a venue-reported order, used by OMS reconciliation.
#[derive(Debug, Clone)]
pub struct VenueOrderUpdate {
    pub venue_order_id: String,
    pub status: OrderStatus,
    pub filled_amount: f64,
    pub avg_fill_price: f64,
    /// Raw venue payload for diagnostics.
    pub raw: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Gateway trait
// ---------------------------------------------------------------------------

/// Uniform request interface to one venue.
///
/// Implementations own retry-with-backoff internally; an error escaping any
/// method is final from the caller's perspective and must not be retried
/// above this layer.
#[async_trait]
pub trait VenueGateway: Send + Sync {
    /// Stable identifier of this venue registration (e.g. "binance").
    fn venue_id(&self) -> &str;

    /// Verify connectivity / credentials. Returns `true` when the venue is
    /// reachable and usable.
    async fn initialize(&self) -> Result<bool, EngineError>;

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, EngineError>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, EngineError>;

    /// Free balances per currency.
    async fn fetch_balance(&self) -> Result<HashMap<String, f64>, EngineError>;

    /// Submit an order. Returns the venue order id when the venue assigns
    /// one synchronously.
    async fn execute_order(&self, order: &OrderRequest) -> Result<Option<String>, EngineError>;

    /// Raw venue payload for one order, or `None` when unknown.
    async fn fetch_order(
        &self,
        venue_order_id: &str,
        symbol: &str,
    ) -> Result<Option<serde_json::Value>, EngineError>;

    /// Like [`fetch_order`](Self::fetch_order) but normalised for
    /// reconciliation.
    async fn fetch_order_and_convert(
        &self,
        venue_order_id: &str,
        symbol: &str,
    ) -> Result<Option<VenueOrderUpdate>, EngineError>;

    async fn cancel_order(&self, venue_order_id: &str, symbol: &str) -> Result<(), EngineError>;

    /// Place a linked take-profit / stop-loss pair, natively when the venue
    /// supports it, otherwise by sequential emulation.
    async fn create_oco_order(&self, request: &OcoRequest) -> Result<OcoOrderIds, EngineError>;

    /// Raw venue market metadata for one symbol.
    async fn get_market_info(&self, symbol: &str) -> Result<serde_json::Value, EngineError>;

    /// Probe venue capabilities by feature name (e.g. "oco").
    fn supports_feature(&self, name: &str) -> bool;

    fn supports_oco(&self) -> bool {
        self.supports_feature("oco")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_id_is_the_limit_leg() {
        let single = OcoOrderIds::Single("42".into());
        assert_eq!(single.primary(), "42");

        let pair = OcoOrderIds::Pair {
            limit: "tp-1".into(),
            stop: "sl-2".into(),
        };
        assert_eq!(pair.primary(), "tp-1");
    }
}
