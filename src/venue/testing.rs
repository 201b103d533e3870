// =============================================================================
// Test support — scriptable in-memory venue gateway
// =============================================================================
//
// Compiled only for tests. Records every call so cache, OMS, and router
// tests can assert on outbound traffic without any network.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::EngineError;
use crate::market_data::Candle;
use crate::types::{now_ms, OrderRequest, Ticker};
use crate::venue::gateway::{OcoOrderIds, OcoRequest, VenueGateway, VenueOrderUpdate};

/// In-memory venue with scriptable responses and full call recording.
pub struct MockVenue {
    id: String,
    /// Raw market-info payloads served by `get_market_info`.
    pub market_info: Mutex<HashMap<String, serde_json::Value>>,
    /// Last prices served by `fetch_ticker`.
    pub tickers: Mutex<HashMap<String, f64>>,
    /// Free balances served by `fetch_balance`.
    pub balances: Mutex<HashMap<String, f64>>,
    /// Venue-side order state served by `fetch_order_and_convert`.
    pub order_updates: Mutex<HashMap<String, VenueOrderUpdate>>,
    /// Orders accepted by `execute_order`, in arrival order.
    pub executed: Mutex<Vec<OrderRequest>>,
    /// Venue order ids passed to `cancel_order`.
    pub cancelled: Mutex<Vec<String>>,
    /// When set, `execute_order` rejects everything.
    pub fail_orders: AtomicBool,
    /// When set, `cancel_order` rejects everything.
    pub fail_cancels: AtomicBool,
    /// When set, `get_market_info` rejects everything.
    pub fail_market_info: AtomicBool,
    /// Artificial latency for `get_market_info` (drives single-flight tests).
    pub market_info_delay_ms: AtomicU64,
    /// Number of `get_market_info` calls that reached the venue.
    pub info_fetches: AtomicU64,
    next_id: AtomicU64,
}

impl MockVenue {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            market_info: Mutex::new(HashMap::new()),
            tickers: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            order_updates: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            fail_orders: AtomicBool::new(false),
            fail_cancels: AtomicBool::new(false),
            fail_market_info: AtomicBool::new(false),
            market_info_delay_ms: AtomicU64::new(0),
            info_fetches: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_ticker(&self, symbol: &str, last: f64) {
        self.tickers.lock().insert(symbol.to_string(), last);
    }

    pub fn set_market_info(&self, symbol: &str, raw: serde_json::Value) {
        self.market_info.lock().insert(symbol.to_string(), raw);
    }

    pub fn set_order_update(&self, update: VenueOrderUpdate) {
        self.order_updates
            .lock()
            .insert(update.venue_order_id.clone(), update);
    }

    pub fn executed_count(&self) -> usize {
        self.executed.lock().len()
    }
}

#[async_trait]
impl VenueGateway for MockVenue {
    fn venue_id(&self) -> &str {
        &self.id
    }

    async fn initialize(&self) -> Result<bool, EngineError> {
        Ok(true)
    }

    async fn fetch_candles(
        &self,
        _symbol: &str,
        _timeframe: &str,
        _limit: u32,
    ) -> Result<Vec<Candle>, EngineError> {
        Ok(Vec::new())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, EngineError> {
        let last = self.tickers.lock().get(symbol).copied().ok_or_else(|| {
            EngineError::VenueRejected(format!("no ticker scripted for {symbol}"))
        })?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
            bid: None,
            ask: None,
            timestamp: now_ms(),
        })
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, f64>, EngineError> {
        Ok(self.balances.lock().clone())
    }

    async fn execute_order(&self, order: &OrderRequest) -> Result<Option<String>, EngineError> {
        if self.fail_orders.load(Ordering::Relaxed) {
            return Err(EngineError::VenueRejected("scripted order failure".into()));
        }
        self.executed.lock().push(order.clone());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Some(format!("{}-{}", self.id, id)))
    }

    async fn fetch_order(
        &self,
        venue_order_id: &str,
        _symbol: &str,
    ) -> Result<Option<serde_json::Value>, EngineError> {
        Ok(self
            .order_updates
            .lock()
            .get(venue_order_id)
            .map(|u| u.raw.clone()))
    }

    async fn fetch_order_and_convert(
        &self,
        venue_order_id: &str,
        _symbol: &str,
    ) -> Result<Option<VenueOrderUpdate>, EngineError> {
        Ok(self.order_updates.lock().get(venue_order_id).cloned())
    }

    async fn cancel_order(&self, venue_order_id: &str, _symbol: &str) -> Result<(), EngineError> {
        if self.fail_cancels.load(Ordering::Relaxed) {
            return Err(EngineError::VenueRejected("scripted cancel failure".into()));
        }
        self.cancelled.lock().push(venue_order_id.to_string());
        Ok(())
    }

    async fn create_oco_order(&self, _request: &OcoRequest) -> Result<OcoOrderIds, EngineError> {
        let limit = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stop = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(OcoOrderIds::Pair {
            limit: format!("{}-{}", self.id, limit),
            stop: format!("{}-{}", self.id, stop),
        })
    }

    async fn get_market_info(&self, symbol: &str) -> Result<serde_json::Value, EngineError> {
        let delay = self.market_info_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        self.info_fetches.fetch_add(1, Ordering::Relaxed);
        if self.fail_market_info.load(Ordering::Relaxed) {
            return Err(EngineError::VenueRejected("scripted info failure".into()));
        }
        self.market_info
            .lock()
            .get(symbol)
            .cloned()
            .ok_or_else(|| EngineError::VenueRejected(format!("no market info for {symbol}")))
    }

    fn supports_feature(&self, _name: &str) -> bool {
        false
    }
}
