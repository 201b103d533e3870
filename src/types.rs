// =============================================================================
// Shared types used across the Meridian execution plane
// =============================================================================
//
// Conventions enforced here:
//   - Position amounts are unsigned; direction lives in the explicit `side`.
//   - All timestamps are epoch milliseconds (i64), matching venue payloads.
//   - MARKET-family order types never carry a price; LIMIT-family always do;
//     STOP-family always carry a stop price. `OrderRequest::validate`
//     rejects violations before anything reaches a venue.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Amounts below this are treated as a flat position.
pub const FLAT_EPSILON: f64 = 1e-6;

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as i64
}

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Order / position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1.0 for Buy, -1.0 for Sell.
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Order type
// ---------------------------------------------------------------------------

/// Internal order-type vocabulary. The venue gateway maps these to and from
/// venue-specific strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    StopMarket,
    TakeProfit,
    TakeProfitMarket,
}

impl OrderType {
    /// MARKET-family types execute at venue price and must never carry a
    /// price field on the outbound request.
    pub fn is_market_family(self) -> bool {
        matches!(self, Self::Market | Self::StopMarket | Self::TakeProfitMarket)
    }

    /// Types that require an explicit limit price.
    pub fn requires_price(self) -> bool {
        matches!(self, Self::Limit | Self::StopLimit | Self::TakeProfit)
    }

    /// Types that require a trigger price.
    pub fn requires_stop_price(self) -> bool {
        matches!(self, Self::Stop | Self::StopLimit | Self::StopMarket)
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::Stop => "STOP",
            Self::StopLimit => "STOP_LIMIT",
            Self::StopMarket => "STOP_MARKET",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Order status
// ---------------------------------------------------------------------------

/// Local order lifecycle. Transitions form a DAG:
///   Pending -> {Placed, Rejected}
///   Placed  -> {Open, PartiallyFilled, Filled, Canceled, Rejected}
///   Open    -> {PartiallyFilled, Filled, Canceled}
///   PartiallyFilled -> {Filled, Canceled}
/// Filled / Canceled / Rejected are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Placed,
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected)
    }

    /// Whether a legal transition exists from `self` to `next`.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match self {
            Pending => matches!(next, Placed | Rejected),
            Placed => matches!(next, Open | PartiallyFilled | Filled | Canceled | Rejected),
            Open => matches!(next, PartiallyFilled | Filled | Canceled),
            PartiallyFilled => matches!(next, Filled | Canceled),
            Filled | Canceled | Rejected => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Placed => "PLACED",
            Self::Open => "OPEN",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Order request
// ---------------------------------------------------------------------------

/// A logical order as produced by a strategy, before venue allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    /// Venue-specific pass-through options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

impl OrderRequest {
    /// Shorthand for a market order.
    pub fn market(symbol: impl Into<String>, side: Side, amount: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            amount,
            price: None,
            stop_price: None,
            options: None,
        }
    }

    /// Shorthand for a limit order.
    pub fn limit(symbol: impl Into<String>, side: Side, amount: f64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            amount,
            price: Some(price),
            stop_price: None,
            options: None,
        }
    }

    /// Check the local invariants before the request is sent anywhere.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.symbol.is_empty() {
            return Err(EngineError::InvalidOrder("empty symbol".into()));
        }
        if !(self.amount > 0.0) {
            return Err(EngineError::InvalidOrder(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        if self.order_type.is_market_family() && self.price.is_some() {
            return Err(EngineError::InvalidOrder(format!(
                "{} order must not carry a price",
                self.order_type
            )));
        }
        if self.order_type.requires_price() && self.price.is_none() {
            return Err(EngineError::InvalidOrder(format!(
                "{} order requires a price",
                self.order_type
            )));
        }
        if self.order_type.requires_stop_price() && self.stop_price.is_none() {
            return Err(EngineError::InvalidOrder(format!(
                "{} order requires a stop price",
                self.order_type
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tracked order
// ---------------------------------------------------------------------------

/// An order tracked by a per-venue OMS. `id` is locally unique and is the
/// reconciliation key; `venue_order_id` arrives once the venue accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub request: OrderRequest,
    #[serde(default)]
    pub venue_order_id: Option<String>,
    pub status: OrderStatus,
    #[serde(default)]
    pub filled_amount: f64,
    #[serde(default)]
    pub avg_fill_price: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Order {
    /// Create a fresh Pending order from a request.
    pub fn pending(id: String, request: OrderRequest) -> Self {
        let now = now_ms();
        Self {
            id,
            request,
            venue_order_id: None,
            status: OrderStatus::Pending,
            filled_amount: 0.0,
            avg_fill_price: 0.0,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// A derived position: unsigned amount plus explicit side.
/// Within one OMS there is at most one open position per symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub amount: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub current_price: f64,
    /// amount * entry_price.
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    pub timestamp: i64,
}

impl Position {
    /// Whether the position is effectively flat.
    pub fn is_flat(&self) -> bool {
        self.amount.abs() < FLAT_EPSILON
    }

    /// Refresh mark price and unrealised PnL.
    pub fn mark(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = self.side.sign() * (price - self.entry_price) * self.amount;
    }

    /// Mark-to-market value at the current price.
    pub fn market_value(&self) -> f64 {
        self.amount * self.current_price
    }
}

// ---------------------------------------------------------------------------
// Ticker
// ---------------------------------------------------------------------------

/// Latest quote for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Symbol info
// ---------------------------------------------------------------------------

/// Unified per-venue symbol metadata. Venue-specific filter structures are
/// normalised into this shape by the symbol-info cache before storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    #[serde(default)]
    pub active: bool,
    pub price_precision: u32,
    pub amount_precision: u32,
    #[serde(default)]
    pub cost_precision: Option<u32>,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    pub min_amount: f64,
    #[serde(default)]
    pub max_amount: Option<f64>,
    #[serde(default)]
    pub min_cost: Option<f64>,
    #[serde(default)]
    pub tick_size: Option<f64>,
    #[serde(default)]
    pub step_size: Option<f64>,
    #[serde(default)]
    pub maker_fee: Option<f64>,
    #[serde(default)]
    pub taker_fee: Option<f64>,
    /// When this entry was fetched (epoch ms) — gates TTL validity.
    pub fetch_timestamp: i64,
    /// Raw venue payload, kept for debugging.
    #[serde(default)]
    pub raw: serde_json::Value,
}

// ---------------------------------------------------------------------------
// System mode
// ---------------------------------------------------------------------------

/// Engine-wide operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemMode {
    /// Normal signal flow.
    Normal,
    /// Sized amounts are scaled down by the configured factor.
    RiskReduction,
    /// All new signal submission is blocked; flattening orders only.
    Emergency,
}

impl Default for SystemMode {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for SystemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::RiskReduction => write!(f, "RiskReduction"),
            Self::Emergency => write!(f, "Emergency"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_family_classification() {
        assert!(OrderType::Market.is_market_family());
        assert!(OrderType::StopMarket.is_market_family());
        assert!(OrderType::TakeProfitMarket.is_market_family());
        assert!(!OrderType::Limit.is_market_family());
        assert!(!OrderType::StopLimit.is_market_family());
    }

    #[test]
    fn market_order_with_price_is_invalid() {
        let mut req = OrderRequest::market("BTC/USDT", Side::Buy, 0.5);
        req.price = Some(35_000.0);
        assert!(req.validate().is_err());

        req.price = None;
        assert!(req.validate().is_ok());
    }

    #[test]
    fn limit_order_requires_price() {
        let mut req = OrderRequest::limit("ETH/USDT", Side::Sell, 1.0, 2000.0);
        assert!(req.validate().is_ok());

        req.price = None;
        assert!(req.validate().is_err());
    }

    #[test]
    fn stop_order_requires_stop_price() {
        let req = OrderRequest {
            symbol: "BTC/USDT".into(),
            side: Side::Sell,
            order_type: OrderType::StopMarket,
            amount: 0.1,
            price: None,
            stop_price: None,
            options: None,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn non_positive_amount_is_invalid() {
        let req = OrderRequest::market("BTC/USDT", Side::Buy, 0.0);
        assert!(req.validate().is_err());
    }

    #[test]
    fn terminal_statuses_are_sinks() {
        use OrderStatus::*;
        for terminal in [Filled, Canceled, Rejected] {
            for next in [Pending, Placed, Open, PartiallyFilled, Filled, Canceled, Rejected] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn pending_transitions() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Placed));
        assert!(Pending.can_transition_to(Rejected));
        assert!(!Pending.can_transition_to(Filled));
        assert!(!Pending.can_transition_to(Open));
    }

    #[test]
    fn position_mark_updates_pnl() {
        let mut pos = Position {
            symbol: "BTC/USDT".into(),
            side: Side::Buy,
            amount: 2.0,
            entry_price: 30_000.0,
            current_price: 30_000.0,
            cost: 60_000.0,
            unrealized_pnl: 0.0,
            timestamp: 0,
        };
        pos.mark(31_000.0);
        assert!((pos.unrealized_pnl - 2_000.0).abs() < 1e-9);

        pos.side = Side::Sell;
        pos.mark(29_000.0);
        assert!((pos.unrealized_pnl - 2_000.0).abs() < 1e-9);
    }

    #[test]
    fn flat_threshold() {
        let pos = Position {
            symbol: "BTC/USDT".into(),
            side: Side::Buy,
            amount: 5e-7,
            entry_price: 30_000.0,
            current_price: 30_000.0,
            cost: 0.015,
            unrealized_pnl: 0.0,
            timestamp: 0,
        };
        assert!(pos.is_flat());
    }
}
