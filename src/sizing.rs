// =============================================================================
// Order Sizing — risk-budgeted size under venue market constraints
// =============================================================================
//
// size = (balance * risk_fraction) / stop_distance, then market constraints
// in priority order:
//   1. raw below the venue minimum -> floor to min_amount (terminal: the
//      min-cost rule is skipped because the caller's risk budget is already
//      exceeded by the floor).
//   2. otherwise, notional below min_cost -> enlarge to min_cost / price.
//   3. clamp to max_amount.
// The result is rounded DOWN to the venue amount precision so the risk cap
// is never exceeded by rounding.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::config::RiskConfig;
use crate::errors::EngineError;
use crate::symbol_info::SymbolInfoCache;
use crate::types::SymbolInfo;
use crate::venue::gateway::VenueGateway;

/// Floor for stop distance as a fraction of current price. Stops tighter
/// than `price * 1e-4` are widened to `price * min_stop_distance_percentage`.
const STOP_DISTANCE_SANITY_FRACTION: f64 = 1e-4;

/// Order sizing service for one venue.
pub struct OrderSizing {
    cache: Arc<SymbolInfoCache>,
    venue: Arc<dyn VenueGateway>,
    risk: RiskConfig,
}

impl OrderSizing {
    pub fn new(cache: Arc<SymbolInfoCache>, venue: Arc<dyn VenueGateway>, risk: RiskConfig) -> Self {
        Self { cache, venue, risk }
    }

    // -------------------------------------------------------------------------
    // Single symbol
    // -------------------------------------------------------------------------

    /// Compute a venue-valid order size.
    ///
    /// `current_price` is fetched from the venue ticker when not supplied;
    /// `risk_percentage` defaults to the configured max risk per trade.
    pub async fn calculate_order_size(
        &self,
        symbol: &str,
        account_balance: f64,
        stop_distance: f64,
        current_price: Option<f64>,
        risk_percentage: Option<f64>,
    ) -> Result<f64, EngineError> {
        let info = self
            .cache
            .get_symbol_info(symbol, self.cache.default_options())
            .await
            .map_err(|e| EngineError::SizingFailed {
                symbol: symbol.to_string(),
                reason: format!("symbol info unavailable: {e}"),
            })?;

        let price = match current_price {
            Some(p) if p > 0.0 => p,
            _ => {
                let ticker = self.venue.fetch_ticker(symbol).await.map_err(|e| {
                    EngineError::SizingFailed {
                        symbol: symbol.to_string(),
                        reason: format!("no current price: {e}"),
                    }
                })?;
                ticker.last
            }
        };
        if !(price > 0.0) {
            return Err(EngineError::SizingFailed {
                symbol: symbol.to_string(),
                reason: format!("non-positive price {price}"),
            });
        }

        let risk_fraction = risk_percentage.unwrap_or(self.risk.max_risk_per_trade);

        let stop = if stop_distance <= 0.0 || stop_distance < price * STOP_DISTANCE_SANITY_FRACTION
        {
            let substitute = price * self.risk.min_stop_distance_percentage;
            warn!(
                symbol,
                stop_distance,
                substitute,
                "stop distance below sanity floor — substituting minimum distance"
            );
            substitute
        } else {
            stop_distance
        };

        let raw_size = (account_balance * risk_fraction) / stop;
        let size = apply_market_constraints(raw_size, price, &info);
        let rounded = round_down(size, info.amount_precision);

        debug!(
            symbol,
            account_balance,
            risk_fraction,
            stop_distance = stop,
            raw_size,
            size = rounded,
            "order size computed"
        );
        Ok(rounded)
    }

    /// Per-symbol sizes computed in parallel; failed symbols are logged and
    /// omitted.
    pub async fn calculate_multiple(
        &self,
        symbols: &[String],
        account_balance: f64,
        stop_distances: &HashMap<String, f64>,
        current_prices: Option<&HashMap<String, f64>>,
        risk_percentage: Option<f64>,
    ) -> HashMap<String, f64> {
        let computations = symbols.iter().map(|symbol| {
            let stop = stop_distances.get(symbol).copied().unwrap_or(0.0);
            let price = current_prices.and_then(|m| m.get(symbol).copied());
            async move {
                let outcome = self
                    .calculate_order_size(symbol, account_balance, stop, price, risk_percentage)
                    .await;
                (symbol.clone(), outcome)
            }
        });

        let mut result = HashMap::new();
        for (symbol, outcome) in join_all(computations).await {
            match outcome {
                Ok(size) => {
                    result.insert(symbol, size);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "sizing failed — omitting symbol");
                }
            }
        }
        result
    }

    // -------------------------------------------------------------------------
    // Price rounding
    // -------------------------------------------------------------------------

    /// Round a price down to the venue tick grid, falling back to the price
    /// precision when no tick size is known.
    pub async fn round_price_to_tick_size(
        &self,
        symbol: &str,
        price: f64,
    ) -> Result<f64, EngineError> {
        let info = self
            .cache
            .get_symbol_info(symbol, self.cache.default_options())
            .await
            .map_err(|e| EngineError::SizingFailed {
                symbol: symbol.to_string(),
                reason: format!("symbol info unavailable: {e}"),
            })?;

        Ok(match info.tick_size {
            Some(tick) if tick > 0.0 => (price / tick).floor() * tick,
            _ => round_down(price, info.price_precision),
        })
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Apply min-amount / min-cost / max-amount in priority order.
fn apply_market_constraints(raw_size: f64, price: f64, info: &SymbolInfo) -> f64 {
    let mut size = raw_size;

    if size < info.min_amount {
        debug!(
            raw_size,
            min_amount = info.min_amount,
            "raw size below venue minimum — flooring"
        );
        size = info.min_amount;
    } else if let Some(min_cost) = info.min_cost {
        if min_cost > 0.0 && size * price < min_cost {
            debug!(
                notional = size * price,
                min_cost, "notional below venue minimum — enlarging to min cost"
            );
            size = min_cost / price;
        }
    }

    if let Some(max_amount) = info.max_amount {
        size = size.min(max_amount);
    }
    size
}

/// Round down to `decimals` places (never up, to preserve the risk cap).
fn round_down(value: f64, decimals: u32) -> f64 {
    let quantum = 10f64.powi(decimals as i32);
    ((value * quantum) + 1e-9).floor() / quantum
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::venue::testing::MockVenue;

    fn market_info(
        min_amount: f64,
        amount_precision: u32,
        min_cost: Option<f64>,
        max_amount: Option<f64>,
        tick_size: Option<f64>,
    ) -> serde_json::Value {
        serde_json::json!({
            "base": "BTC",
            "quote": "USDT",
            "active": true,
            "minAmount": min_amount,
            "maxAmount": max_amount,
            "minCost": min_cost,
            "amountPrecision": amount_precision,
            "pricePrecision": 2,
            "tickSize": tick_size,
        })
    }

    fn sizing_with(venue: Arc<MockVenue>) -> OrderSizing {
        let cache = Arc::new(SymbolInfoCache::new(
            venue.clone(),
            60_000,
            Arc::new(MetricsRegistry::new()),
        ));
        OrderSizing::new(cache, venue, RiskConfig::default())
    }

    #[tokio::test]
    async fn raw_size_below_venue_minimum_floors_to_minimum() {
        let venue = Arc::new(MockVenue::new("binance"));
        venue.set_market_info(
            "BTC/USDT",
            market_info(0.00001, 6, None, None, None),
        );
        let sizing = sizing_with(venue);

        // (10 * 0.01) / 20000 = 5e-6, below the 1e-5 venue minimum.
        let size = sizing
            .calculate_order_size("BTC/USDT", 10.0, 20_000.0, Some(40_000.0), Some(0.01))
            .await
            .unwrap();
        assert!((size - 0.00001).abs() < 1e-12);
    }

    #[tokio::test]
    async fn min_amount_floor_is_terminal_over_min_cost() {
        let venue = Arc::new(MockVenue::new("binance"));
        // Floored size 0.00001 * 40000 = 0.4 notional, far below min_cost;
        // the floor must still win because the risk budget is already capped.
        venue.set_market_info(
            "BTC/USDT",
            market_info(0.00001, 6, Some(10.0), None, None),
        );
        let sizing = sizing_with(venue);

        let size = sizing
            .calculate_order_size("BTC/USDT", 10.0, 20_000.0, Some(40_000.0), Some(0.01))
            .await
            .unwrap();
        assert!((size - 0.00001).abs() < 1e-12);
    }

    #[tokio::test]
    async fn min_cost_enlarges_small_notional() {
        let venue = Arc::new(MockVenue::new("binance"));
        venue.set_market_info(
            "BTC/USDT",
            market_info(0.001, 4, Some(30.0), None, None),
        );
        let sizing = sizing_with(venue);

        // (1000 * 0.01) / 50 = 0.2; notional 0.2 * 100 = 20 < 30 -> 0.3.
        let size = sizing
            .calculate_order_size("BTC/USDT", 1_000.0, 50.0, Some(100.0), Some(0.01))
            .await
            .unwrap();
        assert!((size - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn max_amount_clamps() {
        let venue = Arc::new(MockVenue::new("binance"));
        venue.set_market_info(
            "BTC/USDT",
            market_info(0.001, 4, None, Some(1.5), None),
        );
        let sizing = sizing_with(venue);

        // (100000 * 0.01) / 100 = 10, clamped to 1.5.
        let size = sizing
            .calculate_order_size("BTC/USDT", 100_000.0, 100.0, Some(100.0), Some(0.01))
            .await
            .unwrap();
        assert!((size - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rounding_is_downward() {
        let venue = Arc::new(MockVenue::new("binance"));
        venue.set_market_info("BTC/USDT", market_info(0.0001, 4, None, None, None));
        let sizing = sizing_with(venue);

        // (1234.5 * 0.01) / 100 = 0.123450 -> raw 0.12345 -> 0.1234 at 4 dp.
        let size = sizing
            .calculate_order_size("BTC/USDT", 1_234.5, 100.0, Some(100.0), Some(0.01))
            .await
            .unwrap();
        assert!((size - 0.1234).abs() < 1e-12);
    }

    #[tokio::test]
    async fn risk_cap_holds_when_floor_not_hit() {
        let venue = Arc::new(MockVenue::new("binance"));
        venue.set_market_info("BTC/USDT", market_info(0.0001, 6, None, None, None));
        let sizing = sizing_with(venue);

        let balance = 5_000.0;
        let stop = 250.0;
        let risk = 0.02;
        let size = sizing
            .calculate_order_size("BTC/USDT", balance, stop, Some(30_000.0), Some(risk))
            .await
            .unwrap();
        assert!(size * stop <= balance * risk * (1.0 + 1e-9));
    }

    #[tokio::test]
    async fn tight_stop_is_widened_to_minimum_distance() {
        let venue = Arc::new(MockVenue::new("binance"));
        venue.set_market_info("BTC/USDT", market_info(0.0, 8, None, None, None));
        let sizing = sizing_with(venue);

        // Stop of 0 is substituted with price * 0.01 = 400.
        let size = sizing
            .calculate_order_size("BTC/USDT", 10_000.0, 0.0, Some(40_000.0), Some(0.01))
            .await
            .unwrap();
        assert!((size - (10_000.0 * 0.01 / 400.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_price_falls_back_to_ticker() {
        let venue = Arc::new(MockVenue::new("binance"));
        venue.set_market_info("BTC/USDT", market_info(0.0, 8, None, None, None));
        venue.set_ticker("BTC/USDT", 20_000.0);
        let sizing = sizing_with(venue);

        let size = sizing
            .calculate_order_size("BTC/USDT", 1_000.0, 100.0, None, Some(0.01))
            .await
            .unwrap();
        assert!((size - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_price_everywhere_is_sizing_failure() {
        let venue = Arc::new(MockVenue::new("binance"));
        venue.set_market_info("BTC/USDT", market_info(0.0, 8, None, None, None));
        let sizing = sizing_with(venue);

        let err = sizing
            .calculate_order_size("BTC/USDT", 1_000.0, 100.0, None, Some(0.01))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SizingFailed { .. }));
    }

    #[tokio::test]
    async fn price_rounds_down_to_tick_grid() {
        let venue = Arc::new(MockVenue::new("binance"));
        venue.set_market_info("BTC/USDT", market_info(0.0, 8, None, None, Some(0.05)));
        let sizing = sizing_with(venue);

        let rounded = sizing
            .round_price_to_tick_size("BTC/USDT", 100.07)
            .await
            .unwrap();
        assert!((rounded - 100.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn price_rounding_falls_back_to_precision_without_tick() {
        let venue = Arc::new(MockVenue::new("binance"));
        venue.set_market_info("BTC/USDT", market_info(0.0, 8, None, None, None));
        let sizing = sizing_with(venue);

        let rounded = sizing
            .round_price_to_tick_size("BTC/USDT", 100.079)
            .await
            .unwrap();
        // price_precision is 2 in the scripted info.
        assert!((rounded - 100.07).abs() < 1e-9);
    }

    #[tokio::test]
    async fn multiple_symbols_tolerate_partial_failure() {
        let venue = Arc::new(MockVenue::new("binance"));
        venue.set_market_info("BTC/USDT", market_info(0.0, 6, None, None, None));
        // ETH/USDT unscripted -> sizing fails for it.
        let sizing = sizing_with(venue);

        let symbols = vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()];
        let stops: HashMap<String, f64> = [
            ("BTC/USDT".to_string(), 100.0),
            ("ETH/USDT".to_string(), 10.0),
        ]
        .into();
        let prices: HashMap<String, f64> = [
            ("BTC/USDT".to_string(), 30_000.0),
            ("ETH/USDT".to_string(), 2_000.0),
        ]
        .into();

        let sizes = sizing
            .calculate_multiple(&symbols, 1_000.0, &stops, Some(&prices), Some(0.01))
            .await;
        assert_eq!(sizes.len(), 1);
        assert!(sizes.contains_key("BTC/USDT"));
    }
}
