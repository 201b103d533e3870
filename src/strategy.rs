// =============================================================================
// Strategy collaborator — signal generation seam for the symbol engine
// =============================================================================
//
// Strategies are external collaborators: the engine owns the candle history
// and position context and hands both to the strategy on every candle. The
// EMA crossover strategy below is the reference implementation used by the
// demo wiring and the engine tests.
// =============================================================================

use tracing::debug;

use crate::indicators::atr::calculate_atr_fraction;
use crate::indicators::ema::calculate_ema;
use crate::market_data::Candle;
use crate::types::{OrderRequest, Position, Side};

/// Read-only view the engine exposes to its strategy on each candle.
pub struct StrategyContext<'a> {
    pub symbol: &'a str,
    /// Recent candles, oldest first, including the current one.
    pub candles: &'a [Candle],
    /// Net position for this symbol, when one is open.
    pub position: Option<&'a Position>,
    /// Cash available to this symbol's engine.
    pub cash: f64,
}

/// Signal generator driven once per candle. State beyond the provided
/// context is the strategy's own business.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Produce zero or more order requests for this candle.
    fn on_candle(&mut self, candle: &Candle, ctx: &StrategyContext<'_>) -> Vec<OrderRequest>;
}

// ---------------------------------------------------------------------------
// Reference strategy: EMA crossover with ATR-scaled stops
// ---------------------------------------------------------------------------

/// Long-only EMA crossover: enter when the fast EMA crosses above the slow,
/// flatten when it crosses back below.
pub struct EmaCrossStrategy {
    fast_period: usize,
    slow_period: usize,
    /// Fraction of available cash committed per entry.
    entry_fraction: f64,
    /// ATR look-back for stop distance estimation.
    atr_period: usize,
}

impl EmaCrossStrategy {
    pub fn new(fast_period: usize, slow_period: usize, entry_fraction: f64) -> Self {
        Self {
            fast_period,
            slow_period,
            entry_fraction,
            atr_period: 14,
        }
    }

    /// Last two values of the EMA series, if available.
    fn last_two(series: &[f64]) -> Option<(f64, f64)> {
        if series.len() < 2 {
            return None;
        }
        Some((series[series.len() - 2], series[series.len() - 1]))
    }
}

impl Default for EmaCrossStrategy {
    fn default() -> Self {
        Self::new(9, 21, 0.5)
    }
}

impl Strategy for EmaCrossStrategy {
    fn name(&self) -> &str {
        "ema-cross"
    }

    fn on_candle(&mut self, candle: &Candle, ctx: &StrategyContext<'_>) -> Vec<OrderRequest> {
        let closes: Vec<f64> = ctx.candles.iter().map(|c| c.close).collect();
        if closes.len() < self.slow_period + 1 {
            return Vec::new();
        }

        let fast = calculate_ema(&closes, self.fast_period);
        let slow = calculate_ema(&closes, self.slow_period);
        let (Some((fast_prev, fast_now)), Some((slow_prev, slow_now))) =
            (Self::last_two(&fast), Self::last_two(&slow))
        else {
            return Vec::new();
        };

        let crossed_up = fast_prev <= slow_prev && fast_now > slow_now;
        let crossed_down = fast_prev >= slow_prev && fast_now < slow_now;
        let has_long = ctx.position.map_or(false, |p| p.side == Side::Buy && !p.is_flat());

        if crossed_up && !has_long && candle.close > 0.0 {
            let amount = (ctx.cash * self.entry_fraction) / candle.close;
            if amount <= 0.0 {
                return Vec::new();
            }
            let stop_fraction =
                calculate_atr_fraction(ctx.candles, self.atr_period).unwrap_or(0.02);
            let stop_price = candle.close * (1.0 - stop_fraction);
            debug!(
                symbol = ctx.symbol,
                close = candle.close,
                amount,
                stop_price,
                "bullish EMA cross — entering long"
            );
            let mut entry = OrderRequest::market(ctx.symbol, Side::Buy, amount);
            entry.stop_price = Some(stop_price);
            return vec![entry];
        }

        if crossed_down && has_long {
            let position = ctx.position.expect("has_long implies a position");
            debug!(
                symbol = ctx.symbol,
                amount = position.amount,
                "bearish EMA cross — flattening long"
            );
            return vec![OrderRequest::market(ctx.symbol, Side::Sell, position.amount)];
        }

        Vec::new()
    }
}
