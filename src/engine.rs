// =============================================================================
// Symbol Trading Engine — one symbol's candle-to-order loop
// =============================================================================
//
// On each candle: append to the history, run the strategy, pass the
// resulting signals through the engine-local filters, and hand the
// survivors back to the caller. Submission happens in `process_signals`
// so a portfolio coordinator can apply its own pruning between the two
// steps; standalone callers just chain them.
//
// Modes: RiskReduction scales signal amounts by the configured factor;
// Emergency blocks all new signals and only lets flattening orders
// (opposite side, at most the open amount) through.
//
// Equity = cash + signed position value at the current mark. Cash is
// adjusted by signal notional at submission time.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::market_data::{Candle, CandleSeries};
use crate::sizing::OrderSizing;
use crate::strategy::{Strategy, StrategyContext};
use crate::types::{OrderRequest, OrderType, Position, Side, SystemMode};
use crate::unified::UnifiedOrderManager;

/// Candle history retained per engine.
const CANDLE_HISTORY: usize = 500;
/// Recent-signal history retained for inspection.
const SIGNAL_HISTORY: usize = 100;

/// Trading engine for a single symbol, routing through the unified order
/// manager.
pub struct SymbolTradingEngine {
    symbol: String,
    strategy: Mutex<Box<dyn Strategy>>,
    uom: Arc<UnifiedOrderManager>,
    /// Risk-budget sizing service; signals carrying a stop distance are
    /// re-sized through it before submission.
    sizing: Option<Arc<OrderSizing>>,
    series: CandleSeries,
    cash: RwLock<f64>,
    mode: RwLock<SystemMode>,
    risk: RiskConfig,
    recent_signals: RwLock<VecDeque<OrderRequest>>,
    current_price: RwLock<f64>,
}

impl SymbolTradingEngine {
    pub fn new(
        symbol: impl Into<String>,
        strategy: Box<dyn Strategy>,
        uom: Arc<UnifiedOrderManager>,
        sizing: Option<Arc<OrderSizing>>,
        initial_cash: f64,
        risk: RiskConfig,
    ) -> Self {
        let symbol = symbol.into();
        info!(symbol = %symbol, initial_cash, "symbol engine created");
        Self {
            symbol,
            strategy: Mutex::new(strategy),
            uom,
            sizing,
            series: CandleSeries::new(CANDLE_HISTORY),
            cash: RwLock::new(initial_cash),
            mode: RwLock::new(SystemMode::Normal),
            risk,
            recent_signals: RwLock::new(VecDeque::with_capacity(SIGNAL_HISTORY)),
            current_price: RwLock::new(0.0),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    // -------------------------------------------------------------------------
    // Candle intake
    // -------------------------------------------------------------------------

    /// Consume one candle and return the signals that survive the engine's
    /// local filters. Submission is the caller's next step via
    /// [`process_signals`](Self::process_signals).
    pub fn update(&self, candle: &Candle) -> Vec<OrderRequest> {
        if !self.series.push(&self.symbol, candle.clone()) {
            return Vec::new();
        }
        *self.current_price.write() = candle.close;

        let mode = *self.mode.read();
        if mode == SystemMode::Emergency {
            // No strategy consultation; emit at most a flattening order.
            return self.flatten_signal().into_iter().collect();
        }

        let candles = self.series.recent(&self.symbol, CANDLE_HISTORY);
        let position = self.position();
        let cash = *self.cash.read();

        let raw_signals = {
            let mut strategy = self.strategy.lock();
            let ctx = StrategyContext {
                symbol: &self.symbol,
                candles: &candles,
                position: position.as_ref(),
                cash,
            };
            strategy.on_candle(candle, &ctx)
        };

        let filtered: Vec<OrderRequest> = raw_signals
            .into_iter()
            .filter_map(|s| self.filter_signal(s, mode, cash, candle.close))
            .collect();

        if !filtered.is_empty() {
            let mut recent = self.recent_signals.write();
            for signal in &filtered {
                if recent.len() == SIGNAL_HISTORY {
                    recent.pop_front();
                }
                recent.push_back(signal.clone());
            }
        }
        filtered
    }

    /// Engine-local signal filtering: symbol gate, per-symbol cash cap,
    /// RiskReduction scaling, and MARKET hygiene.
    fn filter_signal(
        &self,
        mut signal: OrderRequest,
        mode: SystemMode,
        cash: f64,
        price: f64,
    ) -> Option<OrderRequest> {
        if signal.symbol != self.symbol {
            warn!(
                engine = %self.symbol,
                signal_symbol = %signal.symbol,
                "strategy emitted a foreign-symbol signal — dropped"
            );
            return None;
        }

        if mode == SystemMode::RiskReduction {
            let scaled = signal.amount * self.risk.risk_reduction_factor;
            debug!(
                symbol = %self.symbol,
                original = signal.amount,
                scaled,
                "risk-reduction scaling applied"
            );
            signal.amount = scaled;
        }

        // Entries may not spend more than this engine's remaining cash.
        if signal.side == Side::Buy && price > 0.0 {
            let max_amount = cash / price;
            if signal.amount > max_amount {
                debug!(
                    symbol = %self.symbol,
                    requested = signal.amount,
                    capped = max_amount,
                    "signal amount capped by available cash"
                );
                signal.amount = max_amount;
            }
        }

        (signal.amount > 0.0).then_some(signal)
    }

    /// A market order flattening the current position, if one is open.
    fn flatten_signal(&self) -> Option<OrderRequest> {
        let position = self.position()?;
        if position.is_flat() {
            return None;
        }
        warn!(
            symbol = %self.symbol,
            amount = position.amount,
            "emergency mode — emitting flattening order"
        );
        Some(OrderRequest::market(
            &self.symbol,
            position.side.opposite(),
            position.amount,
        ))
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Submit signals through the unified order manager. In Emergency mode
    /// only flattening orders pass.
    pub async fn process_signals(&self, signals: Vec<OrderRequest>) {
        let mode = *self.mode.read();
        let price = *self.current_price.read();

        for signal in signals {
            if mode == SystemMode::Emergency && !self.is_flattening(&signal) {
                warn!(
                    symbol = %self.symbol,
                    side = %signal.side,
                    "emergency mode — signal blocked"
                );
                continue;
            }

            let signal = self.prepare_for_submission(signal, price).await;
            let side = signal.side;
            let amount = signal.amount;
            match self.uom.create_order(signal).await {
                Ok(result) if result.is_empty() => {
                    warn!(symbol = %self.symbol, "order failed on every venue");
                }
                Ok(result) => {
                    // Cash moves by the submitted notional at the current
                    // mark; fills refine positions through the OMS.
                    let notional = amount * price;
                    let mut cash = self.cash.write();
                    match side {
                        Side::Buy => *cash -= notional,
                        Side::Sell => *cash += notional,
                    }
                    debug!(
                        symbol = %self.symbol,
                        venues = result.len(),
                        notional,
                        "signal submitted"
                    );
                }
                Err(e) => {
                    warn!(symbol = %self.symbol, error = %e, "signal submission failed");
                }
            }
        }
    }

    /// Final venue hygiene before submission: risk-size entries through the
    /// sizing service, round limit prices to the tick grid, and strip the
    /// advisory stop from pure MARKET orders.
    ///
    /// Entries without a stop distance are sized against the default ATR
    /// fraction of price.
    async fn prepare_for_submission(&self, mut signal: OrderRequest, price: f64) -> OrderRequest {
        if let Some(sizing) = &self.sizing {
            let stop_distance = match signal.stop_price {
                Some(stop) => Some((price - stop).abs()),
                None if signal.side == Side::Buy => {
                    Some(price * self.risk.default_atr_percentage)
                }
                None => None,
            };

            if let Some(stop_distance) = stop_distance {
                let cash = *self.cash.read();
                match sizing
                    .calculate_order_size(&self.symbol, cash, stop_distance, Some(price), None)
                    .await
                {
                    Ok(sized) if sized > 0.0 => {
                        debug!(
                            symbol = %self.symbol,
                            proposed = signal.amount,
                            sized,
                            "signal re-sized by risk budget"
                        );
                        signal.amount = sized.min(signal.amount);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(
                            symbol = %self.symbol,
                            error = %e,
                            "risk sizing failed — keeping strategy amount"
                        );
                    }
                }
            }

            if let Some(limit) = signal.price {
                match sizing.round_price_to_tick_size(&self.symbol, limit).await {
                    Ok(rounded) => signal.price = Some(rounded),
                    Err(e) => {
                        warn!(
                            symbol = %self.symbol,
                            error = %e,
                            "tick rounding failed — keeping raw price"
                        );
                    }
                }
            }
        }

        // The stop rides on entry signals only to size them; pure MARKET
        // orders must not carry it onto the wire.
        if signal.order_type == OrderType::Market {
            signal.stop_price = None;
        }
        signal
    }

    /// Whether a signal only reduces the current exposure.
    fn is_flattening(&self, signal: &OrderRequest) -> bool {
        match self.position() {
            Some(position) => {
                signal.side == position.side.opposite()
                    && signal.amount <= position.amount + crate::types::FLAT_EPSILON
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // State accessors
    // -------------------------------------------------------------------------

    /// Net position for this symbol across venues.
    pub fn position(&self) -> Option<Position> {
        self.uom.get_total_position(&self.symbol)
    }

    pub fn get_positions(&self) -> Vec<Position> {
        self.position().into_iter().collect()
    }

    /// cash + signed mark-to-market of the open position.
    pub fn get_equity(&self) -> f64 {
        let cash = *self.cash.read();
        let price = *self.current_price.read();
        match self.position() {
            Some(pos) => cash + pos.side.sign() * pos.amount * price,
            None => cash,
        }
    }

    pub fn get_current_price(&self) -> f64 {
        *self.current_price.read()
    }

    pub fn get_recent_signals(&self) -> Vec<OrderRequest> {
        self.recent_signals.read().iter().cloned().collect()
    }

    pub fn set_system_mode(&self, mode: SystemMode) {
        info!(symbol = %self.symbol, mode = %mode, "system mode changed");
        *self.mode.write() = mode;
    }

    pub fn system_mode(&self) -> SystemMode {
        *self.mode.read()
    }
}

impl std::fmt::Debug for SymbolTradingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolTradingEngine")
            .field("symbol", &self.symbol)
            .field("cash", &*self.cash.read())
            .field("mode", &*self.mode.read())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::venue::testing::MockVenue;

    /// Emits one fixed signal per candle.
    struct FixedSignalStrategy {
        signal: Option<OrderRequest>,
    }

    impl Strategy for FixedSignalStrategy {
        fn name(&self) -> &str {
            "fixed"
        }

        fn on_candle(&mut self, _candle: &Candle, _ctx: &StrategyContext<'_>) -> Vec<OrderRequest> {
            self.signal.iter().cloned().collect()
        }
    }

    fn candle(ts: i64, close: f64) -> Candle {
        Candle::new(ts, close, close + 1.0, close - 1.0, close, 10.0)
    }

    fn engine_with(
        signal: Option<OrderRequest>,
        cash: f64,
    ) -> (SymbolTradingEngine, Arc<MockVenue>) {
        let uom = Arc::new(UnifiedOrderManager::new(Arc::new(MetricsRegistry::new())));
        let venue = Arc::new(MockVenue::new("binance"));
        uom.add_venue("binance", venue.clone());
        let engine = SymbolTradingEngine::new(
            "BTC/USDT",
            Box::new(FixedSignalStrategy { signal }),
            uom,
            None,
            cash,
            RiskConfig::default(),
        );
        (engine, venue)
    }

    fn buy_signal(amount: f64) -> OrderRequest {
        OrderRequest::market("BTC/USDT", Side::Buy, amount)
    }

    #[tokio::test]
    async fn update_produces_and_submits_signals() {
        let (engine, venue) = engine_with(Some(buy_signal(0.5)), 100_000.0);

        let signals = engine.update(&candle(60_000, 30_000.0));
        assert_eq!(signals.len(), 1);
        engine.process_signals(signals).await;

        assert_eq!(venue.executed_count(), 1);
        assert!((venue.executed.lock()[0].amount - 0.5).abs() < 1e-12);
        // 0.5 BTC at 30k spent from cash.
        assert!((engine.get_equity() - 100_000.0 + 15_000.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn emergency_mode_blocks_new_signals() {
        let (engine, venue) = engine_with(Some(buy_signal(0.5)), 100_000.0);
        engine.set_system_mode(SystemMode::Emergency);

        let signals = engine.update(&candle(60_000, 30_000.0));
        assert!(signals.is_empty(), "no position, so not even a flatten");

        engine.process_signals(vec![buy_signal(0.5)]).await;
        assert_eq!(venue.executed_count(), 0);
    }

    #[tokio::test]
    async fn risk_reduction_scales_amounts() {
        let (engine, venue) = engine_with(Some(buy_signal(1.0)), 1_000_000.0);
        engine.set_system_mode(SystemMode::RiskReduction);

        let signals = engine.update(&candle(60_000, 30_000.0));
        assert_eq!(signals.len(), 1);
        // Default risk_reduction_factor is 0.5.
        assert!((signals[0].amount - 0.5).abs() < 1e-12);

        engine.process_signals(signals).await;
        assert!((venue.executed.lock()[0].amount - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn buy_amount_is_capped_by_cash() {
        let (engine, _venue) = engine_with(Some(buy_signal(10.0)), 30_000.0);

        let signals = engine.update(&candle(60_000, 30_000.0));
        assert_eq!(signals.len(), 1);
        // 30k cash at 30k/BTC affords exactly 1.0.
        assert!((signals[0].amount - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn foreign_symbol_signals_are_dropped() {
        let (engine, _venue) = engine_with(
            Some(OrderRequest::market("ETH/USDT", Side::Buy, 1.0)),
            100_000.0,
        );
        let signals = engine.update(&candle(60_000, 30_000.0));
        assert!(signals.is_empty());
    }

    #[tokio::test]
    async fn market_orders_shed_their_stop_price_at_submission() {
        let mut with_stop = buy_signal(0.5);
        with_stop.stop_price = Some(29_000.0);
        let (engine, venue) = engine_with(Some(with_stop), 100_000.0);

        let signals = engine.update(&candle(60_000, 30_000.0));
        assert_eq!(signals.len(), 1);
        engine.process_signals(signals).await;

        let executed = venue.executed.lock();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].stop_price.is_none());
    }

    #[tokio::test]
    async fn stop_carrying_signals_are_risk_sized() {
        use crate::symbol_info::SymbolInfoCache;

        let uom = Arc::new(UnifiedOrderManager::new(Arc::new(MetricsRegistry::new())));
        let venue = Arc::new(MockVenue::new("binance"));
        venue.set_market_info(
            "BTC/USDT",
            serde_json::json!({
                "base": "BTC", "quote": "USDT", "active": true,
                "minAmount": 0.0001, "amountPrecision": 4, "pricePrecision": 2
            }),
        );
        uom.add_venue("binance", venue.clone());

        let cache = Arc::new(SymbolInfoCache::new(
            venue.clone(),
            60_000,
            Arc::new(MetricsRegistry::new()),
        ));
        let sizing = Arc::new(OrderSizing::new(
            cache,
            venue.clone(),
            RiskConfig::default(),
        ));

        let mut signal = buy_signal(5.0);
        signal.stop_price = Some(29_000.0);
        let engine = SymbolTradingEngine::new(
            "BTC/USDT",
            Box::new(FixedSignalStrategy { signal: Some(signal) }),
            uom,
            Some(sizing),
            100_000.0,
            RiskConfig::default(),
        );

        let signals = engine.update(&candle(60_000, 30_000.0));
        engine.process_signals(signals).await;

        // Risk budget: 100k * 1% / 1000 stop distance = 1.0, well below the
        // strategy's 5.0 proposal.
        let executed = venue.executed.lock();
        assert_eq!(executed.len(), 1);
        assert!((executed[0].amount - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn recent_signal_history_is_tracked() {
        let (engine, _venue) = engine_with(Some(buy_signal(0.1)), 1_000_000.0);

        for i in 0..3 {
            engine.update(&candle((i + 1) * 60_000, 30_000.0));
        }
        assert_eq!(engine.get_recent_signals().len(), 3);
    }

    #[tokio::test]
    async fn equity_without_positions_is_cash() {
        let (engine, _venue) = engine_with(None, 12_345.0);
        engine.update(&candle(60_000, 30_000.0));
        assert!((engine.get_equity() - 12_345.0).abs() < f64::EPSILON);
        assert!((engine.get_current_price() - 30_000.0).abs() < f64::EPSILON);
    }
}
