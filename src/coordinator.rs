// =============================================================================
// Multi-Symbol Coordinator — capital allocation, tick dispatch, portfolio view
// =============================================================================
//
// Owns one symbol engine per configured symbol. Each update tick:
//   1. feed every engine its candle and collect the surviving signals,
//   2. prune the combined signal set against the portfolio risk limit
//      (arrival order is kept; later signals are dropped first),
//   3. dispatch the survivors through each engine under the tick budget
//      (an engine that misses the budget is skipped and retried next tick),
//   4. append one equity point stamped with the bundle's max timestamp.
//
// The equity history is append-only; readers receive snapshot copies.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::engine::SymbolTradingEngine;
use crate::market_data::CandleBundle;
use crate::portfolio_risk::{PortfolioRiskTracker, RiskReport, StressScenario};
use crate::sizing::OrderSizing;
use crate::strategy::Strategy;
use crate::types::{OrderRequest, Position, Side, SystemMode};
use crate::unified::UnifiedOrderManager;

/// One row of the portfolio equity history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioEquityPoint {
    pub timestamp: i64,
    pub per_symbol: HashMap<String, f64>,
    pub total: f64,
}

/// Backtest outcome for a full candle replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiSymbolResult {
    pub initial_capital: f64,
    pub final_equity: f64,
    pub per_symbol_equity: HashMap<String, f64>,
    pub equity_history: Vec<PortfolioEquityPoint>,
    pub risk_report: RiskReport,
}

/// Builds one strategy instance per symbol at initialize time.
pub type StrategyFactory = Arc<dyn Fn(&str) -> Box<dyn Strategy> + Send + Sync>;

/// Drives a set of per-symbol engines against a shared venue plane.
pub struct MultiSymbolCoordinator {
    config: RuntimeConfig,
    uom: Arc<UnifiedOrderManager>,
    strategy_factory: StrategyFactory,
    sizing: Option<Arc<OrderSizing>>,
    engines: RwLock<HashMap<String, Arc<SymbolTradingEngine>>>,
    equity_history: RwLock<Vec<PortfolioEquityPoint>>,
    risk_tracker: PortfolioRiskTracker,
    initialized: AtomicBool,
}

impl MultiSymbolCoordinator {
    pub fn new(
        config: RuntimeConfig,
        uom: Arc<UnifiedOrderManager>,
        strategy_factory: StrategyFactory,
        sizing: Option<Arc<OrderSizing>>,
        stress_scenarios: Vec<StressScenario>,
    ) -> Self {
        let risk_tracker = PortfolioRiskTracker::new(config.correlation_window, stress_scenarios);
        Self {
            config,
            uom,
            strategy_factory,
            sizing,
            engines: RwLock::new(HashMap::new()),
            equity_history: RwLock::new(Vec::new()),
            risk_tracker,
            initialized: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Capital allocation & engine construction
    // -------------------------------------------------------------------------

    /// Allocate initial capital across symbols and build one engine each.
    ///
    /// With no configured weights every symbol receives an equal share;
    /// otherwise each symbol gets `capital * weight / Σ weights`, with
    /// missing weights treated as zero (the engine is still registered and
    /// starts flat).
    pub fn initialize(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }

        let symbols = &self.config.symbols;
        let capital = self.config.initial_capital;
        let weights = &self.config.capital_weights;

        let allocations: Vec<(String, f64)> = if weights.is_empty() {
            let share = if symbols.is_empty() {
                0.0
            } else {
                capital / symbols.len() as f64
            };
            symbols.iter().map(|s| (s.clone(), share)).collect()
        } else {
            let total_weight: f64 = symbols
                .iter()
                .map(|s| weights.get(s).copied().unwrap_or(0.0))
                .sum();
            symbols
                .iter()
                .map(|s| {
                    let w = weights.get(s).copied().unwrap_or(0.0);
                    let share = if total_weight > 0.0 {
                        capital * w / total_weight
                    } else {
                        0.0
                    };
                    (s.clone(), share)
                })
                .collect()
        };

        let mut engines = self.engines.write();
        for (symbol, cash) in allocations {
            info!(symbol = %symbol, cash, "capital allocated");
            let strategy = (self.strategy_factory)(&symbol);
            engines.insert(
                symbol.clone(),
                Arc::new(SymbolTradingEngine::new(
                    symbol,
                    strategy,
                    self.uom.clone(),
                    self.sizing.clone(),
                    cash,
                    self.config.risk.clone(),
                )),
            );
        }
        info!(engines = engines.len(), "coordinator initialised");
    }

    // -------------------------------------------------------------------------
    // Tick dispatch
    // -------------------------------------------------------------------------

    /// Drive one tick's candle bundle through every engine.
    pub async fn update(&self, bundle: &CandleBundle) {
        self.initialize();

        // Deterministic per-tick ordering: signals keep arrival order by
        // symbol name, which also fixes pruning priority.
        let mut symbols: Vec<&String> = bundle.keys().collect();
        symbols.sort();

        let mut collected: Vec<(Arc<SymbolTradingEngine>, Vec<OrderRequest>)> = Vec::new();
        let mut max_timestamp = i64::MIN;

        for symbol in symbols {
            let candle = &bundle[symbol];
            max_timestamp = max_timestamp.max(candle.timestamp);
            self.risk_tracker.observe_price(symbol, candle.close);

            let Some(engine) = self.engines.read().get(symbol).cloned() else {
                debug!(symbol = %symbol, "no engine for symbol in bundle");
                continue;
            };
            let signals = engine.update(candle);
            if !signals.is_empty() {
                collected.push((engine, signals));
            }
        }

        let pruned = self.apply_portfolio_risk_limit(collected);

        // Dispatch under the tick budget; a late engine is skipped for this
        // tick and picks up again on the next one.
        let budget = Duration::from_millis(self.config.update_budget_ms);
        let dispatches = pruned.into_iter().map(|(engine, signals)| async move {
            let symbol = engine.symbol().to_string();
            if tokio::time::timeout(budget, engine.process_signals(signals))
                .await
                .is_err()
            {
                warn!(symbol = %symbol, "engine missed the tick budget — skipped");
            }
        });
        join_all(dispatches).await;

        if max_timestamp > i64::MIN {
            self.append_equity_point(max_timestamp);
        }
    }

    /// Prune pending signals so projected exposure stays within the
    /// configured portfolio risk limit. Arrival order wins.
    fn apply_portfolio_risk_limit(
        &self,
        collected: Vec<(Arc<SymbolTradingEngine>, Vec<OrderRequest>)>,
    ) -> Vec<(Arc<SymbolTradingEngine>, Vec<OrderRequest>)> {
        let Some(limit) = self.config.risk.portfolio_risk_limit else {
            return collected;
        };
        let equity = self.get_portfolio_equity();
        if equity <= 0.0 {
            return collected;
        }

        let mut exposure: f64 = self
            .uom
            .get_consolidated_positions()
            .iter()
            .map(|p| p.side.sign() * p.amount * p.current_price)
            .sum();

        collected
            .into_iter()
            .map(|(engine, signals)| {
                let price = engine.get_current_price();
                let kept: Vec<OrderRequest> = signals
                    .into_iter()
                    .filter(|signal| {
                        let notional = signal.amount * price;
                        let projected = match signal.side {
                            Side::Buy => exposure + notional,
                            Side::Sell => exposure - notional,
                        };
                        if projected.abs() / equity > limit {
                            warn!(
                                symbol = %engine.symbol(),
                                side = %signal.side,
                                notional,
                                limit,
                                "signal pruned by portfolio risk limit"
                            );
                            false
                        } else {
                            exposure = projected;
                            true
                        }
                    })
                    .collect();
                (engine, kept)
            })
            .filter(|(_, signals)| !signals.is_empty())
            .collect()
    }

    fn append_equity_point(&self, timestamp: i64) {
        let engines = self.engines.read();
        let per_symbol: HashMap<String, f64> = engines
            .iter()
            .map(|(symbol, engine)| (symbol.clone(), engine.get_equity()))
            .collect();
        let total = per_symbol.values().sum();
        drop(engines);

        self.equity_history.write().push(PortfolioEquityPoint {
            timestamp,
            per_symbol,
            total,
        });
    }

    // -------------------------------------------------------------------------
    // Backtest
    // -------------------------------------------------------------------------

    /// Replay a sequence of candle bundles and summarise the outcome.
    pub async fn run(&self, ticks: &[CandleBundle]) -> MultiSymbolResult {
        self.initialize();
        for bundle in ticks {
            self.update(bundle).await;
        }

        let engines = self.engines.read();
        let per_symbol_equity: HashMap<String, f64> = engines
            .iter()
            .map(|(symbol, engine)| (symbol.clone(), engine.get_equity()))
            .collect();
        drop(engines);

        MultiSymbolResult {
            initial_capital: self.config.initial_capital,
            final_equity: per_symbol_equity.values().sum(),
            per_symbol_equity,
            equity_history: self.get_equity_history(),
            risk_report: self.get_portfolio_risk_analysis(),
        }
    }

    // -------------------------------------------------------------------------
    // Portfolio view
    // -------------------------------------------------------------------------

    pub fn get_portfolio_equity(&self) -> f64 {
        self.engines
            .read()
            .values()
            .map(|engine| engine.get_equity())
            .sum()
    }

    /// Snapshot of the append-only equity history.
    pub fn get_equity_history(&self) -> Vec<PortfolioEquityPoint> {
        self.equity_history.read().clone()
    }

    /// Consolidated positions across venues.
    pub fn get_all_positions(&self) -> Vec<Position> {
        self.uom.get_consolidated_positions()
    }

    pub fn get_correlation_matrix(&self) -> HashMap<String, HashMap<String, f64>> {
        self.risk_tracker.correlation_matrix()
    }

    pub fn get_portfolio_risk_analysis(&self) -> RiskReport {
        let position_values: HashMap<String, f64> = self
            .uom
            .get_consolidated_positions()
            .iter()
            .map(|p| (p.symbol.clone(), p.side.sign() * p.amount * p.current_price))
            .collect();
        self.risk_tracker
            .analyze(&position_values, self.get_portfolio_equity())
    }

    /// Propagate a mode change to every engine.
    pub fn set_system_mode(&self, mode: SystemMode) {
        info!(mode = %mode, "coordinator mode change");
        for engine in self.engines.read().values() {
            engine.set_system_mode(mode);
        }
    }

    /// Engine handle for one symbol.
    pub fn engine(&self, symbol: &str) -> Option<Arc<SymbolTradingEngine>> {
        self.engines.read().get(symbol).cloned()
    }
}

impl std::fmt::Debug for MultiSymbolCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiSymbolCoordinator")
            .field("engines", &self.engines.read().len())
            .field("equity_points", &self.equity_history.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;
    use crate::metrics::MetricsRegistry;
    use crate::strategy::StrategyContext;
    use crate::venue::testing::MockVenue;

    /// Emits one buy per candle, sized as a fraction of engine cash.
    struct AlwaysBuyStrategy {
        fraction: f64,
    }

    impl Strategy for AlwaysBuyStrategy {
        fn name(&self) -> &str {
            "always-buy"
        }

        fn on_candle(&mut self, candle: &Candle, ctx: &StrategyContext<'_>) -> Vec<OrderRequest> {
            if candle.close <= 0.0 || ctx.cash <= 0.0 {
                return Vec::new();
            }
            let amount = ctx.cash * self.fraction / candle.close;
            vec![OrderRequest::market(ctx.symbol, Side::Buy, amount)]
        }
    }

    struct SilentStrategy;

    impl Strategy for SilentStrategy {
        fn name(&self) -> &str {
            "silent"
        }

        fn on_candle(&mut self, _: &Candle, _: &StrategyContext<'_>) -> Vec<OrderRequest> {
            Vec::new()
        }
    }

    fn candle(ts: i64, close: f64) -> Candle {
        Candle::new(ts, close, close + 1.0, close - 1.0, close, 10.0)
    }

    fn bundle(entries: &[(&str, i64, f64)]) -> CandleBundle {
        entries
            .iter()
            .map(|(s, ts, close)| (s.to_string(), candle(*ts, *close)))
            .collect()
    }

    fn base_config(symbols: &[&str], capital: f64) -> RuntimeConfig {
        RuntimeConfig {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            initial_capital: capital,
            ..RuntimeConfig::default()
        }
    }

    fn coordinator_with(
        config: RuntimeConfig,
        factory: StrategyFactory,
    ) -> (MultiSymbolCoordinator, Arc<MockVenue>) {
        let uom = Arc::new(UnifiedOrderManager::new(Arc::new(MetricsRegistry::new())));
        let venue = Arc::new(MockVenue::new("binance"));
        uom.add_venue("binance", venue.clone());
        (
            MultiSymbolCoordinator::new(config, uom, factory, None, Vec::new()),
            venue,
        )
    }

    fn silent_factory() -> StrategyFactory {
        Arc::new(|_: &str| -> Box<dyn Strategy> { Box::new(SilentStrategy) })
    }

    #[tokio::test]
    async fn equal_capital_allocation() {
        let (coordinator, _venue) = coordinator_with(
            base_config(&["BTC/USDT", "ETH/USDT"], 10_000.0),
            silent_factory(),
        );
        coordinator.initialize();

        for symbol in ["BTC/USDT", "ETH/USDT"] {
            let engine = coordinator.engine(symbol).unwrap();
            assert!((engine.get_equity() - 5_000.0).abs() < 1e-9);
        }
        assert!((coordinator.get_portfolio_equity() - 10_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn custom_capital_weights() {
        let mut config = base_config(&["BTC/USDT", "ETH/USDT", "SOL/USDT"], 10_000.0);
        config.capital_weights.insert("BTC/USDT".into(), 3.0);
        config.capital_weights.insert("ETH/USDT".into(), 1.0);
        // SOL/USDT missing -> zero allocation but still registered.
        let (coordinator, _venue) = coordinator_with(config, silent_factory());
        coordinator.initialize();

        assert!(
            (coordinator.engine("BTC/USDT").unwrap().get_equity() - 7_500.0).abs() < 1e-9
        );
        assert!(
            (coordinator.engine("ETH/USDT").unwrap().get_equity() - 2_500.0).abs() < 1e-9
        );
        let sol = coordinator.engine("SOL/USDT").unwrap();
        assert!(sol.get_equity().abs() < 1e-9);
    }

    #[tokio::test]
    async fn update_appends_equity_point_with_max_timestamp() {
        let (coordinator, _venue) = coordinator_with(
            base_config(&["BTC/USDT", "ETH/USDT"], 10_000.0),
            silent_factory(),
        );

        coordinator
            .update(&bundle(&[
                ("BTC/USDT", 60_000, 30_000.0),
                ("ETH/USDT", 120_000, 2_000.0),
            ]))
            .await;

        let history = coordinator.get_equity_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].timestamp, 120_000);
        assert_eq!(history[0].per_symbol.len(), 2);
        assert!((history[0].total - 10_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn portfolio_risk_limit_prunes_signals() {
        let mut config = base_config(&["BTC/USDT"], 10_000.0);
        // Cap exposure at 10% of equity; the strategy wants to spend 100%.
        config.risk.portfolio_risk_limit = Some(0.1);
        let (coordinator, venue) = coordinator_with(
            config,
            Arc::new(|_: &str| -> Box<dyn Strategy> {
                Box::new(AlwaysBuyStrategy { fraction: 1.0 })
            }),
        );

        coordinator
            .update(&bundle(&[("BTC/USDT", 60_000, 100.0)]))
            .await;

        assert_eq!(venue.executed_count(), 0, "oversized signal must be pruned");
    }

    #[tokio::test]
    async fn signals_within_limit_are_dispatched() {
        let mut config = base_config(&["BTC/USDT"], 10_000.0);
        config.risk.portfolio_risk_limit = Some(0.5);
        let (coordinator, venue) = coordinator_with(
            config,
            Arc::new(|_: &str| -> Box<dyn Strategy> {
                Box::new(AlwaysBuyStrategy { fraction: 0.2 })
            }),
        );

        coordinator
            .update(&bundle(&[("BTC/USDT", 60_000, 100.0)]))
            .await;

        assert_eq!(venue.executed_count(), 1);
    }

    #[tokio::test]
    async fn backtest_run_produces_history_and_result() {
        let (coordinator, _venue) = coordinator_with(
            base_config(&["BTC/USDT", "ETH/USDT"], 10_000.0),
            silent_factory(),
        );

        let ticks = vec![
            bundle(&[("BTC/USDT", 60_000, 100.0), ("ETH/USDT", 60_000, 50.0)]),
            bundle(&[("BTC/USDT", 120_000, 101.0), ("ETH/USDT", 120_000, 51.0)]),
            bundle(&[("BTC/USDT", 180_000, 102.0), ("ETH/USDT", 180_000, 49.0)]),
        ];
        let result = coordinator.run(&ticks).await;

        assert_eq!(result.equity_history.len(), 3);
        assert!((result.initial_capital - 10_000.0).abs() < 1e-9);
        assert!((result.final_equity - 10_000.0).abs() < 1e-9);
        assert_eq!(result.per_symbol_equity.len(), 2);
    }

    #[tokio::test]
    async fn correlation_matrix_diagonal_after_updates() {
        let (coordinator, _venue) = coordinator_with(
            base_config(&["BTC/USDT", "ETH/USDT"], 10_000.0),
            silent_factory(),
        );

        for i in 1..=5i64 {
            coordinator
                .update(&bundle(&[
                    ("BTC/USDT", i * 60_000, 100.0 + i as f64),
                    ("ETH/USDT", i * 60_000, 50.0 + (i as f64) * 0.5),
                ]))
                .await;
        }

        let matrix = coordinator.get_correlation_matrix();
        assert_eq!(matrix["BTC/USDT"]["BTC/USDT"], 1.0);
        assert_eq!(matrix["ETH/USDT"]["ETH/USDT"], 1.0);
    }

    #[tokio::test]
    async fn mode_change_propagates_to_engines() {
        let (coordinator, _venue) = coordinator_with(
            base_config(&["BTC/USDT", "ETH/USDT"], 10_000.0),
            silent_factory(),
        );
        coordinator.initialize();
        coordinator.set_system_mode(SystemMode::Emergency);

        for symbol in ["BTC/USDT", "ETH/USDT"] {
            assert_eq!(
                coordinator.engine(symbol).unwrap().system_mode(),
                SystemMode::Emergency
            );
        }
    }

    #[tokio::test]
    async fn unknown_symbol_in_bundle_is_skipped() {
        let (coordinator, _venue) = coordinator_with(
            base_config(&["BTC/USDT"], 10_000.0),
            silent_factory(),
        );

        coordinator
            .update(&bundle(&[
                ("BTC/USDT", 60_000, 100.0),
                ("DOGE/USDT", 60_000, 0.1),
            ]))
            .await;

        let history = coordinator.get_equity_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].per_symbol.len(), 1);
    }
}
