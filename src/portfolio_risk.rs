// =============================================================================
// Portfolio Risk — rolling correlations, parametric VaR, stress tests
// =============================================================================
//
// Per-symbol log returns live in a bounded ring (default 20 samples) with
// incrementally maintained sum / sum-of-squares accumulators; pairwise
// cross-products are computed over the aligned tails on demand. The
// correlation diagonal is exactly 1.0; symbols with fewer than two samples
// report 0.0 against everything.
//
// VaR is parametric 1-day 95%: sqrt(w' C w) * 1.645 with w the per-symbol
// position values and C built from per-symbol volatilities and the rolling
// correlation matrix.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One-sided 95% quantile of the standard normal distribution.
const VAR_95_Z: f64 = 1.645;

// ---------------------------------------------------------------------------
// Per-symbol return window
// ---------------------------------------------------------------------------

struct ReturnWindow {
    returns: VecDeque<f64>,
    capacity: usize,
    last_price: Option<f64>,
    /// Incremental accumulators over the ring contents.
    sum: f64,
    sum_sq: f64,
}

impl ReturnWindow {
    fn new(capacity: usize) -> Self {
        Self {
            returns: VecDeque::with_capacity(capacity),
            capacity,
            last_price: None,
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    /// Record a new price; pushes ln(p / p_prev) once a previous price
    /// exists.
    fn observe(&mut self, price: f64) {
        if price <= 0.0 {
            return;
        }
        if let Some(prev) = self.last_price {
            let ret = (price / prev).ln();
            if ret.is_finite() {
                if self.returns.len() == self.capacity {
                    if let Some(evicted) = self.returns.pop_front() {
                        self.sum -= evicted;
                        self.sum_sq -= evicted * evicted;
                    }
                }
                self.returns.push_back(ret);
                self.sum += ret;
                self.sum_sq += ret * ret;
            }
        }
        self.last_price = Some(price);
    }

    fn len(&self) -> usize {
        self.returns.len()
    }

    fn mean(&self) -> f64 {
        if self.returns.is_empty() {
            0.0
        } else {
            self.sum / self.returns.len() as f64
        }
    }

    /// Population standard deviation of the windowed returns.
    fn volatility(&self) -> f64 {
        let n = self.returns.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = (self.sum_sq / n as f64) - mean * mean;
        variance.max(0.0).sqrt()
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Report produced by [`PortfolioRiskTracker::analyze`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskReport {
    /// Parametric 1-day 95% VaR in quote currency.
    pub value_at_risk: f64,
    /// max(|position value|) / portfolio equity.
    pub concentration_risk: f64,
    pub stress_test_results: Vec<StressTestResult>,
}

/// A named vector of fractional price shocks per symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressScenario {
    pub name: String,
    /// symbol -> fractional shock (e.g. -0.2 for a 20% drop).
    pub shocks: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressTestResult {
    pub scenario: String,
    /// Linear portfolio P&L under the scenario, in quote currency.
    pub portfolio_impact: f64,
}

/// Rolling per-symbol return windows plus portfolio risk analytics.
pub struct PortfolioRiskTracker {
    windows: RwLock<HashMap<String, ReturnWindow>>,
    window_len: usize,
    scenarios: Vec<StressScenario>,
}

impl PortfolioRiskTracker {
    pub fn new(window_len: usize, scenarios: Vec<StressScenario>) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            window_len,
            scenarios,
        }
    }

    /// Feed one symbol's latest price.
    pub fn observe_price(&self, symbol: &str, price: f64) {
        let mut windows = self.windows.write();
        windows
            .entry(symbol.to_string())
            .or_insert_with(|| ReturnWindow::new(self.window_len))
            .observe(price);
    }

    /// Annualisation-free volatility of one symbol's windowed returns.
    pub fn volatility(&self, symbol: &str) -> f64 {
        self.windows
            .read()
            .get(symbol)
            .map_or(0.0, ReturnWindow::volatility)
    }

    // -------------------------------------------------------------------------
    // Correlation
    // -------------------------------------------------------------------------

    /// Pairwise Pearson correlation over the aligned tails of each pair's
    /// return windows. Diagonal is exactly 1.0 for any observed symbol;
    /// pairs with fewer than two aligned samples report 0.0.
    pub fn correlation_matrix(&self) -> HashMap<String, HashMap<String, f64>> {
        let windows = self.windows.read();
        let symbols: Vec<&String> = windows.keys().collect();

        let mut matrix: HashMap<String, HashMap<String, f64>> = HashMap::new();
        for &a in &symbols {
            let mut row = HashMap::new();
            for &b in &symbols {
                let corr = if a == b {
                    1.0
                } else {
                    pearson(&windows[a], &windows[b])
                };
                row.insert(b.clone(), corr);
            }
            matrix.insert(a.clone(), row);
        }
        matrix
    }

    // -------------------------------------------------------------------------
    // Risk analysis
    // -------------------------------------------------------------------------

    /// Compute VaR, concentration, and stress results for the given
    /// per-symbol position values (quote currency, sign = direction).
    pub fn analyze(&self, position_values: &HashMap<String, f64>, equity: f64) -> RiskReport {
        let value_at_risk = self.parametric_var(position_values);

        let concentration_risk = if equity > 0.0 {
            position_values
                .values()
                .map(|v| v.abs() / equity)
                .fold(0.0, f64::max)
        } else {
            0.0
        };

        let stress_test_results = self
            .scenarios
            .iter()
            .map(|scenario| {
                let portfolio_impact = position_values
                    .iter()
                    .map(|(symbol, value)| {
                        value * scenario.shocks.get(symbol).copied().unwrap_or(0.0)
                    })
                    .sum();
                StressTestResult {
                    scenario: scenario.name.clone(),
                    portfolio_impact,
                }
            })
            .collect();

        debug!(
            value_at_risk,
            concentration_risk, "portfolio risk analysis computed"
        );

        RiskReport {
            value_at_risk,
            concentration_risk,
            stress_test_results,
        }
    }

    /// sqrt(w' C w) * z95 with C_ij = vol_i * vol_j * corr_ij.
    fn parametric_var(&self, position_values: &HashMap<String, f64>) -> f64 {
        let correlations = self.correlation_matrix();

        let mut variance = 0.0;
        for (sym_a, value_a) in position_values {
            let vol_a = self.volatility(sym_a);
            for (sym_b, value_b) in position_values {
                let vol_b = self.volatility(sym_b);
                let corr = if sym_a == sym_b {
                    1.0
                } else {
                    correlations
                        .get(sym_a)
                        .and_then(|row| row.get(sym_b))
                        .copied()
                        .unwrap_or(0.0)
                };
                variance += value_a * value_b * vol_a * vol_b * corr;
            }
        }

        variance.max(0.0).sqrt() * VAR_95_Z
    }
}

/// Pearson correlation over the aligned tails of two return windows.
fn pearson(a: &ReturnWindow, b: &ReturnWindow) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }

    let tail_a: Vec<f64> = a.returns.iter().skip(a.len() - n).copied().collect();
    let tail_b: Vec<f64> = b.returns.iter().skip(b.len() - n).copied().collect();

    let n_f = n as f64;
    let mean_a = tail_a.iter().sum::<f64>() / n_f;
    let mean_b = tail_b.iter().sum::<f64>() / n_f;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = tail_a[i] - mean_a;
        let db = tail_b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    let denom = (var_a * var_b).sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    (cov / denom).clamp(-1.0, 1.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PortfolioRiskTracker {
        PortfolioRiskTracker::new(20, Vec::new())
    }

    fn feed(tracker: &PortfolioRiskTracker, symbol: &str, prices: &[f64]) {
        for &p in prices {
            tracker.observe_price(symbol, p);
        }
    }

    #[test]
    fn diagonal_is_exactly_one() {
        let t = tracker();
        feed(&t, "BTC/USDT", &[100.0, 101.0, 99.0, 102.0, 103.0]);
        feed(&t, "ETH/USDT", &[50.0, 50.5, 49.0, 51.0, 52.0]);

        let matrix = t.correlation_matrix();
        assert_eq!(matrix["BTC/USDT"]["BTC/USDT"], 1.0);
        assert_eq!(matrix["ETH/USDT"]["ETH/USDT"], 1.0);
    }

    #[test]
    fn identical_series_are_perfectly_correlated() {
        let t = tracker();
        let prices = [100.0, 102.0, 101.0, 104.0, 103.0, 107.0];
        feed(&t, "A", &prices);
        let doubled: Vec<f64> = prices.iter().map(|p| p * 2.0).collect();
        feed(&t, "B", &doubled);

        let matrix = t.correlation_matrix();
        assert!((matrix["A"]["B"] - 1.0).abs() < 1e-9);
        assert!((matrix["B"]["A"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn inverse_series_are_anticorrelated() {
        let t = tracker();
        feed(&t, "A", &[100.0, 110.0, 100.0, 110.0, 100.0]);
        feed(&t, "B", &[100.0, 90.909, 100.0, 90.909, 100.0]);

        let matrix = t.correlation_matrix();
        assert!(matrix["A"]["B"] < -0.99);
    }

    #[test]
    fn insufficient_samples_report_zero() {
        let t = tracker();
        feed(&t, "A", &[100.0, 101.0, 102.0, 103.0]);
        feed(&t, "B", &[50.0]); // no return yet

        let matrix = t.correlation_matrix();
        assert_eq!(matrix["A"]["B"], 0.0);
    }

    #[test]
    fn window_is_bounded() {
        let t = PortfolioRiskTracker::new(5, Vec::new());
        let prices: Vec<f64> = (1..=50).map(|i| 100.0 + i as f64).collect();
        feed(&t, "A", &prices);

        let windows = t.windows.read();
        assert_eq!(windows["A"].len(), 5);
    }

    #[test]
    fn incremental_volatility_matches_direct_computation() {
        let t = PortfolioRiskTracker::new(4, Vec::new());
        // More prices than the window so eviction is exercised.
        feed(&t, "A", &[100.0, 104.0, 98.0, 105.0, 101.0, 108.0, 104.0]);

        let windows = t.windows.read();
        let window = &windows["A"];
        let tail: Vec<f64> = window.returns.iter().copied().collect();
        let mean = tail.iter().sum::<f64>() / tail.len() as f64;
        let direct =
            (tail.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / tail.len() as f64).sqrt();
        drop(windows);

        assert!((t.volatility("A") - direct).abs() < 1e-12);
    }

    #[test]
    fn var_grows_with_position_size() {
        let t = tracker();
        feed(&t, "A", &[100.0, 103.0, 99.0, 104.0, 101.0, 105.0]);

        let small: HashMap<String, f64> = [("A".to_string(), 1_000.0)].into();
        let large: HashMap<String, f64> = [("A".to_string(), 10_000.0)].into();

        let var_small = t.analyze(&small, 100_000.0).value_at_risk;
        let var_large = t.analyze(&large, 100_000.0).value_at_risk;
        assert!(var_small > 0.0);
        assert!((var_large / var_small - 10.0).abs() < 1e-6);
    }

    #[test]
    fn concentration_is_largest_position_share() {
        let t = tracker();
        let positions: HashMap<String, f64> =
            [("A".to_string(), 2_000.0), ("B".to_string(), -5_000.0)].into();

        let report = t.analyze(&positions, 10_000.0);
        assert!((report.concentration_risk - 0.5).abs() < 1e-12);
    }

    #[test]
    fn stress_scenarios_apply_linearly() {
        let scenario = StressScenario {
            name: "crypto winter".into(),
            shocks: [("A".to_string(), -0.3), ("B".to_string(), -0.1)].into(),
        };
        let t = PortfolioRiskTracker::new(20, vec![scenario]);

        let positions: HashMap<String, f64> =
            [("A".to_string(), 10_000.0), ("B".to_string(), 5_000.0)].into();
        let report = t.analyze(&positions, 20_000.0);

        assert_eq!(report.stress_test_results.len(), 1);
        let impact = report.stress_test_results[0].portfolio_impact;
        assert!((impact - (-3_000.0 - 500.0)).abs() < 1e-9);
    }
}
