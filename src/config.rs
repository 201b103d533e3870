// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian execution plane. Every tunable
// lives here and is passed into component constructors as an immutable value;
// there is no global parameter service.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::allocation::AllocationStrategyKind;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTC/USDT".to_string(),
        "ETH/USDT".to_string(),
        "SOL/USDT".to_string(),
    ]
}

fn default_max_risk_per_trade() -> f64 {
    0.01
}

fn default_atr_percentage() -> f64 {
    0.02
}

fn default_min_stop_distance_percentage() -> f64 {
    0.01
}

fn default_risk_reduction_factor() -> f64 {
    0.5
}

fn default_timeframe_hours() -> f64 {
    1.0
}

fn default_initial_capital() -> f64 {
    10_000.0
}

fn default_max_retries() -> u32 {
    7
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    64_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_symbol_info_ttl_ms() -> i64 {
    3_600_000
}

fn default_correlation_window() -> usize {
    20
}

fn default_update_budget_ms() -> u64 {
    30_000
}

fn default_allocation_rounding() -> u32 {
    2
}

// =============================================================================
// Sections
// =============================================================================

/// Portfolio / per-trade risk knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of account balance risked per trade.
    #[serde(default = "default_max_risk_per_trade")]
    pub max_risk_per_trade: f64,

    /// Fallback ATR expressed as a fraction of price when a strategy does
    /// not supply a stop distance.
    #[serde(default = "default_atr_percentage")]
    pub default_atr_percentage: f64,

    /// Floor for stop distance as a fraction of current price. Stops closer
    /// than this are widened before sizing.
    #[serde(default = "default_min_stop_distance_percentage")]
    pub min_stop_distance_percentage: f64,

    /// Amount multiplier applied in RiskReduction mode.
    #[serde(default = "default_risk_reduction_factor")]
    pub risk_reduction_factor: f64,

    /// Upper bound on |Σ position value| / portfolio equity. None disables
    /// the portfolio-level signal filter.
    #[serde(default)]
    pub portfolio_risk_limit: Option<f64>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_risk_per_trade: default_max_risk_per_trade(),
            default_atr_percentage: default_atr_percentage(),
            min_stop_distance_percentage: default_min_stop_distance_percentage(),
            risk_reduction_factor: default_risk_reduction_factor(),
            portfolio_risk_limit: None,
        }
    }
}

/// Multi-venue allocation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationSection {
    #[serde(default)]
    pub strategy: AllocationStrategyKind,

    /// Per-venue weights for the WEIGHTED strategy.
    #[serde(default)]
    pub weights: HashMap<String, f64>,

    /// Per-venue ratios in [0, 1] for the CUSTOM strategy.
    #[serde(default)]
    pub custom_ratios: HashMap<String, f64>,

    /// Decimal places used when rounding WEIGHTED shares.
    #[serde(default = "default_allocation_rounding")]
    pub rounding_decimals: u32,
}

impl Default for AllocationSection {
    fn default() -> Self {
        Self {
            strategy: AllocationStrategyKind::default(),
            weights: HashMap::new(),
            custom_ratios: HashMap::new(),
            rounding_decimals: default_allocation_rounding(),
        }
    }
}

/// Venue gateway retry schedule. One schedule for every venue; no other
/// layer retries on top of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max: default_max_retries(),
            initial_ms: default_initial_backoff_ms(),
            max_ms: default_max_backoff_ms(),
            factor: default_backoff_factor(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Symbols the coordinator trades.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Candle timeframe in hours.
    #[serde(default = "default_timeframe_hours")]
    pub timeframe_hours: f64,

    /// Portfolio capital allocated across symbol engines at initialize.
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,

    /// Optional per-symbol capital weights (CUSTOM capital allocation).
    /// Empty map means EQUAL split.
    #[serde(default)]
    pub capital_weights: HashMap<String, f64>,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub allocation: AllocationSection,

    /// Venue retry schedule (`venue.retries.*`).
    #[serde(default)]
    pub venue_retries: RetryConfig,

    /// Symbol-info cache TTL in milliseconds.
    #[serde(default = "default_symbol_info_ttl_ms")]
    pub symbol_info_ttl_ms: i64,

    /// Rolling window length for the correlation matrix.
    #[serde(default = "default_correlation_window")]
    pub correlation_window: usize,

    /// Overall time budget for one coordinator update tick.
    #[serde(default = "default_update_budget_ms")]
    pub update_budget_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            timeframe_hours: default_timeframe_hours(),
            initial_capital: default_initial_capital(),
            capital_weights: HashMap::new(),
            risk: RiskConfig::default(),
            allocation: AllocationSection::default(),
            venue_retries: RetryConfig::default(),
            symbol_info_ttl_ms: default_symbol_info_ttl_ms(),
            correlation_window: default_correlation_window(),
            update_budget_ms: default_update_budget_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            initial_capital = config.initial_capital,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols.len(), 3);
        assert!((cfg.risk.max_risk_per_trade - 0.01).abs() < f64::EPSILON);
        assert!((cfg.risk.default_atr_percentage - 0.02).abs() < f64::EPSILON);
        assert!((cfg.risk.min_stop_distance_percentage - 0.01).abs() < f64::EPSILON);
        assert_eq!(cfg.venue_retries.max, 7);
        assert_eq!(cfg.venue_retries.initial_ms, 1_000);
        assert_eq!(cfg.venue_retries.max_ms, 64_000);
        assert!((cfg.venue_retries.factor - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.symbol_info_ttl_ms, 3_600_000);
        assert_eq!(cfg.correlation_window, 20);
        assert_eq!(cfg.allocation.rounding_decimals, 2);
        assert!(cfg.risk.portfolio_risk_limit.is_none());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.venue_retries.max, 7);
        assert_eq!(cfg.symbol_info_ttl_ms, 3_600_000);
        assert!((cfg.initial_capital - 10_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "symbols": ["ETH/USDT"],
            "risk": { "max_risk_per_trade": 0.02 },
            "venue_retries": { "max": 3 }
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETH/USDT"]);
        assert!((cfg.risk.max_risk_per_trade - 0.02).abs() < f64::EPSILON);
        // Sibling fields inside a partial section still default.
        assert!((cfg.risk.default_atr_percentage - 0.02).abs() < f64::EPSILON);
        assert_eq!(cfg.venue_retries.max, 3);
        assert_eq!(cfg.venue_retries.initial_ms, 1_000);
    }

    #[test]
    fn roundtrip_serialisation() {
        let mut cfg = RuntimeConfig::default();
        cfg.capital_weights.insert("BTC/USDT".into(), 2.0);
        cfg.risk.portfolio_risk_limit = Some(0.8);
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg2.capital_weights.get("BTC/USDT"), Some(&2.0));
        assert_eq!(cfg2.risk.portfolio_risk_limit, Some(0.8));
    }
}
