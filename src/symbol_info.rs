// =============================================================================
// Symbol Info Cache — TTL-gated venue metadata with single-flight fetches
// =============================================================================
//
// Entries are cached per symbol for one venue and replaced atomically; they
// are never mutated in place. Concurrent callers for the same symbol share
// one in-flight venue fetch: the first caller holds the per-symbol guard
// while fetching, later callers wait on it and then read the fresh entry.
// A failed fetch stores nothing, so the next caller retries.
//
// Venue-specific filter structures (Binance PRICE_FILTER / LOT_SIZE /
// NOTIONAL) are normalised into the unified `SymbolInfo` before storage.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::metrics::MetricsRegistry;
use crate::types::{now_ms, SymbolInfo};
use crate::venue::gateway::VenueGateway;

/// Options for a single cache lookup.
#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    /// Entry validity window in milliseconds.
    pub ttl_ms: i64,
    /// Bypass the cache and refetch unconditionally.
    pub force_refresh: bool,
}

impl CacheOptions {
    pub fn with_ttl(ttl_ms: i64) -> Self {
        Self {
            ttl_ms,
            force_refresh: false,
        }
    }
}

/// TTL cache of per-venue symbol metadata.
pub struct SymbolInfoCache {
    venue: Arc<dyn VenueGateway>,
    default_ttl_ms: i64,
    entries: RwLock<HashMap<String, SymbolInfo>>,
    /// Per-symbol fetch guards implementing single-flight deduplication.
    flights: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    metrics: Arc<MetricsRegistry>,
}

impl SymbolInfoCache {
    pub fn new(
        venue: Arc<dyn VenueGateway>,
        default_ttl_ms: i64,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            venue,
            default_ttl_ms,
            entries: RwLock::new(HashMap::new()),
            flights: AsyncMutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Default options using the configured TTL.
    pub fn default_options(&self) -> CacheOptions {
        CacheOptions::with_ttl(self.default_ttl_ms)
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    /// Return cached info when fresh, otherwise fetch from the venue.
    pub async fn get_symbol_info(
        &self,
        symbol: &str,
        options: CacheOptions,
    ) -> Result<SymbolInfo, EngineError> {
        if !options.force_refresh {
            if let Some(info) = self.fresh_entry(symbol, options.ttl_ms) {
                self.metrics.record_cache_hit();
                return Ok(info);
            }
        }
        self.metrics.record_cache_miss();

        // Single-flight: one guard per symbol. Waiters re-check the cache
        // after the leader finishes.
        let guard = {
            let mut flights = self.flights.lock().await;
            flights
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let _flight = guard.lock().await;

        if !options.force_refresh {
            if let Some(info) = self.fresh_entry(symbol, options.ttl_ms) {
                debug!(symbol, "symbol info refreshed by concurrent flight");
                return Ok(info);
            }
        }

        let raw = self
            .venue
            .get_market_info(symbol)
            .await
            .map_err(|e| EngineError::SymbolInfoFetchFailed {
                symbol: symbol.to_string(),
                reason: e.to_string(),
            })?;

        let info = normalize_market_info(symbol, raw)?;
        self.entries.write().insert(symbol.to_string(), info.clone());
        debug!(
            venue = self.venue.venue_id(),
            symbol,
            min_amount = info.min_amount,
            tick_size = ?info.tick_size,
            "symbol info fetched and cached"
        );
        Ok(info)
    }

    /// Fetch several symbols in parallel. Failed symbols are logged and
    /// omitted from the result; sibling fetches are never cancelled.
    pub async fn get_multiple(
        &self,
        symbols: &[String],
        options: CacheOptions,
    ) -> HashMap<String, SymbolInfo> {
        let fetches = symbols
            .iter()
            .map(|s| async move { (s.clone(), self.get_symbol_info(s, options).await) });

        let mut result = HashMap::new();
        for (symbol, outcome) in join_all(fetches).await {
            match outcome {
                Ok(info) => {
                    result.insert(symbol, info);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "symbol info fetch failed — omitting");
                }
            }
        }
        result
    }

    // -------------------------------------------------------------------------
    // Invalidation
    // -------------------------------------------------------------------------

    /// Drop one symbol's entry, or the whole cache when `symbol` is `None`.
    pub fn clear_cache(&self, symbol: Option<&str>) {
        let mut entries = self.entries.write();
        match symbol {
            Some(s) => {
                entries.remove(s);
                debug!(symbol = s, "symbol info entry cleared");
            }
            None => {
                entries.clear();
                debug!("symbol info cache cleared");
            }
        }
    }

    /// Force-refresh the given symbols (or every cached symbol), optionally
    /// overriding the TTL recorded for the refreshed entries.
    pub async fn refresh_cache(
        &self,
        symbols: Option<&[String]>,
        ttl_ms: Option<i64>,
    ) -> HashMap<String, SymbolInfo> {
        let targets: Vec<String> = match symbols {
            Some(list) => list.to_vec(),
            None => self.entries.read().keys().cloned().collect(),
        };
        let options = CacheOptions {
            ttl_ms: ttl_ms.unwrap_or(self.default_ttl_ms),
            force_refresh: true,
        };
        self.get_multiple(&targets, options).await
    }

    fn fresh_entry(&self, symbol: &str, ttl_ms: i64) -> Option<SymbolInfo> {
        let entries = self.entries.read();
        let info = entries.get(symbol)?;
        (now_ms() - info.fetch_timestamp < ttl_ms).then(|| info.clone())
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Count the decimal places of a filter increment (e.g. 0.001 -> 3).
fn decimals_of(value: f64) -> u32 {
    let formatted = format!("{value:.8}");
    let trimmed = formatted.trim_end_matches('0');
    match trimmed.split_once('.') {
        Some((_, frac)) => frac.len() as u32,
        None => 0,
    }
}

fn parse_f64(value: &serde_json::Value) -> Option<f64> {
    if let Some(s) = value.as_str() {
        s.parse().ok()
    } else {
        value.as_f64()
    }
}

/// Normalise a raw venue market-info payload into the unified shape.
///
/// Understands Binance-style `filters` arrays and flat generic fields; the
/// raw payload is retained for diagnostics.
pub fn normalize_market_info(
    symbol: &str,
    raw: serde_json::Value,
) -> Result<SymbolInfo, EngineError> {
    let base = raw["baseAsset"]
        .as_str()
        .or_else(|| raw["base"].as_str())
        .unwrap_or_else(|| symbol.split('/').next().unwrap_or(symbol))
        .to_string();
    let quote = raw["quoteAsset"]
        .as_str()
        .or_else(|| raw["quote"].as_str())
        .unwrap_or_else(|| symbol.split('/').nth(1).unwrap_or(""))
        .to_string();

    let active = match raw["status"].as_str() {
        Some(status) => status.eq_ignore_ascii_case("TRADING"),
        None => raw["active"].as_bool().unwrap_or(true),
    };

    // Flat fields first; Binance-style filters override below.
    let mut min_price = parse_f64(&raw["minPrice"]);
    let mut max_price = parse_f64(&raw["maxPrice"]);
    let mut tick_size = parse_f64(&raw["tickSize"]);
    let mut min_amount = parse_f64(&raw["minAmount"]);
    let mut max_amount = parse_f64(&raw["maxAmount"]);
    let mut step_size = parse_f64(&raw["stepSize"]);
    let mut min_cost = parse_f64(&raw["minCost"]);

    if let Some(filters) = raw["filters"].as_array() {
        for filter in filters {
            match filter["filterType"].as_str().unwrap_or("") {
                "PRICE_FILTER" => {
                    min_price = parse_f64(&filter["minPrice"]).or(min_price);
                    max_price = parse_f64(&filter["maxPrice"]).or(max_price);
                    tick_size = parse_f64(&filter["tickSize"]).or(tick_size);
                }
                "LOT_SIZE" => {
                    min_amount = parse_f64(&filter["minQty"]).or(min_amount);
                    max_amount = parse_f64(&filter["maxQty"]).or(max_amount);
                    step_size = parse_f64(&filter["stepSize"]).or(step_size);
                }
                "MIN_NOTIONAL" | "NOTIONAL" => {
                    min_cost = parse_f64(&filter["minNotional"]).or(min_cost);
                }
                _ => {}
            }
        }
    }

    let price_precision = raw["pricePrecision"]
        .as_u64()
        .map(|p| p as u32)
        .or_else(|| tick_size.filter(|t| *t > 0.0).map(decimals_of))
        .unwrap_or(8);
    let amount_precision = raw["amountPrecision"]
        .as_u64()
        .map(|p| p as u32)
        .or_else(|| step_size.filter(|s| *s > 0.0).map(decimals_of))
        .or_else(|| raw["baseAssetPrecision"].as_u64().map(|p| p as u32))
        .unwrap_or(8);

    Ok(SymbolInfo {
        symbol: symbol.to_string(),
        base,
        quote,
        active,
        price_precision,
        amount_precision,
        cost_precision: raw["costPrecision"].as_u64().map(|p| p as u32),
        min_price,
        max_price,
        min_amount: min_amount.unwrap_or(0.0),
        max_amount,
        min_cost,
        tick_size,
        step_size,
        maker_fee: parse_f64(&raw["makerFee"]),
        taker_fee: parse_f64(&raw["takerFee"]),
        fetch_timestamp: now_ms(),
        raw,
    })
}
