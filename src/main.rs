// =============================================================================
// Meridian Execution Nexus — Main Entry Point
// =============================================================================
//
// Startup order: env + tracing, runtime config (fallback to defaults with a
// warning), venue gateways from env credentials, unified order manager,
// multi-symbol coordinator. Two background loops run alongside the candle
// loop: order reconciliation + OMS snapshots, and a periodic metrics log.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod allocation;
mod config;
mod coordinator;
mod engine;
mod errors;
mod indicators;
mod market_data;
mod metrics;
mod oms;
mod portfolio_risk;
mod sizing;
mod strategy;
mod symbol_info;
mod types;
mod unified;
mod venue;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::allocation::AllocationConfig;
use crate::config::RuntimeConfig;
use crate::coordinator::MultiSymbolCoordinator;
use crate::market_data::CandleBundle;
use crate::metrics::MetricsRegistry;
use crate::oms::Oms;
use crate::portfolio_risk::StressScenario;
use crate::sizing::OrderSizing;
use crate::strategy::{EmaCrossStrategy, Strategy};
use crate::symbol_info::SymbolInfoCache;
use crate::unified::UnifiedOrderManager;
use crate::venue::gateway::VenueGateway;
use crate::venue::{HttpVenueGateway, ReqwestTransport, RetryPolicy, VenueKind};

/// Interval between reconciliation passes.
const SYNC_INTERVAL: Duration = Duration::from_secs(30);
/// Interval between metrics log lines.
const METRICS_INTERVAL: Duration = Duration::from_secs(300);
/// Per-call deadline handed to every venue gateway.
const GATEWAY_DEADLINE: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian Execution Nexus starting up");

    let mut runtime_config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    if let Ok(symbols) = std::env::var("MERIDIAN_SYMBOLS") {
        runtime_config.symbols = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    info!(symbols = ?runtime_config.symbols, "configured trading pairs");

    // ── 2. Venue gateways & unified order manager ────────────────────────
    let metrics = Arc::new(MetricsRegistry::new());
    let uom = Arc::new(UnifiedOrderManager::new(metrics.clone()));

    let venue_ids: Vec<String> = std::env::var("MERIDIAN_VENUES")
        .unwrap_or_else(|_| "binance".to_string())
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();

    let retry_policy = RetryPolicy::from_config(&runtime_config.venue_retries);
    let mut primary_gateway: Option<Arc<HttpVenueGateway>> = None;

    for (index, venue_id) in venue_ids.iter().enumerate() {
        let gateway = Arc::new(build_gateway(
            venue_id,
            retry_policy.clone(),
            metrics.clone(),
        ));

        match gateway.initialize().await {
            Ok(true) => info!(venue = %venue_id, "venue reachable"),
            Ok(false) => warn!(venue = %venue_id, "venue ping failed — registering anyway"),
            Err(e) => warn!(venue = %venue_id, error = %e, "venue initialisation error"),
        }

        if primary_gateway.is_none() {
            primary_gateway = Some(gateway.clone());
        }
        uom.add_venue_with_priority(venue_id, gateway, (index + 1) as i32);
    }

    let Some(primary_gateway) = primary_gateway else {
        anyhow::bail!("no venues configured — set MERIDIAN_VENUES");
    };

    // Crash recovery: pick up any persisted OMS state from a prior run.
    for venue_id in &venue_ids {
        let path = format!("meridian_state_{venue_id}.json");
        if let (Some(oms), Ok(snapshot)) = (uom.oms(venue_id), Oms::load_snapshot(&path)) {
            info!(venue = %venue_id, "restoring OMS state from snapshot");
            oms.restore(snapshot);
        }
    }

    let allocation = AllocationConfig {
        strategy: runtime_config.allocation.strategy,
        weights: runtime_config.allocation.weights.clone(),
        custom_ratios: runtime_config.allocation.custom_ratios.clone(),
        rounding_decimals: runtime_config.allocation.rounding_decimals,
    };
    if let Err(e) = uom.set_allocation_strategy(allocation) {
        error!(error = %e, "allocation config invalid — keeping PRIORITY default");
    }

    // ── 3. Sizing service & coordinator ──────────────────────────────────
    let symbol_info_cache = Arc::new(SymbolInfoCache::new(
        primary_gateway.clone(),
        runtime_config.symbol_info_ttl_ms,
        metrics.clone(),
    ));
    let warmed = symbol_info_cache
        .get_multiple(&runtime_config.symbols, symbol_info_cache.default_options())
        .await;
    info!(symbols = warmed.len(), "symbol info cache warmed");

    let sizing = Arc::new(OrderSizing::new(
        symbol_info_cache,
        primary_gateway.clone(),
        runtime_config.risk.clone(),
    ));

    let stress_scenarios = default_stress_scenarios(&runtime_config.symbols);
    let coordinator = Arc::new(MultiSymbolCoordinator::new(
        runtime_config.clone(),
        uom.clone(),
        Arc::new(|_symbol: &str| -> Box<dyn Strategy> {
            Box::new(EmaCrossStrategy::default())
        }),
        Some(sizing),
        stress_scenarios,
    ));
    coordinator.initialize();

    // ── 4. Background loops ──────────────────────────────────────────────
    {
        let uom = uom.clone();
        let venue_ids = venue_ids.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SYNC_INTERVAL).await;
                uom.sync_all_orders().await;
                for venue_id in &venue_ids {
                    if let Some(oms) = uom.oms(venue_id) {
                        let path = format!("meridian_state_{venue_id}.json");
                        if let Err(e) = oms.save_snapshot(&path) {
                            warn!(venue = %venue_id, error = %e, "snapshot save failed");
                        }
                    }
                }
            }
        });
    }

    {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(METRICS_INTERVAL).await;
                let snapshot = metrics.snapshot();
                info!(
                    cache_hit_ratio = snapshot.cache_hit_ratio(),
                    drift_events = snapshot.reconcile_drift_events,
                    venues = snapshot.venues.len(),
                    "operational metrics"
                );
            }
        });
    }

    // ── 5. Candle loop ───────────────────────────────────────────────────
    let timeframe = timeframe_label(runtime_config.timeframe_hours);
    let tick_interval = Duration::from_secs_f64(
        (runtime_config.timeframe_hours * 3600.0).max(60.0),
    );
    info!(timeframe = %timeframe, "entering candle loop");

    let mut ticker = tokio::time::interval(tick_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let bundle = fetch_bundle(
                    primary_gateway.as_ref(),
                    &runtime_config.symbols,
                    &timeframe,
                )
                .await;
                if bundle.is_empty() {
                    warn!("no candles fetched this tick");
                    continue;
                }
                coordinator.update(&bundle).await;
                info!(
                    equity = coordinator.get_portfolio_equity(),
                    "tick processed"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    for venue_id in &venue_ids {
        if let Some(oms) = uom.oms(venue_id) {
            let path = format!("meridian_state_{venue_id}.json");
            if let Err(e) = oms.save_snapshot(&path) {
                warn!(venue = %venue_id, error = %e, "final snapshot save failed");
            }
        }
    }
    info!("Meridian shut down cleanly");
    Ok(())
}

// ---------------------------------------------------------------------------
// Wiring helpers
// ---------------------------------------------------------------------------

/// Build one HTTP gateway from env credentials.
fn build_gateway(
    venue_id: &str,
    policy: RetryPolicy,
    metrics: Arc<MetricsRegistry>,
) -> HttpVenueGateway {
    let upper = venue_id.to_uppercase();
    let api_key = std::env::var(format!("{upper}_API_KEY")).unwrap_or_default();
    let secret = std::env::var(format!("{upper}_API_SECRET")).unwrap_or_default();

    let kind = VenueKind::from_id(venue_id);
    let base_url = std::env::var(format!("{upper}_BASE_URL")).unwrap_or_else(|_| {
        match kind {
            VenueKind::Binance => "https://api.binance.com",
            VenueKind::Bitget => "https://api.bitget.com",
            VenueKind::Bybit => "https://api.bybit.com",
            VenueKind::Generic => "https://api.example.com",
        }
        .to_string()
    });

    let key_header = match kind {
        VenueKind::Binance => "X-MBX-APIKEY",
        VenueKind::Bitget => "ACCESS-KEY",
        VenueKind::Bybit => "X-BAPI-API-KEY",
        VenueKind::Generic => "X-API-KEY",
    };
    let transport = Arc::new(ReqwestTransport::new(Some((key_header, api_key.as_str()))));

    HttpVenueGateway::new(venue_id, base_url, secret, transport, policy, metrics)
        .with_deadline(GATEWAY_DEADLINE)
}

/// Fetch the latest closed candle for every symbol from the primary venue.
async fn fetch_bundle(
    gateway: &HttpVenueGateway,
    symbols: &[String],
    timeframe: &str,
) -> CandleBundle {
    let mut bundle = HashMap::new();
    for symbol in symbols {
        match gateway.fetch_candles(symbol, timeframe, 2).await {
            Ok(candles) => {
                // With two candles the last one is usually still forming;
                // trade on the most recent closed one.
                let closed = if candles.len() >= 2 {
                    candles.get(candles.len() - 2)
                } else {
                    candles.last()
                };
                if let Some(candle) = closed {
                    bundle.insert(symbol.clone(), candle.clone());
                }
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "candle fetch failed — symbol skipped");
            }
        }
    }
    bundle
}

/// Venue timeframe label for a configured hour count.
fn timeframe_label(hours: f64) -> String {
    if hours >= 1.0 {
        format!("{}h", hours as u64)
    } else {
        format!("{}m", (hours * 60.0).max(1.0) as u64)
    }
}

/// A conservative default stress battery over the configured symbols.
fn default_stress_scenarios(symbols: &[String]) -> Vec<StressScenario> {
    let broad: HashMap<String, f64> = symbols.iter().map(|s| (s.clone(), -0.20)).collect();
    let moderate: HashMap<String, f64> = symbols.iter().map(|s| (s.clone(), -0.05)).collect();
    vec![
        StressScenario {
            name: "broad -20%".into(),
            shocks: broad,
        },
        StressScenario {
            name: "broad -5%".into(),
            shocks: moderate,
        },
    ]
}
