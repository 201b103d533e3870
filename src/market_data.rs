// =============================================================================
// Market Data — candles and per-symbol ring-buffered series
// =============================================================================
//
// Candles are keyed by epoch-ms open time and must arrive strictly
// increasing within one series; out-of-order or duplicate timestamps are
// dropped with a warning. The series is a bounded ring so long-running
// engines never grow without limit.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// A single OHLCV candle. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// High-low range, used for ATR-style volatility estimates.
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// One tick's worth of candles across symbols, as dispatched by the
/// multi-symbol coordinator.
pub type CandleBundle = HashMap<String, Candle>;

// ---------------------------------------------------------------------------
// CandleSeries — bounded, strictly-ordered ring per symbol
// ---------------------------------------------------------------------------

/// Thread-safe store of the most recent candles per symbol.
pub struct CandleSeries {
    series: RwLock<HashMap<String, VecDeque<Candle>>>,
    max_candles: usize,
}

impl CandleSeries {
    /// Create a store retaining at most `max_candles` per symbol.
    pub fn new(max_candles: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Append a candle to a symbol's series.
    ///
    /// Returns `false` (and drops the candle) when its timestamp does not
    /// strictly increase over the last stored candle.
    pub fn push(&self, symbol: &str, candle: Candle) -> bool {
        let mut map = self.series.write();
        let ring = map
            .entry(symbol.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.max_candles));

        if let Some(last) = ring.back() {
            if candle.timestamp <= last.timestamp {
                warn!(
                    symbol,
                    last_ts = last.timestamp,
                    candle_ts = candle.timestamp,
                    "dropping out-of-order candle"
                );
                return false;
            }
        }

        ring.push_back(candle);
        while ring.len() > self.max_candles {
            ring.pop_front();
        }
        debug!(symbol, len = ring.len(), "candle appended");
        true
    }

    /// Most recent `count` candles, oldest first.
    pub fn recent(&self, symbol: &str, count: usize) -> Vec<Candle> {
        let map = self.series.read();
        match map.get(symbol) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Most recent `count` close prices, oldest first.
    pub fn closes(&self, symbol: &str, count: usize) -> Vec<f64> {
        self.recent(symbol, count).iter().map(|c| c.close).collect()
    }

    /// Close price of the latest candle, if any.
    pub fn last_close(&self, symbol: &str) -> Option<f64> {
        let map = self.series.read();
        map.get(symbol).and_then(|ring| ring.back().map(|c| c.close))
    }

    /// Number of stored candles for `symbol`.
    pub fn len(&self, symbol: &str) -> usize {
        let map = self.series.read();
        map.get(symbol).map_or(0, VecDeque::len)
    }
}
