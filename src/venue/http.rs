// =============================================================================
// HTTP Venue Gateway — signed REST access with retry, normalization, OCO
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry the API key as a header and an HMAC-SHA256 signature over the query
// string, with a recvWindow to tolerate minor clock drift.
//
// The transport is injected behind `HttpTransport` so the retry loop, the
// MARKET-family price omission, and the OCO emulation path are all testable
// against a scripted fake without touching the network.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::market_data::Candle;
use crate::metrics::MetricsRegistry;
use crate::types::{now_ms, OrderRequest, OrderType, Ticker};
use crate::venue::gateway::{OcoOrderIds, OcoRequest, VenueGateway, VenueOrderUpdate};
use crate::venue::order_type::{map_internal_to_venue, map_venue_status};
use crate::venue::retry::{classify_response, classify_transport_error, RetryDecision, RetryPolicy};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

// ---------------------------------------------------------------------------
// Transport abstraction
// ---------------------------------------------------------------------------

/// One HTTP exchange as seen by the gateway.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

/// Connection-level transport failure (DNS, socket, TLS).
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),
}

/// Minimal HTTP surface the gateway needs. The production implementation
/// wraps reqwest; tests substitute a scripted fake.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, method: &str, url: &str) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport with a hard client timeout.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport. `api_key_header` is attached to every request
    /// when present (e.g. `("X-MBX-APIKEY", key)` for Binance).
    pub fn new(api_key_header: Option<(&str, &str)>) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Some((name, value)) = api_key_header {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                default_headers.insert(name, value);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, method: &str, url: &str) -> Result<TransportResponse, TransportError> {
        let request = match method {
            "POST" => self.client.post(url),
            "DELETE" => self.client.delete(url),
            _ => self.client.get(url),
        };

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null);

        Ok(TransportResponse { status, body })
    }
}

// ---------------------------------------------------------------------------
// Venue identity
// ---------------------------------------------------------------------------

/// Venues with special request handling. Everything else is `Generic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueKind {
    Binance,
    Bitget,
    Bybit,
    Generic,
}

impl VenueKind {
    pub fn from_id(venue_id: &str) -> Self {
        let lower = venue_id.to_lowercase();
        if lower.contains("binance") {
            Self::Binance
        } else if lower.contains("bitget") {
            Self::Bitget
        } else if lower.contains("bybit") {
            Self::Bybit
        } else {
            Self::Generic
        }
    }

    /// REST path prefix for this venue family.
    fn api_prefix(self) -> &'static str {
        match self {
            Self::Binance => "/api/v3",
            Self::Bitget => "/api/v2/spot",
            Self::Bybit => "/v5",
            Self::Generic => "/api/v1",
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// HMAC-signed REST gateway to one venue.
pub struct HttpVenueGateway {
    venue_id: String,
    kind: VenueKind,
    base_url: String,
    secret: String,
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    metrics: Arc<MetricsRegistry>,
    native_oco: bool,
    /// Overall per-call deadline; the retry loop stops when the next delay
    /// would cross it.
    request_deadline: Option<Duration>,
}

impl HttpVenueGateway {
    pub fn new(
        venue_id: impl Into<String>,
        base_url: impl Into<String>,
        secret: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        policy: RetryPolicy,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let venue_id = venue_id.into();
        let kind = VenueKind::from_id(&venue_id);
        debug!(venue_id = %venue_id, ?kind, "venue gateway initialised");

        Self {
            venue_id,
            kind,
            base_url: base_url.into(),
            secret: secret.into(),
            transport,
            policy,
            metrics,
            // Only Binance-family venues expose a native OCO endpoint here;
            // everyone else goes through the emulation path.
            native_oco: kind == VenueKind::Binance,
            request_deadline: None,
        }
    }

    /// Override native-OCO support (venue sandbox environments differ).
    pub fn with_native_oco(mut self, native: bool) -> Self {
        self.native_oco = native;
        self
    }

    /// Bound the total wall-clock time of any single gateway call.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = Some(deadline);
        self
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = now_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn url(&self, endpoint: &str, query: &str) -> String {
        let prefix = self.kind.api_prefix();
        if query.is_empty() {
            format!("{}{}{}", self.base_url, prefix, endpoint)
        } else {
            format!("{}{}{}?{}", self.base_url, prefix, endpoint, query)
        }
    }

    /// Symbols travel without the `/` separator ("BTC/USDT" -> "BTCUSDT").
    fn wire_symbol(symbol: &str) -> String {
        symbol.replace('/', "")
    }

    // -------------------------------------------------------------------------
    // Retry loop
    // -------------------------------------------------------------------------

    /// Send one logical request, retrying retryable failures on the
    /// exponential backoff schedule. The last error is re-raised once the
    /// retry budget is spent; non-retryable errors surface immediately.
    async fn send_with_retry(
        &self,
        method: &str,
        endpoint: &str,
        query: &str,
    ) -> Result<serde_json::Value, EngineError> {
        let url = self.url(endpoint, query);
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let (decision, error) = match self.transport.execute(method, &url).await {
                Ok(resp) if (200..300).contains(&resp.status) => return Ok(resp.body),
                Ok(resp) => {
                    let body_text = resp.body.to_string();
                    let decision = classify_response(resp.status, &body_text);
                    let error = match decision {
                        RetryDecision::Retry => EngineError::RetryableNetwork(format!(
                            "{} {} returned {}: {}",
                            method, endpoint, resp.status, body_text
                        )),
                        RetryDecision::Fail => EngineError::VenueRejected(format!(
                            "{} {} returned {}: {}",
                            method, endpoint, resp.status, body_text
                        )),
                    };
                    (decision, error)
                }
                Err(TransportError::Connection(msg)) => {
                    let decision = classify_transport_error(&msg);
                    // Connection failures stay network errors even when they
                    // are not worth retrying (e.g. TLS handshake rejection).
                    (decision, EngineError::RetryableNetwork(msg))
                }
            };

            if decision == RetryDecision::Fail {
                return Err(error);
            }
            if attempt >= self.policy.max_retries {
                warn!(
                    venue = %self.venue_id,
                    endpoint,
                    attempts = attempt + 1,
                    "retry budget exhausted"
                );
                return Err(error);
            }

            let delay = self.policy.delay(attempt);
            if let Some(deadline) = self.request_deadline {
                if started.elapsed() + delay >= deadline {
                    return Err(EngineError::Timeout(format!(
                        "{method} {endpoint} abandoned after {} attempts",
                        attempt + 1
                    )));
                }
            }

            self.metrics.record_retry(&self.venue_id);
            debug!(
                venue = %self.venue_id,
                endpoint,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "retrying after retryable failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    // -------------------------------------------------------------------------
    // Request building
    // -------------------------------------------------------------------------

    /// Build the outbound parameter string for an order.
    ///
    /// MARKET-family types never carry a price, regardless of caller input.
    /// Bitget and Bybit market orders need extra venue-specific parameters.
    fn order_params(&self, order: &OrderRequest) -> String {
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            Self::wire_symbol(&order.symbol),
            order.side,
            map_internal_to_venue(order.order_type),
            order.amount
        );

        if !order.order_type.is_market_family() {
            if let Some(price) = order.price {
                params.push_str(&format!("&price={price}"));
            }
            if order.order_type.requires_price() {
                params.push_str("&timeInForce=GTC");
            }
        }
        if let Some(stop) = order.stop_price {
            params.push_str(&format!("&stopPrice={stop}"));
        }

        if order.order_type.is_market_family() {
            match self.kind {
                VenueKind::Bitget => params.push_str("&force=normal"),
                VenueKind::Bybit => params.push_str("&marketUnit=baseCoin"),
                _ => {}
            }
        }

        params
    }

    /// Pull a venue order id out of the assorted response shapes.
    fn extract_order_id(body: &serde_json::Value) -> Option<String> {
        for candidate in [&body["orderId"], &body["id"], &body["data"]["orderId"]] {
            if let Some(n) = candidate.as_u64() {
                return Some(n.to_string());
            }
            if let Some(s) = candidate.as_str() {
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
        }
        None
    }

    /// Parse a JSON value that may be either a string or a number into f64.
    fn parse_str_f64(val: &serde_json::Value) -> Option<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>().ok()
        } else {
            val.as_f64()
        }
    }

    // -------------------------------------------------------------------------
    // OCO
    // -------------------------------------------------------------------------

    async fn create_oco_native(&self, request: &OcoRequest) -> Result<OcoOrderIds, EngineError> {
        let mut params = format!(
            "symbol={}&side={}&quantity={}&price={}&stopPrice={}",
            Self::wire_symbol(&request.symbol),
            request.side,
            request.amount,
            request.limit_price,
            request.stop_price
        );
        if let Some(sl) = request.stop_limit_price {
            params.push_str(&format!("&stopLimitPrice={sl}&stopLimitTimeInForce=GTC"));
        }

        let qs = self.signed_query(&params);
        let body = self.send_with_retry("POST", "/order/oco", &qs).await?;
        Self::parse_oco_response(&body).ok_or_else(|| {
            EngineError::VenueRejected(format!("unparseable OCO response: {body}"))
        })
    }

    /// Binance-family venues answer with an array of order reports; others
    /// answer with a single object.
    fn parse_oco_response(body: &serde_json::Value) -> Option<OcoOrderIds> {
        let report_ids = |reports: &[serde_json::Value]| -> Vec<String> {
            reports.iter().filter_map(Self::extract_order_id).collect()
        };

        if let Some(arr) = body.as_array() {
            let ids = report_ids(arr);
            return match ids.len() {
                0 => None,
                1 => Some(OcoOrderIds::Single(ids[0].clone())),
                _ => Some(OcoOrderIds::Pair {
                    limit: ids[0].clone(),
                    stop: ids[1].clone(),
                }),
            };
        }

        if let Some(reports) = body["orderReports"].as_array() {
            let ids = report_ids(reports);
            if ids.len() >= 2 {
                return Some(OcoOrderIds::Pair {
                    limit: ids[0].clone(),
                    stop: ids[1].clone(),
                });
            }
        }

        if let Some(list_id) = body["orderListId"].as_u64() {
            return Some(OcoOrderIds::Single(list_id.to_string()));
        }

        Self::extract_order_id(body).map(OcoOrderIds::Single)
    }

    /// Sequential emulation: LIMIT take-profit first, then the stop leg. If
    /// the stop leg fails the LIMIT is cancelled before the error surfaces.
    async fn create_oco_emulated(&self, request: &OcoRequest) -> Result<OcoOrderIds, EngineError> {
        self.metrics.record_oco_fallback(&self.venue_id);

        let limit_leg = OrderRequest {
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: OrderType::Limit,
            amount: request.amount,
            price: Some(request.limit_price),
            stop_price: None,
            options: None,
        };
        let limit_id = self
            .execute_order(&limit_leg)
            .await?
            .ok_or_else(|| EngineError::VenueRejected("LIMIT leg returned no order id".into()))?;

        let stop_leg = match request.stop_limit_price {
            Some(stop_limit) => OrderRequest {
                symbol: request.symbol.clone(),
                side: request.side,
                order_type: OrderType::StopLimit,
                amount: request.amount,
                price: Some(stop_limit),
                stop_price: Some(request.stop_price),
                options: None,
            },
            None => OrderRequest {
                symbol: request.symbol.clone(),
                side: request.side,
                order_type: OrderType::Stop,
                amount: request.amount,
                price: None,
                stop_price: Some(request.stop_price),
                options: None,
            },
        };

        match self.execute_order(&stop_leg).await {
            Ok(Some(stop_id)) => Ok(OcoOrderIds::Pair {
                limit: limit_id,
                stop: stop_id,
            }),
            Ok(None) => {
                self.rollback_oco_leg(&limit_id, &request.symbol).await;
                Err(EngineError::VenueRejected(
                    "stop leg returned no order id".into(),
                ))
            }
            Err(e) => {
                self.rollback_oco_leg(&limit_id, &request.symbol).await;
                Err(e)
            }
        }
    }

    async fn rollback_oco_leg(&self, venue_order_id: &str, symbol: &str) {
        warn!(
            venue = %self.venue_id,
            venue_order_id,
            "stop leg failed — cancelling LIMIT leg of emulated OCO"
        );
        if let Err(e) = self.cancel_order(venue_order_id, symbol).await {
            warn!(
                venue = %self.venue_id,
                venue_order_id,
                error = %e,
                "failed to cancel LIMIT leg — manual intervention required"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// VenueGateway implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl VenueGateway for HttpVenueGateway {
    fn venue_id(&self) -> &str {
        &self.venue_id
    }

    async fn initialize(&self) -> Result<bool, EngineError> {
        match self.send_with_retry("GET", "/ping", "").await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(venue = %self.venue_id, error = %e, "venue ping failed");
                Ok(false)
            }
        }
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, EngineError> {
        let query = format!(
            "symbol={}&interval={}&limit={}",
            Self::wire_symbol(symbol),
            timeframe,
            limit
        );
        let body = self.send_with_retry("GET", "/klines", &query).await?;

        let raw = body.as_array().ok_or_else(|| {
            EngineError::VenueRejected(format!("klines response is not an array: {body}"))
        })?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(arr) = entry.as_array() else {
                warn!(venue = %self.venue_id, "skipping non-array kline entry");
                continue;
            };
            if arr.len() < 6 {
                warn!(
                    venue = %self.venue_id,
                    elements = arr.len(),
                    "skipping malformed kline entry"
                );
                continue;
            }

            let timestamp = arr[0].as_i64().unwrap_or(0);
            let fields: Option<Vec<f64>> =
                arr[1..6].iter().map(Self::parse_str_f64).collect();
            let Some(f) = fields else {
                warn!(venue = %self.venue_id, "skipping kline entry with unparseable fields");
                continue;
            };
            candles.push(Candle::new(timestamp, f[0], f[1], f[2], f[3], f[4]));
        }

        debug!(venue = %self.venue_id, symbol, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, EngineError> {
        let query = format!("symbol={}", Self::wire_symbol(symbol));
        let body = self.send_with_retry("GET", "/ticker/price", &query).await?;

        let last = [&body["price"], &body["lastPrice"], &body["last"]]
            .into_iter()
            .find_map(Self::parse_str_f64)
            .ok_or_else(|| {
                EngineError::VenueRejected(format!("ticker response has no price: {body}"))
            })?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
            bid: Self::parse_str_f64(&body["bidPrice"]),
            ask: Self::parse_str_f64(&body["askPrice"]),
            timestamp: now_ms(),
        })
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, f64>, EngineError> {
        let qs = self.signed_query("");
        let body = self.send_with_retry("GET", "/account", &qs).await?;

        let balances = body["balances"].as_array().ok_or_else(|| {
            EngineError::VenueRejected("account response missing 'balances' array".into())
        })?;

        let mut result = HashMap::new();
        for b in balances {
            let Some(asset) = b["asset"].as_str() else { continue };
            let free = Self::parse_str_f64(&b["free"]).unwrap_or(0.0);
            if free > 0.0 {
                result.insert(asset.to_string(), free);
            }
        }

        debug!(venue = %self.venue_id, assets = result.len(), "balance fetched");
        Ok(result)
    }

    async fn execute_order(&self, order: &OrderRequest) -> Result<Option<String>, EngineError> {
        order.validate()?;
        self.metrics.record_order_attempt(&self.venue_id);

        let params = self.order_params(order);
        let qs = self.signed_query(&params);

        debug!(
            venue = %self.venue_id,
            symbol = %order.symbol,
            side = %order.side,
            order_type = %order.order_type,
            amount = order.amount,
            "placing order"
        );

        match self.send_with_retry("POST", "/order", &qs).await {
            Ok(body) => {
                self.metrics.record_order_success(&self.venue_id);
                Ok(Self::extract_order_id(&body))
            }
            Err(e) => {
                self.metrics.record_order_failure(&self.venue_id);
                Err(e)
            }
        }
    }

    async fn fetch_order(
        &self,
        venue_order_id: &str,
        symbol: &str,
    ) -> Result<Option<serde_json::Value>, EngineError> {
        let params = format!(
            "symbol={}&orderId={}",
            Self::wire_symbol(symbol),
            venue_order_id
        );
        let qs = self.signed_query(&params);

        match self.send_with_retry("GET", "/order", &qs).await {
            Ok(body) => Ok(Some(body)),
            Err(EngineError::VenueRejected(msg))
                if msg.to_lowercase().contains("not found")
                    || msg.to_lowercase().contains("does not exist") =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_order_and_convert(
        &self,
        venue_order_id: &str,
        symbol: &str,
    ) -> Result<Option<VenueOrderUpdate>, EngineError> {
        let Some(body) = self.fetch_order(venue_order_id, symbol).await? else {
            return Ok(None);
        };

        let status = map_venue_status(body["status"].as_str().unwrap_or(""));
        let filled = [&body["executedQty"], &body["filled"]]
            .into_iter()
            .find_map(Self::parse_str_f64)
            .unwrap_or(0.0);

        // Prefer an explicit average price; fall back to quote volume / qty.
        let avg_fill_price = Self::parse_str_f64(&body["avgPrice"])
            .or_else(|| {
                let quote = Self::parse_str_f64(&body["cummulativeQuoteQty"])?;
                (filled > 0.0).then(|| quote / filled)
            })
            .unwrap_or(0.0);

        Ok(Some(VenueOrderUpdate {
            venue_order_id: venue_order_id.to_string(),
            status,
            filled_amount: filled,
            avg_fill_price,
            raw: body,
        }))
    }

    async fn cancel_order(&self, venue_order_id: &str, symbol: &str) -> Result<(), EngineError> {
        let params = format!(
            "symbol={}&orderId={}",
            Self::wire_symbol(symbol),
            venue_order_id
        );
        let qs = self.signed_query(&params);

        self.send_with_retry("DELETE", "/order", &qs).await?;
        debug!(venue = %self.venue_id, venue_order_id, "order cancelled");
        Ok(())
    }

    async fn create_oco_order(&self, request: &OcoRequest) -> Result<OcoOrderIds, EngineError> {
        if self.supports_oco() {
            self.create_oco_native(request).await
        } else {
            self.create_oco_emulated(request).await
        }
    }

    async fn get_market_info(&self, symbol: &str) -> Result<serde_json::Value, EngineError> {
        let query = format!("symbol={}", Self::wire_symbol(symbol));
        let body = self.send_with_retry("GET", "/exchangeInfo", &query).await?;

        // Binance wraps the entry in a `symbols` array; other venues return
        // the entry directly.
        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first().cloned())
            .unwrap_or(body);

        Ok(info)
    }

    fn supports_feature(&self, name: &str) -> bool {
        match name {
            "oco" => self.native_oco,
            _ => false,
        }
    }
}

impl std::fmt::Debug for HttpVenueGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVenueGateway")
            .field("venue_id", &self.venue_id)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("secret", &"<redacted>")
            .finish()
    }
}
