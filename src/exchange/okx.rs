//! OKX perpetual swap adapter. Entry and close orders go through the
//! regular trade endpoint; protective stops and take-profits are algo
//! (conditional) orders, which OKX manages server-side.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::domain::{
    ExchangeKind, MarginMode, OrderIntent, OrderResult, OrderSide, OrderStatus, OrderType,
};
use crate::error::{Result, SigtradeError};

use super::filters::SymbolFilters;
use super::traits::{Balance, ExchangeAdapter, FillStream, VenuePosition};

const DEFAULT_BASE_URL: &str = "https://www.okx.com";
const DEFAULT_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/private";
const MAX_RECONNECT_DELAY_SECS: u64 = 60;

type HmacSha256 = Hmac<Sha256>;

pub struct OkxSwap {
    http: Client,
    base_url: String,
    ws_url: String,
    api_key: String,
    api_secret: String,
    passphrase: String,
    margin_mode: MarginMode,
    filters: Arc<RwLock<HashMap<String, SymbolFilters>>>,
    /// Max leverage per instrument, learned from the instruments endpoint.
    max_lever: Arc<RwLock<HashMap<String, u32>>>,
    /// Whether a client key was placed as an algo order; restart lookups
    /// fall back to trying both endpoints.
    algo_keys: Arc<RwLock<HashMap<String, bool>>>,
}

impl OkxSwap {
    pub fn new(
        api_key: String,
        api_secret: String,
        passphrase: String,
        margin_mode: MarginMode,
        base_url: Option<&str>,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent("sigtrade-okx-adapter/0.1")
            .build()
            .map_err(|e| SigtradeError::internal(format!("okx http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            api_key,
            api_secret,
            passphrase,
            margin_mode,
            filters: Arc::new(RwLock::new(HashMap::new())),
            max_lever: Arc::new(RwLock::new(HashMap::new())),
            algo_keys: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn td_mode(&self) -> &'static str {
        match self.margin_mode {
            MarginMode::Cross => "cross",
            MarginMode::Isolated => "isolated",
        }
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
        let payload = format!("{}{}{}{}", timestamp, method, path, body);
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| SigtradeError::Auth(format!("invalid okx secret: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let signature = self.sign(&timestamp, method.as_str(), path, &body_str)?;

        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json");
        if !body_str.is_empty() {
            request = request.body(body_str);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SigtradeError::transient(format!("okx request: {}", e)))?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| SigtradeError::transient(format!("okx response body: {}", e)))?;

        if status.is_server_error() {
            return Err(SigtradeError::transient(format!("okx {}", status)));
        }
        let code = payload["code"].as_str().unwrap_or("0");
        if code == "0" {
            Ok(payload)
        } else {
            // Per-item codes live in data[0] when the envelope reports "1".
            let detail = payload["data"][0]["sCode"]
                .as_str()
                .filter(|c| !c.is_empty() && *c != "0")
                .unwrap_or(code);
            let msg = payload["data"][0]["sMsg"]
                .as_str()
                .or_else(|| payload["msg"].as_str())
                .unwrap_or("unknown error");
            Err(classify_error(detail, msg))
        }
    }

    async fn public_request(&self, path: &str) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| SigtradeError::transient(format!("okx request: {}", e)))?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| SigtradeError::transient(format!("okx response body: {}", e)))?;
        Ok(payload)
    }

    async fn is_algo_key(&self, client_key: &str) -> Option<bool> {
        self.algo_keys.read().await.get(client_key).copied()
    }

    async fn regular_status(&self, symbol: &str, client_key: &str) -> Result<Option<OrderResult>> {
        let path = format!("/api/v5/trade/order?instId={}&clOrdId={}", symbol, client_key);
        match self.request(Method::GET, &path, None).await {
            Ok(body) => Ok(body["data"][0]
                .as_object()
                .map(|_| parse_regular_order(&body["data"][0]))),
            Err(SigtradeError::OrderRejected(msg)) if msg.contains("51603") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn algo_status(&self, symbol: &str, client_key: &str) -> Result<Option<OrderResult>> {
        let path = format!("/api/v5/trade/order-algo?algoClOrdId={}", client_key);
        match self.request(Method::GET, &path, None).await {
            Ok(body) => Ok(body["data"][0]
                .as_object()
                .map(|_| parse_algo_order(symbol, &body["data"][0]))),
            Err(SigtradeError::OrderRejected(msg)) if msg.contains("51604") => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn classify_error(code: &str, msg: &str) -> SigtradeError {
    let detail = format!("okx {}: {}", code, msg);
    match code {
        "50011" | "50013" => SigtradeError::RateLimited {
            venue: "okx".to_string(),
            detail,
        },
        "51008" | "51131" | "59200" => SigtradeError::InsufficientFunds(detail),
        "51000" | "51116" | "51120" | "51121" => SigtradeError::InvalidSymbolOrPrecision(detail),
        _ => SigtradeError::OrderRejected(detail),
    }
}

fn map_state(state: &str) -> OrderStatus {
    match state {
        "live" => OrderStatus::Accepted,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "filled" | "effective" => OrderStatus::Filled,
        "canceled" | "mmp_canceled" => OrderStatus::Canceled,
        "order_failed" => OrderStatus::Rejected,
        other => {
            warn!(state = other, "unknown okx order state");
            OrderStatus::Rejected
        }
    }
}

fn decimal_str(value: &Value, key: &str) -> Decimal {
    value[key]
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Decimal::ZERO)
}

fn parse_regular_order(data: &Value) -> OrderResult {
    let avg = decimal_str(data, "avgPx");
    OrderResult {
        client_key: data["clOrdId"].as_str().unwrap_or_default().to_string(),
        venue_order_id: data["ordId"].as_str().map(str::to_string),
        venue: ExchangeKind::Okx,
        symbol: data["instId"].as_str().unwrap_or_default().to_string(),
        status: map_state(data["state"].as_str().unwrap_or_default()),
        filled_quantity: decimal_str(data, "accFillSz"),
        avg_fill_price: if avg.is_zero() { None } else { Some(avg) },
        error: None,
        timestamp: Utc::now(),
    }
}

fn parse_algo_order(symbol: &str, data: &Value) -> OrderResult {
    OrderResult {
        client_key: data["algoClOrdId"].as_str().unwrap_or_default().to_string(),
        venue_order_id: data["algoId"].as_str().map(str::to_string),
        venue: ExchangeKind::Okx,
        symbol: symbol.to_string(),
        status: map_state(data["state"].as_str().unwrap_or_default()),
        filled_quantity: decimal_str(data, "actualSz"),
        avg_fill_price: None,
        error: None,
        timestamp: Utc::now(),
    }
}

#[async_trait]
impl ExchangeAdapter for OkxSwap {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Okx
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderResult> {
        let side = match intent.side {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        };
        let is_algo = matches!(
            intent.order_type,
            OrderType::StopMarket | OrderType::TakeProfitMarket
        );

        let result = if is_algo {
            let trigger = intent.trigger_price.ok_or_else(|| {
                SigtradeError::validation("triggered order requires a trigger price")
            })?;
            let mut body = json!({
                "instId": intent.symbol,
                "tdMode": self.td_mode(),
                "side": side,
                "ordType": "conditional",
                "sz": intent.quantity.to_string(),
                "algoClOrdId": intent.client_key,
                "reduceOnly": intent.reduce_only,
            });
            // "-1" means execute at market once triggered.
            if intent.order_type == OrderType::StopMarket {
                body["slTriggerPx"] = json!(trigger.to_string());
                body["slOrdPx"] = json!("-1");
            } else {
                body["tpTriggerPx"] = json!(trigger.to_string());
                body["tpOrdPx"] = json!("-1");
            }
            let response = self
                .request(Method::POST, "/api/v5/trade/order-algo", Some(body))
                .await?;
            OrderResult {
                client_key: intent.client_key.clone(),
                venue_order_id: response["data"][0]["algoId"].as_str().map(str::to_string),
                venue: ExchangeKind::Okx,
                symbol: intent.symbol.clone(),
                status: OrderStatus::Accepted,
                filled_quantity: Decimal::ZERO,
                avg_fill_price: None,
                error: None,
                timestamp: Utc::now(),
            }
        } else {
            let ord_type = match intent.order_type {
                OrderType::Limit => "limit",
                _ => "market",
            };
            let mut body = json!({
                "instId": intent.symbol,
                "tdMode": self.td_mode(),
                "side": side,
                "ordType": ord_type,
                "sz": intent.quantity.to_string(),
                "clOrdId": intent.client_key,
                "reduceOnly": intent.reduce_only,
            });
            if let Some(price) = intent.price {
                body["px"] = json!(price.to_string());
            }
            let response = self
                .request(Method::POST, "/api/v5/trade/order", Some(body))
                .await?;
            OrderResult {
                client_key: intent.client_key.clone(),
                venue_order_id: response["data"][0]["ordId"].as_str().map(str::to_string),
                venue: ExchangeKind::Okx,
                symbol: intent.symbol.clone(),
                status: OrderStatus::Accepted,
                filled_quantity: Decimal::ZERO,
                avg_fill_price: None,
                error: None,
                timestamp: Utc::now(),
            }
        };

        self.algo_keys
            .write()
            .await
            .insert(intent.client_key.clone(), is_algo);
        info!(
            client_key = %intent.client_key,
            symbol = %intent.symbol,
            algo = is_algo,
            "okx order placed"
        );
        Ok(result)
    }

    async fn cancel_order(&self, symbol: &str, client_key: &str) -> Result<bool> {
        let algo = self.is_algo_key(client_key).await.unwrap_or(false);
        let outcome = if algo {
            let body = json!([{ "instId": symbol, "algoClOrdId": client_key }]);
            self.request(Method::POST, "/api/v5/trade/cancel-algos", Some(body))
                .await
        } else {
            let body = json!({ "instId": symbol, "clOrdId": client_key });
            self.request(Method::POST, "/api/v5/trade/cancel-order", Some(body))
                .await
        };
        match outcome {
            Ok(_) => Ok(true),
            // 51400/51401: order already completed or canceled.
            Err(SigtradeError::OrderRejected(msg))
                if msg.contains("51400") || msg.contains("51401") || msg.contains("51603") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn order_status(&self, symbol: &str, client_key: &str) -> Result<Option<OrderResult>> {
        match self.is_algo_key(client_key).await {
            Some(true) => self.algo_status(symbol, client_key).await,
            Some(false) => self.regular_status(symbol, client_key).await,
            None => {
                // Unknown key (fresh process): try both endpoints.
                if let Some(result) = self.regular_status(symbol, client_key).await? {
                    return Ok(Some(result));
                }
                self.algo_status(symbol, client_key).await
            }
        }
    }

    async fn position(&self, symbol: &str) -> Result<VenuePosition> {
        let path = format!("/api/v5/account/positions?instId={}", symbol);
        let body = self.request(Method::GET, &path, None).await?;
        let data = &body["data"][0];
        let qty = decimal_str(data, "pos");
        let signed = if data["posSide"].as_str() == Some("short") {
            -qty.abs()
        } else {
            qty
        };
        Ok(VenuePosition {
            symbol: symbol.to_string(),
            quantity: signed,
            avg_price: decimal_str(data, "avgPx"),
        })
    }

    async fn balance(&self) -> Result<Balance> {
        let body = self
            .request(Method::GET, "/api/v5/account/balance?ccy=USDT", None)
            .await?;
        let detail = &body["data"][0]["details"][0];
        Ok(Balance {
            available: decimal_str(detail, "availBal"),
            total: decimal_str(detail, "eq"),
        })
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal> {
        let path = format!(
            "/api/v5/public/mark-price?instType=SWAP&instId={}",
            symbol
        );
        let body = self.public_request(&path).await?;
        let mark = decimal_str(&body["data"][0], "markPx");
        if mark.is_zero() {
            return Err(SigtradeError::transient(format!(
                "okx returned no mark price for {}",
                symbol
            )));
        }
        Ok(mark)
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        if let Some(cached) = self.filters.read().await.get(symbol) {
            return Ok(cached.clone());
        }

        let path = format!(
            "/api/v5/public/instruments?instType=SWAP&instId={}",
            symbol
        );
        let body = self.public_request(&path).await?;
        let data = body["data"][0].as_object().ok_or_else(|| {
            SigtradeError::InvalidSymbolOrPrecision(format!("unknown instrument {}", symbol))
        })?;
        let data = Value::Object(data.clone());

        let min_sz = decimal_str(&data, "minSz");
        let filters = SymbolFilters {
            symbol: symbol.to_string(),
            tick_size: decimal_str(&data, "tickSz"),
            step_size: decimal_str(&data, "lotSz"),
            min_qty: min_sz,
            min_notional: Decimal::ZERO,
        };
        if let Some(max) = data["lever"].as_str().and_then(|s| s.parse::<u32>().ok()) {
            self.max_lever.write().await.insert(symbol.to_string(), max);
        }

        self.filters
            .write()
            .await
            .insert(symbol.to_string(), filters.clone());
        Ok(filters)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<u32> {
        // Instruments response carries the venue maximum; fetch it first.
        self.symbol_filters(symbol).await?;
        let max = self
            .max_lever
            .read()
            .await
            .get(symbol)
            .copied()
            .unwrap_or(leverage);
        let effective = leverage.clamp(1, max.max(1));
        let body = json!({
            "instId": symbol,
            "lever": effective.to_string(),
            "mgnMode": self.td_mode(),
        });
        self.request(Method::POST, "/api/v5/account/set-leverage", Some(body))
            .await?;
        Ok(effective)
    }

    async fn fill_stream(&self) -> Result<FillStream> {
        let (tx, rx) = mpsc::channel::<OrderResult>(256);
        let ws_url = self.ws_url.clone();
        let api_key = self.api_key.clone();
        let api_secret = self.api_secret.clone();
        let passphrase = self.passphrase.clone();

        tokio::spawn(async move {
            let mut reconnect_delay = 1u64;
            loop {
                match run_private_stream(&ws_url, &api_key, &api_secret, &passphrase, &tx).await {
                    Ok(()) => return,
                    Err(e) => {
                        error!(error = %e, "okx private stream failed, reconnecting");
                    }
                }
                tokio::time::sleep(Duration::from_secs(reconnect_delay)).await;
                reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY_SECS);
            }
        });

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|result| (result, rx))
        });
        Ok(Box::pin(stream))
    }
}

/// One private-stream session: login, subscribe to order updates, forward
/// them until the connection drops. Returns Ok only when the receiver side
/// is gone.
async fn run_private_stream(
    ws_url: &str,
    api_key: &str,
    api_secret: &str,
    passphrase: &str,
    tx: &mpsc::Sender<OrderResult>,
) -> Result<()> {
    use futures_util::{SinkExt, StreamExt};

    let (mut ws, _) = connect_async(ws_url)
        .await
        .map_err(|e| SigtradeError::WebSocket(format!("okx connect: {}", e)))?;

    let timestamp = Utc::now().timestamp().to_string();
    let payload = format!("{}GET/users/self/verify", timestamp);
    let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes())
        .map_err(|e| SigtradeError::Auth(format!("invalid okx secret: {}", e)))?;
    mac.update(payload.as_bytes());
    let sign = BASE64_STANDARD.encode(mac.finalize().into_bytes());

    let login = json!({
        "op": "login",
        "args": [{
            "apiKey": api_key,
            "passphrase": passphrase,
            "timestamp": timestamp,
            "sign": sign,
        }]
    });
    ws.send(Message::Text(login.to_string()))
        .await
        .map_err(|e| SigtradeError::WebSocket(format!("okx login send: {}", e)))?;

    let subscribe = json!({
        "op": "subscribe",
        "args": [{ "channel": "orders", "instType": "SWAP" }]
    });
    ws.send(Message::Text(subscribe.to_string()))
        .await
        .map_err(|e| SigtradeError::WebSocket(format!("okx subscribe send: {}", e)))?;
    info!("okx private stream connected");

    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let value: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if value["event"].as_str() == Some("error") {
                    return Err(SigtradeError::WebSocket(format!(
                        "okx stream error: {}",
                        value["msg"].as_str().unwrap_or("unknown")
                    )));
                }
                if value["arg"]["channel"].as_str() != Some("orders") {
                    continue;
                }
                let Some(rows) = value["data"].as_array() else {
                    continue;
                };
                for row in rows {
                    let mut result = parse_regular_order(row);
                    // Triggered conditional orders carry the algo client id.
                    if result.client_key.is_empty() {
                        if let Some(algo_key) = row["algoClOrdId"].as_str() {
                            result.client_key = algo_key.to_string();
                        }
                    }
                    if result.client_key.is_empty() {
                        continue;
                    }
                    debug!(client_key = %result.client_key, status = ?result.status, "okx order update");
                    if tx.send(result).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Ok(Message::Ping(payload)) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "okx stream read error");
                break;
            }
        }
    }
    Err(SigtradeError::WebSocket("okx stream closed".to_string()))
}
