//! Binance USDT-margined futures adapter. REST for order management,
//! user-data WebSocket stream for fills.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::domain::{
    ExchangeKind, OrderIntent, OrderResult, OrderSide, OrderStatus, OrderType,
};
use crate::error::{Result, SigtradeError};

use super::filters::SymbolFilters;
use super::traits::{Balance, ExchangeAdapter, FillStream, VenuePosition};

const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";
const DEFAULT_WS_URL: &str = "wss://fstream.binance.com";
const LISTEN_KEY_KEEPALIVE_SECS: u64 = 1800;
const MAX_RECONNECT_DELAY_SECS: u64 = 60;
const MAX_LEVERAGE: u32 = 125;

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceFutures {
    http: Client,
    base_url: String,
    ws_url: String,
    api_key: String,
    api_secret: String,
    filters: Arc<RwLock<HashMap<String, SymbolFilters>>>,
}

impl BinanceFutures {
    pub fn new(api_key: String, api_secret: String, base_url: Option<&str>) -> Result<Self> {
        let http = Client::builder()
            .user_agent("sigtrade-binance-adapter/0.1")
            .build()
            .map_err(|e| SigtradeError::internal(format!("binance http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            api_key,
            api_secret,
            filters: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn sign(&self, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| SigtradeError::Auth(format!("invalid binance secret: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Signed request. `params` go into the query string alongside the
    /// timestamp and signature.
    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value> {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", Utc::now().timestamp_millis()));
        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| SigtradeError::transient(format!("binance request: {}", e)))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| SigtradeError::transient(format!("binance response body: {}", e)))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_error(status, &body))
        }
    }

    async fn public_request(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SigtradeError::transient(format!("binance request: {}", e)))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| SigtradeError::transient(format!("binance response body: {}", e)))?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_error(status, &body))
        }
    }

}

async fn create_listen_key(http: &Client, base_url: &str, api_key: &str) -> Result<String> {
    let response = http
        .post(format!("{}/fapi/v1/listenKey", base_url))
        .header("X-MBX-APIKEY", api_key)
        .send()
        .await
        .map_err(|e| SigtradeError::transient(format!("binance listen key: {}", e)))?;
    let body: Value = response
        .json()
        .await
        .map_err(|e| SigtradeError::transient(format!("binance listen key body: {}", e)))?;
    body["listenKey"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| SigtradeError::Auth("binance returned no listen key".to_string()))
}

fn classify_error(status: StatusCode, body: &Value) -> SigtradeError {
    let code = body["code"].as_i64().unwrap_or(0);
    let msg = body["msg"].as_str().unwrap_or("unknown error").to_string();

    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return SigtradeError::RateLimited {
            venue: "binance".to_string(),
            detail: msg,
        };
    }
    match code {
        -2018 | -2019 => SigtradeError::InsufficientFunds(msg),
        -1013 | -1111 | -1121 | -4003 => SigtradeError::InvalidSymbolOrPrecision(msg),
        _ if status.is_server_error() => SigtradeError::transient(msg),
        _ => SigtradeError::OrderRejected(format!("binance {}: {}", code, msg)),
    }
}

fn map_status(s: &str) -> OrderStatus {
    match s {
        "NEW" => OrderStatus::Accepted,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        other => {
            warn!(status = other, "unknown binance order status");
            OrderStatus::Rejected
        }
    }
}

fn decimal_field(value: &Value, key: &str) -> Decimal {
    value[key]
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Decimal::ZERO)
}

fn parse_order(body: &Value) -> OrderResult {
    let filled = decimal_field(body, "executedQty");
    let avg = decimal_field(body, "avgPrice");
    OrderResult {
        client_key: body["clientOrderId"].as_str().unwrap_or_default().to_string(),
        venue_order_id: body["orderId"].as_i64().map(|id| id.to_string()),
        venue: ExchangeKind::Binance,
        symbol: body["symbol"].as_str().unwrap_or_default().to_string(),
        status: map_status(body["status"].as_str().unwrap_or_default()),
        filled_quantity: filled,
        avg_fill_price: if avg.is_zero() { None } else { Some(avg) },
        error: None,
        timestamp: Utc::now(),
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceFutures {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Binance
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderResult> {
        let side = match intent.side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", intent.symbol.clone()),
            ("side", side.to_string()),
            ("quantity", intent.quantity.to_string()),
            ("newClientOrderId", intent.client_key.clone()),
        ];
        match intent.order_type {
            OrderType::Limit => {
                let price = intent.price.ok_or_else(|| {
                    SigtradeError::validation("limit order requires a price")
                })?;
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                params.push(("price", price.to_string()));
            }
            OrderType::Market => params.push(("type", "MARKET".to_string())),
            OrderType::StopMarket | OrderType::TakeProfitMarket => {
                let trigger = intent.trigger_price.ok_or_else(|| {
                    SigtradeError::validation("triggered order requires a trigger price")
                })?;
                let kind = if intent.order_type == OrderType::StopMarket {
                    "STOP_MARKET"
                } else {
                    "TAKE_PROFIT_MARKET"
                };
                params.push(("type", kind.to_string()));
                params.push(("stopPrice", trigger.to_string()));
            }
        }
        if intent.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let body = self
            .signed_request(Method::POST, "/fapi/v1/order", &params)
            .await?;
        let result = parse_order(&body);
        info!(
            client_key = %intent.client_key,
            symbol = %intent.symbol,
            order_type = ?intent.order_type,
            "binance order placed"
        );
        Ok(result)
    }

    async fn cancel_order(&self, symbol: &str, client_key: &str) -> Result<bool> {
        let params = [
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_key.to_string()),
        ];
        match self
            .signed_request(Method::DELETE, "/fapi/v1/order", &params)
            .await
        {
            Ok(_) => Ok(true),
            // -2011: unknown order, already filled or canceled.
            Err(SigtradeError::OrderRejected(msg)) if msg.contains("-2011") => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn order_status(&self, symbol: &str, client_key: &str) -> Result<Option<OrderResult>> {
        let params = [
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_key.to_string()),
        ];
        match self
            .signed_request(Method::GET, "/fapi/v1/order", &params)
            .await
        {
            Ok(body) => Ok(Some(parse_order(&body))),
            Err(SigtradeError::OrderRejected(msg)) if msg.contains("-2013") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn position(&self, symbol: &str) -> Result<VenuePosition> {
        let params = [("symbol", symbol.to_string())];
        let body = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", &params)
            .await?;
        let entry = body
            .as_array()
            .and_then(|rows| rows.first())
            .cloned()
            .unwrap_or(Value::Null);
        Ok(VenuePosition {
            symbol: symbol.to_string(),
            quantity: decimal_field(&entry, "positionAmt"),
            avg_price: decimal_field(&entry, "entryPrice"),
        })
    }

    async fn balance(&self) -> Result<Balance> {
        let body = self
            .signed_request(Method::GET, "/fapi/v2/balance", &[])
            .await?;
        let usdt = body
            .as_array()
            .and_then(|rows| {
                rows.iter()
                    .find(|row| row["asset"].as_str() == Some("USDT"))
            })
            .cloned()
            .unwrap_or(Value::Null);
        Ok(Balance {
            available: decimal_field(&usdt, "availableBalance"),
            total: decimal_field(&usdt, "balance"),
        })
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal> {
        let params = [("symbol", symbol.to_string())];
        let body = self.public_request("/fapi/v1/premiumIndex", &params).await?;
        let mark = decimal_field(&body, "markPrice");
        if mark.is_zero() {
            return Err(SigtradeError::transient(format!(
                "binance returned no mark price for {}",
                symbol
            )));
        }
        Ok(mark)
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        if let Some(cached) = self.filters.read().await.get(symbol) {
            return Ok(cached.clone());
        }

        let params = [("symbol", symbol.to_string())];
        let body = self.public_request("/fapi/v1/exchangeInfo", &params).await?;
        let info = body["symbols"]
            .as_array()
            .and_then(|rows| rows.iter().find(|r| r["symbol"].as_str() == Some(symbol)))
            .ok_or_else(|| {
                SigtradeError::InvalidSymbolOrPrecision(format!("unknown symbol {}", symbol))
            })?;

        let mut filters = SymbolFilters {
            symbol: symbol.to_string(),
            tick_size: Decimal::ZERO,
            step_size: Decimal::ZERO,
            min_qty: Decimal::ZERO,
            min_notional: Decimal::ZERO,
        };
        if let Some(rows) = info["filters"].as_array() {
            for row in rows {
                match row["filterType"].as_str() {
                    Some("PRICE_FILTER") => filters.tick_size = decimal_field(row, "tickSize"),
                    Some("LOT_SIZE") => {
                        filters.step_size = decimal_field(row, "stepSize");
                        filters.min_qty = decimal_field(row, "minQty");
                    }
                    Some("MIN_NOTIONAL") => {
                        filters.min_notional = decimal_field(row, "notional")
                    }
                    _ => {}
                }
            }
        }

        self.filters
            .write()
            .await
            .insert(symbol.to_string(), filters.clone());
        Ok(filters)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<u32> {
        let effective = leverage.clamp(1, MAX_LEVERAGE);
        let params = [
            ("symbol", symbol.to_string()),
            ("leverage", effective.to_string()),
        ];
        let body = self
            .signed_request(Method::POST, "/fapi/v1/leverage", &params)
            .await?;
        Ok(body["leverage"].as_u64().unwrap_or(effective as u64) as u32)
    }

    async fn fill_stream(&self) -> Result<FillStream> {
        // Fails fast on bad credentials; the task mints its own keys after.
        let initial_key = create_listen_key(&self.http, &self.base_url, &self.api_key).await?;
        let (tx, rx) = mpsc::channel::<OrderResult>(256);

        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let ws_base = self.ws_url.clone();
        let api_key = self.api_key.clone();

        tokio::spawn(async move {
            let mut reconnect_delay = 1u64;
            let mut listen_key = Some(initial_key);
            loop {
                // Listen keys expire server-side; every reconnect starts
                // from a freshly minted one.
                let key = match listen_key.take() {
                    Some(key) => key,
                    None => match create_listen_key(&http, &base_url, &api_key).await {
                        Ok(key) => key,
                        Err(e) => {
                            error!(error = %e, "binance listen key refresh failed");
                            tokio::time::sleep(Duration::from_secs(reconnect_delay)).await;
                            reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY_SECS);
                            continue;
                        }
                    },
                };
                let ws_url = format!("{}/ws/{}", ws_base, key);
                let (mut ws, _) = match connect_async(&ws_url).await {
                    Ok(conn) => {
                        info!("binance user data stream connected");
                        reconnect_delay = 1;
                        conn
                    }
                    Err(e) => {
                        error!(error = %e, "binance user data stream connect failed");
                        tokio::time::sleep(Duration::from_secs(reconnect_delay)).await;
                        reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY_SECS);
                        continue;
                    }
                };

                use futures_util::{SinkExt, StreamExt};
                let mut keepalive =
                    tokio::time::interval(Duration::from_secs(LISTEN_KEY_KEEPALIVE_SECS));
                // The first tick completes immediately.
                keepalive.tick().await;
                loop {
                    tokio::select! {
                        _ = keepalive.tick() => {
                            let _ = http
                                .put(format!("{}/fapi/v1/listenKey", base_url))
                                .header("X-MBX-APIKEY", &api_key)
                                .send()
                                .await;
                        }
                        message = ws.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(result) = parse_user_data_event(&text) {
                                    if tx.send(result).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = ws.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "binance user data stream error, reconnecting");
                                break;
                            }
                            None => {
                                warn!("binance user data stream closed, reconnecting");
                                break;
                            }
                        }
                    }
                }
            }
        });

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|result| (result, rx))
        });
        Ok(Box::pin(stream))
    }
}

fn parse_user_data_event(text: &str) -> Option<OrderResult> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value["e"].as_str() != Some("ORDER_TRADE_UPDATE") {
        return None;
    }
    let order = &value["o"];
    let avg = decimal_field(order, "ap");
    let result = OrderResult {
        client_key: order["c"].as_str()?.to_string(),
        venue_order_id: order["i"].as_i64().map(|id| id.to_string()),
        venue: ExchangeKind::Binance,
        symbol: order["s"].as_str()?.to_string(),
        status: map_status(order["X"].as_str()?),
        filled_quantity: decimal_field(order, "z"),
        avg_fill_price: if avg.is_zero() { None } else { Some(avg) },
        error: None,
        timestamp: Utc::now(),
    };
    debug!(client_key = %result.client_key, status = ?result.status, "binance order update");
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_classify_rate_limit() {
        let err = classify_error(StatusCode::TOO_MANY_REQUESTS, &json!({"code": -1003}));
        assert!(matches!(err, SigtradeError::RateLimited { .. }));
    }

    #[test]
    fn test_classify_margin_and_precision() {
        let err = classify_error(
            StatusCode::BAD_REQUEST,
            &json!({"code": -2019, "msg": "Margin is insufficient."}),
        );
        assert!(matches!(err, SigtradeError::InsufficientFunds(_)));

        let err = classify_error(
            StatusCode::BAD_REQUEST,
            &json!({"code": -1111, "msg": "Precision is over the maximum."}),
        );
        assert!(matches!(err, SigtradeError::InvalidSymbolOrPrecision(_)));
    }

    #[test]
    fn test_classify_server_error_is_transient() {
        let err = classify_error(StatusCode::BAD_GATEWAY, &json!({}));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_parse_order_response() {
        let body = json!({
            "clientOrderId": "st-abc-entry-0",
            "orderId": 123456,
            "symbol": "BTCUSDT",
            "status": "PARTIALLY_FILLED",
            "executedQty": "0.050",
            "avgPrice": "60000.0"
        });
        let result = parse_order(&body);
        assert_eq!(result.client_key, "st-abc-entry-0");
        assert_eq!(result.status, OrderStatus::PartiallyFilled);
        assert_eq!(result.filled_quantity, dec!(0.050));
        assert_eq!(result.avg_fill_price, Some(dec!(60000.0)));
    }

    #[test]
    fn test_parse_user_data_event() {
        let text = json!({
            "e": "ORDER_TRADE_UPDATE",
            "o": {
                "c": "st-abc-tp0-0",
                "i": 7,
                "s": "BTCUSDT",
                "X": "FILLED",
                "z": "0.0833",
                "ap": "61000.0"
            }
        })
        .to_string();
        let result = parse_user_data_event(&text).unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.filled_quantity, dec!(0.0833));

        assert!(parse_user_data_event(r#"{"e":"ACCOUNT_UPDATE"}"#).is_none());
    }
}
