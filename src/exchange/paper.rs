//! Simulated venue. Deterministic, in-process, with explicit fill and
//! failure injection; used by dry runs and the integration tests.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::domain::{ExchangeKind, OrderIntent, OrderResult, OrderSide, OrderStatus};
use crate::error::{Result, SigtradeError};

use super::filters::SymbolFilters;
use super::traits::{Balance, ExchangeAdapter, FillStream, VenuePosition};

const FILL_CHANNEL_CAPACITY: usize = 256;
const PAPER_MAX_LEVERAGE: u32 = 125;

#[derive(Debug, Clone)]
struct PaperOrder {
    intent: OrderIntent,
    status: OrderStatus,
    filled_quantity: Decimal,
    avg_fill_price: Option<Decimal>,
}

impl PaperOrder {
    fn snapshot(&self) -> OrderResult {
        OrderResult {
            client_key: self.intent.client_key.clone(),
            venue_order_id: Some(format!("paper-{}", self.intent.client_key)),
            venue: ExchangeKind::Paper,
            symbol: self.intent.symbol.clone(),
            status: self.status,
            filled_quantity: self.filled_quantity,
            avg_fill_price: self.avg_fill_price,
            error: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Default)]
struct Inner {
    orders: HashMap<String, PaperOrder>,
    /// Signed net quantity and average entry per symbol.
    positions: HashMap<String, (Decimal, Decimal)>,
    marks: HashMap<String, Decimal>,
    leverage: HashMap<String, u32>,
    available: Decimal,
    /// Errors to surface on upcoming calls, oldest first.
    fail_queue: VecDeque<SigtradeError>,
}

#[derive(Clone)]
pub struct PaperExchange {
    inner: Arc<Mutex<Inner>>,
    fills_tx: broadcast::Sender<OrderResult>,
}

impl PaperExchange {
    pub fn new(starting_balance: Decimal) -> Self {
        let (fills_tx, _) = broadcast::channel(FILL_CHANNEL_CAPACITY);
        let inner = Inner {
            available: starting_balance,
            ..Inner::default()
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
            fills_tx,
        }
    }

    pub async fn set_mark_price(&self, symbol: &str, price: Decimal) {
        self.inner.lock().await.marks.insert(symbol.to_string(), price);
    }

    /// Queue an error to be returned by the next adapter call.
    pub async fn fail_next(&self, err: SigtradeError) {
        self.inner.lock().await.fail_queue.push_back(err);
    }

    pub async fn open_orders(&self) -> Vec<OrderResult> {
        self.inner
            .lock()
            .await
            .orders
            .values()
            .filter(|o| o.status.is_active())
            .map(|o| o.snapshot())
            .collect()
    }

    pub async fn order_count(&self) -> usize {
        self.inner.lock().await.orders.len()
    }

    /// Fill (or partially fill) a working order and broadcast the update.
    pub async fn fill(&self, client_key: &str, qty: Decimal, price: Decimal) -> Result<OrderResult> {
        let result = {
            let mut inner = self.inner.lock().await;
            let order = inner.orders.get_mut(client_key).ok_or_else(|| {
                SigtradeError::internal(format!("paper: no such order {}", client_key))
            })?;
            if order.status.is_terminal() {
                return Err(SigtradeError::internal(format!(
                    "paper: order {} already terminal",
                    client_key
                )));
            }

            let prev_filled = order.filled_quantity;
            let new_filled = prev_filled + qty;
            let prev_avg = order.avg_fill_price.unwrap_or(Decimal::ZERO);
            order.avg_fill_price = Some((prev_avg * prev_filled + price * qty) / new_filled);
            order.filled_quantity = new_filled;
            order.status = if new_filled >= order.intent.quantity {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };

            let signed = match order.intent.side {
                OrderSide::Buy => qty,
                OrderSide::Sell => -qty,
            };
            let snapshot = order.snapshot();
            let symbol = order.intent.symbol.clone();
            let entry = (Decimal::ZERO, Decimal::ZERO);
            let (pos_qty, pos_avg) = *inner.positions.get(&symbol).unwrap_or(&entry);
            let new_qty = pos_qty + signed;
            let same_direction = pos_qty.is_sign_positive() == signed.is_sign_positive();
            let new_avg = if pos_qty.is_zero() || same_direction {
                let gross = pos_avg * pos_qty.abs() + price * qty;
                let denom = pos_qty.abs() + qty;
                if denom.is_zero() {
                    Decimal::ZERO
                } else {
                    gross / denom
                }
            } else {
                // Reducing fills keep the original entry basis.
                if new_qty.is_zero() {
                    Decimal::ZERO
                } else {
                    pos_avg
                }
            };
            inner.positions.insert(symbol, (new_qty, new_avg));
            snapshot
        };

        debug!(client_key, %qty, %price, "paper fill");
        // Send fails only when nothing subscribes; fills are still
        // observable through order_status.
        let _ = self.fills_tx.send(result.clone());
        Ok(result)
    }

    /// Reject a working order, as a venue business-rule rejection would.
    pub async fn reject(&self, client_key: &str, reason: &str) -> Result<OrderResult> {
        let result = {
            let mut inner = self.inner.lock().await;
            let order = inner.orders.get_mut(client_key).ok_or_else(|| {
                SigtradeError::internal(format!("paper: no such order {}", client_key))
            })?;
            order.status = OrderStatus::Rejected;
            let mut snapshot = order.snapshot();
            snapshot.error = Some(reason.to_string());
            snapshot
        };
        let _ = self.fills_tx.send(result.clone());
        Ok(result)
    }

    async fn take_injected_failure(&self) -> Option<SigtradeError> {
        self.inner.lock().await.fail_queue.pop_front()
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Paper
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderResult> {
        if let Some(err) = self.take_injected_failure().await {
            return Err(err);
        }
        let mut inner = self.inner.lock().await;
        // Duplicate client keys map to the existing order, matching the
        // idempotent submission contract.
        if let Some(existing) = inner.orders.get(&intent.client_key) {
            return Ok(existing.snapshot());
        }
        let order = PaperOrder {
            intent: intent.clone(),
            status: OrderStatus::Accepted,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
        };
        let snapshot = order.snapshot();
        inner.orders.insert(intent.client_key.clone(), order);
        Ok(snapshot)
    }

    async fn cancel_order(&self, _symbol: &str, client_key: &str) -> Result<bool> {
        if let Some(err) = self.take_injected_failure().await {
            return Err(err);
        }
        let mut inner = self.inner.lock().await;
        match inner.orders.get_mut(client_key) {
            Some(order) if order.status.is_active() => {
                order.status = OrderStatus::Canceled;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn order_status(&self, _symbol: &str, client_key: &str) -> Result<Option<OrderResult>> {
        if let Some(err) = self.take_injected_failure().await {
            return Err(err);
        }
        Ok(self
            .inner
            .lock()
            .await
            .orders
            .get(client_key)
            .map(|o| o.snapshot()))
    }

    async fn position(&self, symbol: &str) -> Result<VenuePosition> {
        let inner = self.inner.lock().await;
        let (quantity, avg_price) = inner
            .positions
            .get(symbol)
            .copied()
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));
        Ok(VenuePosition {
            symbol: symbol.to_string(),
            quantity,
            avg_price,
        })
    }

    async fn balance(&self) -> Result<Balance> {
        let inner = self.inner.lock().await;
        Ok(Balance {
            available: inner.available,
            total: inner.available,
        })
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal> {
        self.inner
            .lock()
            .await
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| SigtradeError::transient(format!("paper: no mark price for {}", symbol)))
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        Ok(SymbolFilters {
            symbol: symbol.to_string(),
            tick_size: dec!(0.1),
            step_size: dec!(0.0001),
            min_qty: dec!(0.0001),
            min_notional: dec!(1),
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<u32> {
        let effective = leverage.min(PAPER_MAX_LEVERAGE);
        self.inner
            .lock()
            .await
            .leverage
            .insert(symbol.to_string(), effective);
        Ok(effective)
    }

    async fn fill_stream(&self) -> Result<FillStream> {
        let rx = self.fills_tx.subscribe();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(result) => return Some((result, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "paper fill stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
