#![allow(dead_code)]

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

use sigtrade::config::{AppConfig, RiskConfig};
use sigtrade::coordinator::TradeCoordinator;
use sigtrade::domain::{ExchangeKind, OrderIntent, OrderPurpose, Side, TradeSignal};
use sigtrade::exchange::PaperExchange;
use sigtrade::notify::Notifier;
use sigtrade::persistence::InMemoryStore;

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default_config();
    // The canned scenarios use tight take-profits relative to the stop.
    config.policy.min_risk_reward = dec!(0.4);
    config.risk = RiskConfig {
        check_interval_secs: 1,
        max_total_exposure: dec!(1000000),
        max_unrealized_loss: dec!(10000),
    };
    config
}

pub async fn coordinator_with_paper(
    config: AppConfig,
    store: InMemoryStore,
    paper: Arc<PaperExchange>,
) -> Arc<TradeCoordinator> {
    let coordinator = Arc::new(TradeCoordinator::new(
        config,
        Arc::new(store),
        Notifier::new(),
    ));
    coordinator
        .register_account(ExchangeKind::Paper, "default", paper, 0)
        .await;
    coordinator
}

/// Long BTCUSDT: entry 60000, stop 58000, take profits at 61000 and
/// 63000 for half the position each. 6000 quote at 1x gives qty 0.1.
pub fn btc_long_signal() -> TradeSignal {
    TradeSignal {
        exchange: ExchangeKind::Paper,
        account: "default".to_string(),
        symbol: "BTCUSDT".to_string(),
        side: Side::Long,
        entry: Some(dec!(60000)),
        entry_zones: Vec::new(),
        stop_loss: Some(dec!(58000)),
        take_profits: vec![(dec!(61000), dec!(0.5)), (dec!(63000), dec!(0.5))],
        position_size_quote: dec!(6000),
        leverage: Some(1),
        margin_mode: None,
    }
}

pub fn entry_key(position_id: &Uuid) -> String {
    OrderIntent::client_key_for(position_id, OrderPurpose::Entry, 0)
}

pub fn tp_key(position_id: &Uuid, target: usize) -> String {
    OrderIntent::client_key_for(position_id, OrderPurpose::TakeProfit { target }, 0)
}

pub fn sl_key(position_id: &Uuid, seq: u32) -> String {
    OrderIntent::client_key_for(position_id, OrderPurpose::StopLoss, seq)
}

pub fn close_key(position_id: &Uuid) -> String {
    OrderIntent::client_key_for(position_id, OrderPurpose::Close, 0)
}

/// Fill a paper order and route the resulting update as the fill stream
/// would.
pub async fn fill_and_route(
    coordinator: &TradeCoordinator,
    paper: &PaperExchange,
    client_key: &str,
    qty: Decimal,
    price: Decimal,
) {
    let result = paper
        .fill(client_key, qty, price)
        .await
        .unwrap_or_else(|e| panic!("paper fill {} failed: {}", client_key, e));
    coordinator.handle_order_update(result).await;
}
