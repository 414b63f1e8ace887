mod common;

use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

use sigtrade::config::RiskConfig;
use sigtrade::domain::{ExchangeKind, PositionState, Side, TradeSignal};
use sigtrade::exchange::PaperExchange;
use sigtrade::notify::NotificationKind;
use sigtrade::persistence::InMemoryStore;

use common::*;

fn eth_long_signal() -> TradeSignal {
    TradeSignal {
        exchange: ExchangeKind::Paper,
        account: "default".to_string(),
        symbol: "ETHUSDT".to_string(),
        side: Side::Long,
        entry: Some(dec!(3000)),
        entry_zones: Vec::new(),
        stop_loss: Some(dec!(2800)),
        take_profits: vec![(dec!(3100), dec!(0.5)), (dec!(3200), dec!(0.5))],
        position_size_quote: dec!(3000),
        leverage: Some(1),
        margin_mode: None,
    }
}

#[tokio::test]
async fn loss_floor_breach_forces_closes_largest_loss_first() {
    let mut config = test_config();
    config.risk = RiskConfig {
        check_interval_secs: 1,
        max_total_exposure: dec!(1000000),
        max_unrealized_loss: dec!(50),
    };

    let store = InMemoryStore::default();
    let paper = Arc::new(PaperExchange::new(dec!(100000)));
    let coordinator = coordinator_with_paper(config, store.clone(), paper.clone()).await;

    let btc_id = coordinator.submit_signal(&btc_long_signal()).await.unwrap();
    fill_and_route(&coordinator, &paper, &entry_key(&btc_id), dec!(0.1), dec!(60000)).await;

    let eth_id = coordinator.submit_signal(&eth_long_signal()).await.unwrap();
    fill_and_route(&coordinator, &paper, &entry_key(&eth_id), dec!(1), dec!(3000)).await;

    // BTC is down 100, ETH is down 400; the floor sits at -50.
    paper.set_mark_price("BTCUSDT", dec!(59000)).await;
    paper.set_mark_price("ETHUSDT", dec!(2600)).await;

    let mut notifications = coordinator.notifier().subscribe();
    coordinator.run_risk_check().await.unwrap();

    let mut forced: Vec<Uuid> = Vec::new();
    while let Ok(notification) = notifications.try_recv() {
        if matches!(notification.kind, NotificationKind::RiskForcedClose { .. }) {
            forced.push(notification.position_id);
        }
    }
    assert_eq!(forced, vec![eth_id, btc_id], "largest loss closed first");

    // Both positions are flattening: exits canceled, market closes out.
    for (id, qty, mark) in [(eth_id, dec!(1), dec!(2600)), (btc_id, dec!(0.1), dec!(59000))] {
        fill_and_route(&coordinator, &paper, &close_key(&id), qty, mark).await;
        assert!(coordinator.position_snapshot(id).await.is_none());
    }
    assert!(paper.open_orders().await.is_empty());
}

#[tokio::test]
async fn healthy_book_triggers_no_forced_closes() {
    let store = InMemoryStore::default();
    let paper = Arc::new(PaperExchange::new(dec!(100000)));
    let coordinator = coordinator_with_paper(test_config(), store.clone(), paper.clone()).await;

    let id = coordinator.submit_signal(&btc_long_signal()).await.unwrap();
    fill_and_route(&coordinator, &paper, &entry_key(&id), dec!(0.1), dec!(60000)).await;
    paper.set_mark_price("BTCUSDT", dec!(60500)).await;

    let mut notifications = coordinator.notifier().subscribe();
    coordinator.run_risk_check().await.unwrap();

    while let Ok(notification) = notifications.try_recv() {
        assert!(
            !matches!(notification.kind, NotificationKind::RiskForcedClose { .. }),
            "no forced close expected"
        );
    }
    let snapshot = coordinator.position_snapshot(id).await.expect("still open");
    assert_eq!(snapshot.state, PositionState::Open);
}
