mod common;

use rust_decimal_macros::dec;
use std::sync::Arc;

use sigtrade::domain::PositionState;
use sigtrade::exchange::PaperExchange;
use sigtrade::persistence::{InMemoryStore, PositionStore};

use common::*;

/// A take-profit that filled while the process was down is absorbed on
/// restart from the venue's cumulative quantities, and the break-even
/// stop move still happens.
#[tokio::test]
async fn recovery_absorbs_downtime_take_profit() {
    let store = InMemoryStore::default();
    let paper = Arc::new(PaperExchange::new(dec!(100000)));

    let id = {
        let coordinator =
            coordinator_with_paper(test_config(), store.clone(), paper.clone()).await;
        let id = coordinator.submit_signal(&btc_long_signal()).await.unwrap();
        fill_and_route(&coordinator, &paper, &entry_key(&id), dec!(0.1), dec!(60000)).await;
        id
    };

    // Process goes down; TP1 fills on the venue with nobody listening.
    paper
        .fill(&tp_key(&id, 0), dec!(0.05), dec!(61000))
        .await
        .unwrap();

    let coordinator = coordinator_with_paper(test_config(), store.clone(), paper.clone()).await;
    let recovered = coordinator.recover().await.unwrap();
    assert_eq!(recovered, 1);

    let snapshot = coordinator.position_snapshot(id).await.expect("tracked");
    assert_eq!(snapshot.state, PositionState::PartiallyClosed);
    assert_eq!(snapshot.remaining_quantity, dec!(0.05));
    assert_eq!(snapshot.realized_pnl, dec!(50));
    let stop = snapshot.stop_loss.as_ref().expect("stop replaced");
    assert_eq!(stop.price, dec!(60000));
    assert_eq!(stop.client_key, sl_key(&id, 1));

    let open_keys: Vec<String> = paper
        .open_orders()
        .await
        .into_iter()
        .map(|o| o.client_key)
        .collect();
    assert!(open_keys.contains(&sl_key(&id, 1)));
    assert!(open_keys.contains(&tp_key(&id, 1)));
    assert!(!open_keys.contains(&sl_key(&id, 0)));
}

/// If the venue shows the position flat on restart, the local copy
/// closes and every working order is canceled.
#[tokio::test]
async fn recovery_closes_position_flat_on_venue() {
    let store = InMemoryStore::default();
    let paper = Arc::new(PaperExchange::new(dec!(100000)));

    let id = {
        let coordinator =
            coordinator_with_paper(test_config(), store.clone(), paper.clone()).await;
        let id = coordinator.submit_signal(&btc_long_signal()).await.unwrap();
        fill_and_route(&coordinator, &paper, &entry_key(&id), dec!(0.1), dec!(60000)).await;
        id
    };

    // Both exits fill during the downtime, flattening the venue side.
    paper
        .fill(&tp_key(&id, 0), dec!(0.05), dec!(61000))
        .await
        .unwrap();
    paper
        .fill(&sl_key(&id, 0), dec!(0.05), dec!(58000))
        .await
        .unwrap();

    let coordinator = coordinator_with_paper(test_config(), store.clone(), paper.clone()).await;
    coordinator.recover().await.unwrap();

    assert!(coordinator.position_snapshot(id).await.is_none(), "retired");
    let stored = store.load_position(id).await.unwrap().expect("persisted");
    assert!(stored.state.is_terminal());
    assert_eq!(stored.remaining_quantity, dec!(0));
}

/// Recovery with nothing new on the venue leaves the position as it was.
#[tokio::test]
async fn recovery_is_a_no_op_when_nothing_changed() {
    let store = InMemoryStore::default();
    let paper = Arc::new(PaperExchange::new(dec!(100000)));

    let id = {
        let coordinator =
            coordinator_with_paper(test_config(), store.clone(), paper.clone()).await;
        let id = coordinator.submit_signal(&btc_long_signal()).await.unwrap();
        fill_and_route(&coordinator, &paper, &entry_key(&id), dec!(0.1), dec!(60000)).await;
        id
    };

    let coordinator = coordinator_with_paper(test_config(), store.clone(), paper.clone()).await;
    coordinator.recover().await.unwrap();

    let snapshot = coordinator.position_snapshot(id).await.expect("tracked");
    assert_eq!(snapshot.state, PositionState::Open);
    assert_eq!(snapshot.remaining_quantity, dec!(0.1));
    assert_eq!(snapshot.stop_loss.as_ref().map(|s| s.price), Some(dec!(58000)));

    // And fills still route after recovery.
    fill_and_route(&coordinator, &paper, &tp_key(&id, 0), dec!(0.05), dec!(61000)).await;
    let snapshot = coordinator.position_snapshot(id).await.expect("tracked");
    assert_eq!(snapshot.state, PositionState::PartiallyClosed);
}
