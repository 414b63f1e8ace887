//! In-memory store used by tests and dry runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::Position;
use crate::error::Result;

use super::store::PositionStore;

#[derive(Clone, Default)]
pub struct InMemoryStore {
    positions: Arc<RwLock<HashMap<Uuid, Position>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.positions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.positions.read().await.is_empty()
    }
}

#[async_trait]
impl PositionStore for InMemoryStore {
    async fn save_position(&self, position: &Position) -> Result<()> {
        self.positions
            .write()
            .await
            .insert(position.id, position.clone());
        Ok(())
    }

    async fn load_open_positions(&self) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .read()
            .await
            .values()
            .filter(|p| !p.is_terminal())
            .cloned()
            .collect())
    }

    async fn load_position(&self, id: Uuid) -> Result<Option<Position>> {
        Ok(self.positions.read().await.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::domain::{ExchangeKind, PositionState, Side, TradePlan, TradeSignal};
    use rust_decimal_macros::dec;

    fn test_position() -> Position {
        let signal = TradeSignal {
            exchange: ExchangeKind::Paper,
            account: "main".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            entry: Some(dec!(60000)),
            entry_zones: vec![],
            stop_loss: Some(dec!(58000)),
            take_profits: vec![(dec!(61000), dec!(1.0))],
            position_size_quote: dec!(1000),
            leverage: Some(1),
            margin_mode: None,
        };
        let policy = PolicyConfig {
            min_risk_reward: dec!(0.4),
            ..PolicyConfig::default()
        };
        Position::new(TradePlan::from_signal(&signal, &policy).unwrap())
    }

    #[tokio::test]
    async fn test_upsert_and_load() {
        let store = InMemoryStore::new();
        let mut position = test_position();
        store.save_position(&position).await.unwrap();
        store.save_position(&position).await.unwrap();
        assert_eq!(store.len().await, 1);

        let open = store.load_open_positions().await.unwrap();
        assert_eq!(open.len(), 1);

        position.state = PositionState::Closed;
        store.save_position(&position).await.unwrap();
        assert!(store.load_open_positions().await.unwrap().is_empty());
        assert!(store.load_position(position.id).await.unwrap().is_some());
    }
}
