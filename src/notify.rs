//! Outbound lifecycle events. The engine reports what happened; rendering
//! and delivery belong to whatever subscribes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationKind {
    Entered {
        quantity: Decimal,
        avg_price: Decimal,
    },
    TpHit {
        target: usize,
        quantity: Decimal,
        price: Decimal,
    },
    SlMoved {
        price: Decimal,
    },
    StoppedOut {
        quantity: Decimal,
        price: Decimal,
    },
    Closed {
        realized_pnl: Decimal,
    },
    Rejected {
        reason: String,
    },
    Paused,
    Resumed,
    RiskForcedClose {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionNotification {
    pub position_id: Uuid,
    pub symbol: String,
    pub kind: NotificationKind,
    pub timestamp: DateTime<Utc>,
}

impl PositionNotification {
    pub fn new(position_id: Uuid, symbol: impl Into<String>, kind: NotificationKind) -> Self {
        Self {
            position_id,
            symbol: symbol.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out hub for lifecycle notifications. Every event is also logged,
/// so terminal failures are visible even with no subscriber attached.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<PositionNotification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PositionNotification> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notification: PositionNotification) {
        info!(
            position_id = %notification.position_id,
            symbol = %notification.symbol,
            kind = ?notification.kind,
            "position event"
        );
        // No subscribers is fine; the log line above is the floor.
        let _ = self.tx.send(notification);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
