//! Order primitives. Intents are requests the engine wants executed;
//! results are facts reported by a venue. Nothing downstream assumes an
//! intent succeeded until a result says so.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::venue::ExchangeKind;

/// Direction of the position itself, as stated by the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    /// Order side that opens the position.
    pub fn entry_side(&self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces the position.
    pub fn exit_side(&self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    /// Triggered market order used for protective stops.
    StopMarket,
    /// Triggered market order used for take-profit exits.
    TakeProfitMarket,
}

/// Why the engine wants this order. Carried on the intent so fills can be
/// routed back to the right lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPurpose {
    Entry,
    TakeProfit { target: usize },
    StopLoss,
    /// Immediate market close (manual command or risk-forced).
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Accepted | Self::PartiallyFilled)
    }
}

/// A logical order to place. The client key is deterministic per logical
/// intent so a resubmission after an ambiguous failure maps to the same
/// venue order instead of a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub client_key: String,
    pub position_id: Uuid,
    pub venue: ExchangeKind,
    pub account: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Limit price; `None` for market orders.
    pub price: Option<Decimal>,
    /// Trigger price for stop / take-profit market orders.
    pub trigger_price: Option<Decimal>,
    /// Exit intents only reduce, never flip, the position.
    pub reduce_only: bool,
    pub purpose: OrderPurpose,
}

impl OrderIntent {
    /// Deterministic client key for an intent. `seq` distinguishes
    /// successive orders with the same purpose (stop-loss replacements).
    pub fn client_key_for(position_id: &Uuid, purpose: OrderPurpose, seq: u32) -> String {
        let pos = &position_id.simple().to_string()[..12];
        match purpose {
            OrderPurpose::Entry => format!("st-{}-entry-{}", pos, seq),
            OrderPurpose::TakeProfit { target } => format!("st-{}-tp{}-{}", pos, target, seq),
            OrderPurpose::StopLoss => format!("st-{}-sl-{}", pos, seq),
            OrderPurpose::Close => format!("st-{}-close-{}", pos, seq),
        }
    }

    pub fn notional(&self) -> Option<Decimal> {
        self.price
            .or(self.trigger_price)
            .map(|p| p * self.quantity)
    }
}

/// Venue-reported order state. The only thing the lifecycle engine trusts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub client_key: String,
    pub venue_order_id: Option<String>,
    pub venue: ExchangeKind,
    pub symbol: String,
    pub status: OrderStatus,
    /// Cumulative filled quantity reported by the venue, not a delta.
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OrderResult {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }
}
