//! Venue capability surface. One implementation per exchange; the
//! lifecycle engine only ever talks to this trait.

use async_trait::async_trait;
use futures_util::Stream;
use rust_decimal::Decimal;
use std::pin::Pin;

use crate::domain::{ExchangeKind, OrderIntent, OrderResult};
use crate::error::{Result, SigtradeError};

use super::filters::SymbolFilters;

/// Lazy, infinite sequence of venue order updates. Restartable: dropping
/// the stream and calling `fill_stream` again resumes from live state.
pub type FillStream = Pin<Box<dyn Stream<Item = OrderResult> + Send>>;

/// Venue-reported net position for a symbol. Quantity is signed: positive
/// long, negative short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenuePosition {
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance {
    pub available: Decimal,
    pub total: Decimal,
}

/// Capability set implemented per venue. All methods classify venue
/// failures into the crate error taxonomy rather than leaking raw
/// transport errors; callers branch on classification, never on payloads.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    /// Submit an order. The intent's client key becomes the venue client
    /// order id, so a later `order_status` lookup by the same key finds it.
    /// Quantity and price must already be step-rounded via
    /// `symbol_filters`; adapters reject unrounded values.
    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderResult>;

    /// Best-effort cancel by client key. Returns `false` when the venue no
    /// longer knows the order as cancellable (already filled or canceled).
    async fn cancel_order(&self, symbol: &str, client_key: &str) -> Result<bool>;

    /// Look up an order by client key. `None` means the venue has no
    /// record of the key.
    async fn order_status(&self, symbol: &str, client_key: &str) -> Result<Option<OrderResult>>;

    /// Venue-authoritative net position for a symbol.
    async fn position(&self, symbol: &str) -> Result<VenuePosition>;

    async fn balance(&self) -> Result<Balance>;

    async fn mark_price(&self, symbol: &str) -> Result<Decimal>;

    /// Tick/step/minimum constraints for a symbol, for pre-submission
    /// rounding. Implementations cache these.
    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters>;

    /// Set leverage, clamped to the venue maximum. Returns the effective
    /// value.
    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<u32> {
        Err(self.unsupported("set_leverage"))
    }

    /// Subscribe to live order updates for this account.
    async fn fill_stream(&self) -> Result<FillStream>;

    fn unsupported(&self, operation: &str) -> SigtradeError {
        SigtradeError::Unsupported {
            venue: self.kind().to_string(),
            operation: operation.to_string(),
        }
    }
}
