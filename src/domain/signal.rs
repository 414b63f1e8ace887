use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::Side;
use super::venue::ExchangeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Cross,
    Isolated,
}

impl Default for MarginMode {
    fn default() -> Self {
        Self::Cross
    }
}

/// Structured trade intent handed to us by the upstream parser. Prices and
/// targets may be partially specified; plan construction fills in defaults
/// and rejects anything inconsistent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub exchange: ExchangeKind,
    pub account: String,
    pub symbol: String,
    pub side: Side,
    /// Single entry price. Mutually exclusive with `entry_zones`.
    #[serde(default)]
    pub entry: Option<Decimal>,
    /// Laddered entry levels `(price, fraction)`; fractions are normalized
    /// to sum to 1.0 during plan construction.
    #[serde(default)]
    pub entry_zones: Vec<(Decimal, Decimal)>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    /// Take-profit levels `(price, allocation)`. Empty means derive
    /// defaults from the configured R multiples.
    #[serde(default)]
    pub take_profits: Vec<(Decimal, Decimal)>,
    /// Position size in quote currency (margin to commit).
    pub position_size_quote: Decimal,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub margin_mode: Option<MarginMode>,
}
