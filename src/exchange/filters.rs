//! Per-symbol precision constraints. Every quantity and price is rounded
//! here before an adapter ever sees it; venues reject raw values.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SigtradeError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub symbol: String,
    /// Price increment.
    pub tick_size: Decimal,
    /// Quantity increment.
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

impl SymbolFilters {
    /// Round a price down to the symbol's tick.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        round_to_increment(price, self.tick_size)
    }

    /// Round a quantity down to the symbol's step. Always rounds toward
    /// zero so a rounded exit never exceeds the remaining quantity.
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        round_to_increment(qty, self.step_size)
    }

    /// Validate a rounded quantity against the symbol minimums. Market
    /// orders carry no reference price; the venue enforces notional at
    /// match time for those.
    pub fn validate(&self, qty: Decimal, reference_price: Option<Decimal>) -> Result<()> {
        if qty < self.min_qty {
            return Err(SigtradeError::InvalidSymbolOrPrecision(format!(
                "{}: quantity {} below minimum {}",
                self.symbol, qty, self.min_qty
            )));
        }
        if let Some(price) = reference_price {
            let notional = qty * price;
            if notional < self.min_notional {
                return Err(SigtradeError::InvalidSymbolOrPrecision(format!(
                    "{}: notional {} below minimum {}",
                    self.symbol, notional, self.min_notional
                )));
            }
        }
        Ok(())
    }
}

fn round_to_increment(value: Decimal, increment: Decimal) -> Decimal {
    if increment.is_zero() {
        return value;
    }
    (value / increment).floor() * increment
}
