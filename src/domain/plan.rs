//! Plan construction and validation. A signal becomes a `TradePlan` exactly
//! once; revised signals produce new plans. All invariant checks happen
//! here, before any order is placed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PolicyConfig;
use crate::error::{Result, SigtradeError};

use super::order::Side;
use super::signal::{MarginMode, TradeSignal};
use super::venue::ExchangeKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EntryZone {
    pub price: Decimal,
    /// Fraction of total quantity entered at this level; zones sum to 1.0.
    pub fraction: Decimal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TakeProfitTarget {
    pub price: Decimal,
    /// Fraction of total quantity closed at this target.
    pub allocation: Decimal,
}

/// Immutable trade intent. Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradePlan {
    pub id: Uuid,
    pub venue: ExchangeKind,
    pub account: String,
    pub symbol: String,
    pub side: Side,
    pub entry_zones: Vec<EntryZone>,
    pub take_profits: Vec<TakeProfitTarget>,
    pub stop_loss: Decimal,
    /// Total base quantity to enter across all zones.
    pub quantity: Decimal,
    pub leverage: u32,
    pub margin_mode: MarginMode,
    pub created_at: DateTime<Utc>,
}

/// Default take-profit ladder when the signal names none, expressed as
/// (R multiple, allocation).
const DEFAULT_TP_LADDER: [(u32, &str); 3] = [(2, "0.4"), (3, "0.3"), (4, "0.3")];

impl TradePlan {
    /// Validate a signal and derive a plan from it. Rejected signals never
    /// reach the executor.
    pub fn from_signal(signal: &TradeSignal, policy: &PolicyConfig) -> Result<TradePlan> {
        if signal.symbol.trim().is_empty() {
            return Err(SigtradeError::validation("symbol must not be empty"));
        }
        if signal.position_size_quote <= Decimal::ZERO {
            return Err(SigtradeError::validation("position size must be positive"));
        }

        let entry_zones = Self::resolve_entry_zones(signal)?;
        let avg_entry = weighted_entry(&entry_zones);

        let stop_loss = Self::resolve_stop_loss(signal, policy, avg_entry)?;
        let take_profits = Self::resolve_take_profits(signal, avg_entry, stop_loss)?;
        Self::check_risk_reward(policy, signal.side, avg_entry, stop_loss, &take_profits)?;

        let leverage = signal.leverage.unwrap_or(policy.default_leverage).max(1);
        let quantity = signal.position_size_quote * Decimal::from(leverage) / avg_entry;

        Ok(TradePlan {
            id: Uuid::new_v4(),
            venue: signal.exchange,
            account: signal.account.clone(),
            symbol: signal.symbol.to_uppercase(),
            side: signal.side,
            entry_zones,
            take_profits,
            stop_loss,
            quantity,
            leverage,
            margin_mode: signal.margin_mode.unwrap_or_default(),
            created_at: Utc::now(),
        })
    }

    fn resolve_entry_zones(signal: &TradeSignal) -> Result<Vec<EntryZone>> {
        if !signal.entry_zones.is_empty() {
            let total: Decimal = signal.entry_zones.iter().map(|(_, f)| *f).sum();
            if total <= Decimal::ZERO {
                return Err(SigtradeError::validation(
                    "entry zone fractions must sum to a positive value",
                ));
            }
            let mut zones = Vec::with_capacity(signal.entry_zones.len());
            for (price, fraction) in &signal.entry_zones {
                if *price <= Decimal::ZERO || *fraction <= Decimal::ZERO {
                    return Err(SigtradeError::validation(
                        "entry zone prices and fractions must be positive",
                    ));
                }
                zones.push(EntryZone {
                    price: *price,
                    fraction: fraction / total,
                });
            }
            return Ok(zones);
        }

        match signal.entry {
            Some(price) if price > Decimal::ZERO => Ok(vec![EntryZone {
                price,
                fraction: Decimal::ONE,
            }]),
            Some(_) => Err(SigtradeError::validation("entry price must be positive")),
            None => Err(SigtradeError::validation(
                "signal must carry an entry price or entry zones",
            )),
        }
    }

    fn resolve_stop_loss(
        signal: &TradeSignal,
        policy: &PolicyConfig,
        avg_entry: Decimal,
    ) -> Result<Decimal> {
        let stop_loss = match signal.stop_loss {
            Some(sl) => sl,
            None => match signal.side {
                Side::Long => avg_entry * (Decimal::ONE - policy.default_sl_distance_pct),
                Side::Short => avg_entry * (Decimal::ONE + policy.default_sl_distance_pct),
            },
        };

        let valid = match signal.side {
            Side::Long => stop_loss < avg_entry,
            Side::Short => stop_loss > avg_entry,
        };
        if !valid || stop_loss <= Decimal::ZERO {
            return Err(SigtradeError::validation(format!(
                "stop loss {} is on the wrong side of entry {} for a {} position",
                stop_loss,
                avg_entry,
                signal.side.as_str()
            )));
        }
        Ok(stop_loss)
    }

    fn resolve_take_profits(
        signal: &TradeSignal,
        avg_entry: Decimal,
        stop_loss: Decimal,
    ) -> Result<Vec<TakeProfitTarget>> {
        if signal.take_profits.is_empty() {
            let risk = (avg_entry - stop_loss).abs();
            return Ok(DEFAULT_TP_LADDER
                .iter()
                .map(|(r, alloc)| {
                    let distance = risk * Decimal::from(*r);
                    let price = match signal.side {
                        Side::Long => avg_entry + distance,
                        Side::Short => avg_entry - distance,
                    };
                    TakeProfitTarget {
                        price,
                        // Constant table entries, always parseable.
                        allocation: alloc.parse().unwrap_or(Decimal::ZERO),
                    }
                })
                .collect());
        }

        let mut targets = Vec::with_capacity(signal.take_profits.len());
        let mut prev_price: Option<Decimal> = None;
        for (price, allocation) in &signal.take_profits {
            if *allocation <= Decimal::ZERO {
                return Err(SigtradeError::validation(
                    "take-profit allocations must be positive",
                ));
            }
            let in_profit = match signal.side {
                Side::Long => *price > avg_entry,
                Side::Short => *price < avg_entry,
            };
            if !in_profit {
                return Err(SigtradeError::validation(format!(
                    "take-profit {} is not in profit direction from entry {}",
                    price, avg_entry
                )));
            }
            if let Some(prev) = prev_price {
                let ordered = match signal.side {
                    Side::Long => *price > prev,
                    Side::Short => *price < prev,
                };
                if !ordered {
                    return Err(SigtradeError::validation(
                        "take-profit targets must be ordered away from entry",
                    ));
                }
            }
            prev_price = Some(*price);
            targets.push(TakeProfitTarget {
                price: *price,
                allocation: *allocation,
            });
        }

        let total: Decimal = targets.iter().map(|t| t.allocation).sum();
        if total > Decimal::ONE {
            return Err(SigtradeError::validation(format!(
                "take-profit allocations sum to {}, must not exceed 1.0",
                total
            )));
        }
        Ok(targets)
    }

    fn check_risk_reward(
        policy: &PolicyConfig,
        side: Side,
        avg_entry: Decimal,
        stop_loss: Decimal,
        take_profits: &[TakeProfitTarget],
    ) -> Result<()> {
        let risk = (avg_entry - stop_loss).abs();
        if risk.is_zero() {
            return Err(SigtradeError::validation("stop loss equals entry"));
        }
        let first_tp = match take_profits.first() {
            Some(t) => t.price,
            None => return Err(SigtradeError::validation("plan has no take-profit targets")),
        };
        let reward = match side {
            Side::Long => first_tp - avg_entry,
            Side::Short => avg_entry - first_tp,
        };
        let ratio = reward / risk;
        if ratio < policy.min_risk_reward {
            return Err(SigtradeError::validation(format!(
                "risk:reward {} below configured minimum {}",
                ratio.round_dp(2),
                policy.min_risk_reward
            )));
        }
        Ok(())
    }

    /// Fraction-weighted average entry price across zones.
    pub fn avg_entry_price(&self) -> Decimal {
        weighted_entry(&self.entry_zones)
    }

    pub fn total_tp_allocation(&self) -> Decimal {
        self.take_profits.iter().map(|t| t.allocation).sum()
    }
}

fn weighted_entry(zones: &[EntryZone]) -> Decimal {
    zones.iter().map(|z| z.price * z.fraction).sum()
}
