//! Position aggregate and its lifecycle states. The aggregate is owned by
//! exactly one state machine; everything else reads snapshots.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SigtradeError;

use super::plan::TradePlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    /// Entry order(s) working, nothing filled yet (or partially filled).
    PendingEntry,
    /// Entry complete, protective stop and first take-profit working.
    Open,
    /// At least one take-profit filled, quantity remains.
    PartiallyClosed,
    /// All quantity accounted for by take-profits or a manual close.
    Closed,
    /// Protective stop filled; terminal.
    StoppedOut,
    /// Entry rejected or expired before any fill; terminal.
    EntryFailed,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingEntry => "pending_entry",
            Self::Open => "open",
            Self::PartiallyClosed => "partially_closed",
            Self::Closed => "closed",
            Self::StoppedOut => "stopped_out",
            Self::EntryFailed => "entry_failed",
        }
    }

    pub fn can_transition_to(&self, target: PositionState) -> bool {
        use PositionState::*;
        matches!(
            (self, target),
            (PendingEntry, Open)
                | (PendingEntry, EntryFailed)
                | (PendingEntry, Closed)
                | (Open, PartiallyClosed)
                | (Open, Closed)
                | (Open, StoppedOut)
                | (PartiallyClosed, PartiallyClosed)
                | (PartiallyClosed, Closed)
                | (PartiallyClosed, StoppedOut)
        )
    }

    pub fn valid_transitions(&self) -> Vec<PositionState> {
        use PositionState::*;
        match self {
            PendingEntry => vec![Open, EntryFailed, Closed],
            Open => vec![PartiallyClosed, Closed, StoppedOut],
            PartiallyClosed => vec![PartiallyClosed, Closed, StoppedOut],
            Closed | StoppedOut | EntryFailed => vec![],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::StoppedOut | Self::EntryFailed)
    }
}

impl TryFrom<&str> for PositionState {
    type Error = SigtradeError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "pending_entry" => Ok(Self::PendingEntry),
            "open" => Ok(Self::Open),
            "partially_closed" => Ok(Self::PartiallyClosed),
            "closed" => Ok(Self::Closed),
            "stopped_out" => Ok(Self::StoppedOut),
            "entry_failed" => Ok(Self::EntryFailed),
            other => Err(SigtradeError::internal(format!(
                "unknown position state: {}",
                other
            ))),
        }
    }
}

/// Audit record of a single state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PositionState,
    pub to: PositionState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl StateTransition {
    pub fn new(from: PositionState, to: PositionState, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

/// One executed take-profit fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpFill {
    pub target_index: usize,
    pub quantity: Decimal,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Reference to the currently working protective stop order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossRef {
    pub client_key: String,
    pub venue_order_id: Option<String>,
    pub price: Decimal,
}

/// An order the position has in flight at the venue. Persisted with the
/// snapshot so restart recovery knows which client keys to reconcile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingOrder {
    pub client_key: String,
    pub purpose: super::order::OrderPurpose,
    pub quantity: Decimal,
    /// Reference price for PnL when the venue omits an average fill price.
    pub price: Decimal,
    /// Cumulative fill observed so far; deltas are computed against this.
    pub observed_fill: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub plan: TradePlan,
    pub state: PositionState,
    pub filled_entry_quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub remaining_quantity: Decimal,
    pub tp_fills: Vec<TpFill>,
    pub stop_loss: Option<StopLossRef>,
    pub working_orders: Vec<WorkingOrder>,
    /// Monotonic counter feeding deterministic stop-loss client keys.
    pub sl_seq: u32,
    /// Same, for market-close intents.
    pub close_seq: u32,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn new(plan: TradePlan) -> Self {
        let now = Utc::now();
        Self {
            id: plan.id,
            plan,
            state: PositionState::PendingEntry,
            filled_entry_quantity: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            remaining_quantity: Decimal::ZERO,
            tp_fills: Vec::new(),
            stop_loss: None,
            working_orders: Vec::new(),
            sl_seq: 0,
            close_seq: 0,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            paused: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Notional exposure of the remaining quantity at a mark price.
    pub fn notional(&self, mark_price: Decimal) -> Decimal {
        self.remaining_quantity * mark_price
    }

    /// Unrealized PnL of the remaining quantity at a mark price.
    pub fn unrealized_at(&self, mark_price: Decimal) -> Decimal {
        use super::order::Side;
        if self.remaining_quantity.is_zero() {
            return Decimal::ZERO;
        }
        let per_unit = match self.plan.side {
            Side::Long => mark_price - self.avg_entry_price,
            Side::Short => self.avg_entry_price - mark_price,
        };
        per_unit * self.remaining_quantity
    }

    /// Index of the next unfilled take-profit target, if any.
    pub fn next_tp_index(&self) -> Option<usize> {
        let next = self.tp_fills.iter().map(|f| f.target_index + 1).max();
        let idx = next.unwrap_or(0);
        if idx < self.plan.take_profits.len() {
            Some(idx)
        } else {
            None
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::domain::signal::TradeSignal;
    use crate::domain::venue::ExchangeKind;
    use crate::domain::Side;
    use rust_decimal_macros::dec;

    fn test_plan() -> TradePlan {
        let signal = TradeSignal {
            exchange: ExchangeKind::Paper,
            account: "main".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            entry: Some(dec!(60000)),
            entry_zones: vec![],
            stop_loss: Some(dec!(58000)),
            take_profits: vec![(dec!(61000), dec!(0.5)), (dec!(63000), dec!(0.5))],
            position_size_quote: dec!(1000),
            leverage: Some(10),
            margin_mode: None,
        };
        let policy = PolicyConfig {
            min_risk_reward: dec!(0.4),
            ..PolicyConfig::default()
        };
        TradePlan::from_signal(&signal, &policy).unwrap()
    }

    #[test]
    fn test_valid_transitions() {
        use PositionState::*;
        assert!(PendingEntry.can_transition_to(Open));
        assert!(PendingEntry.can_transition_to(EntryFailed));
        assert!(Open.can_transition_to(PartiallyClosed));
        assert!(Open.can_transition_to(StoppedOut));
        assert!(PartiallyClosed.can_transition_to(Closed));
        assert!(PartiallyClosed.can_transition_to(StoppedOut));

        assert!(!Closed.can_transition_to(Open));
        assert!(!StoppedOut.can_transition_to(PartiallyClosed));
        assert!(!EntryFailed.can_transition_to(Open));
        assert!(!Open.can_transition_to(PendingEntry));
    }

    #[test]
    fn test_terminal_states() {
        assert!(PositionState::Closed.is_terminal());
        assert!(PositionState::StoppedOut.is_terminal());
        assert!(PositionState::EntryFailed.is_terminal());
        assert!(!PositionState::Open.is_terminal());
        assert!(PositionState::Closed.valid_transitions().is_empty());
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            PositionState::PendingEntry,
            PositionState::Open,
            PositionState::PartiallyClosed,
            PositionState::Closed,
            PositionState::StoppedOut,
            PositionState::EntryFailed,
        ] {
            assert_eq!(PositionState::try_from(state.as_str()).unwrap(), state);
        }
        assert!(PositionState::try_from("limbo").is_err());
    }

    #[test]
    fn test_next_tp_index() {
        let mut position = Position::new(test_plan());
        assert_eq!(position.next_tp_index(), Some(0));
        position.tp_fills.push(TpFill {
            target_index: 0,
            quantity: dec!(0.05),
            price: dec!(61000),
            timestamp: Utc::now(),
        });
        assert_eq!(position.next_tp_index(), Some(1));
        position.tp_fills.push(TpFill {
            target_index: 1,
            quantity: dec!(0.05),
            price: dec!(63000),
            timestamp: Utc::now(),
        });
        assert_eq!(position.next_tp_index(), None);
    }

    #[test]
    fn test_unrealized_pnl_sign() {
        let mut position = Position::new(test_plan());
        position.avg_entry_price = dec!(60000);
        position.remaining_quantity = dec!(0.1);
        assert_eq!(position.unrealized_at(dec!(61000)), dec!(100.0));
        assert_eq!(position.unrealized_at(dec!(59000)), dec!(-100.0));
    }
}
