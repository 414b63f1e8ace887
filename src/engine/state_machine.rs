//! Position lifecycle engine. Owns one position, consumes venue order
//! updates and commands, and emits the order actions needed to keep the
//! position on plan. Pure state transformation: callers execute the
//! actions and persist the snapshot.
//!
//! Fill accounting trusts the venue's cumulative filled quantity. A
//! repeated or out-of-order update yields a zero delta and changes
//! nothing; an overlapping stop/take-profit race clamps at the remaining
//! quantity and requests a reconciliation query instead of replaying both
//! fills blindly.

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::PolicyConfig;
use crate::domain::{
    OrderIntent, OrderPurpose, OrderResult, OrderStatus, OrderType, Position, PositionState,
    Side, StateTransition, StopLossRef, TradePlan, WorkingOrder,
};
use crate::error::{Result, SigtradeError};
use crate::notify::NotificationKind;

use super::policy;

#[derive(Debug, Clone)]
pub enum PositionCommand {
    Close,
    AdjustStopLoss(Decimal),
    Pause,
    Resume,
}

#[derive(Debug, Clone)]
pub enum PositionEvent {
    /// Venue order update routed here by client key.
    OrderUpdate(OrderResult),
    Command(PositionCommand),
    /// Risk-driven close; carries the breach description.
    ForcedClose { reason: String },
}

#[derive(Debug, Clone)]
pub struct CancelRef {
    pub symbol: String,
    pub client_key: String,
}

#[derive(Debug, Clone)]
pub enum OrderAction {
    Place(OrderIntent),
    Cancel(CancelRef),
    /// Sequenced stop move: the cancel must be confirmed before the
    /// placement is submitted, so two stops are never live at once.
    ReplaceStopLoss {
        cancel: Option<CancelRef>,
        place: OrderIntent,
    },
    /// Local and venue accounting disagree; query the venue's position
    /// and feed the result back through `reconcile`.
    Reconcile,
}

/// What one event application produced.
#[derive(Debug, Default)]
pub struct Outcome {
    pub actions: Vec<OrderAction>,
    pub notifications: Vec<NotificationKind>,
}

impl Outcome {
    fn notify(&mut self, kind: NotificationKind) {
        self.notifications.push(kind);
    }
}

pub struct PositionStateMachine {
    position: Position,
    policy: PolicyConfig,
}

impl PositionStateMachine {
    pub fn new(plan: TradePlan, policy: PolicyConfig) -> Self {
        Self {
            position: Position::new(plan),
            policy,
        }
    }

    /// Rebuild from a persisted snapshot.
    pub fn from_snapshot(position: Position, policy: PolicyConfig) -> Self {
        Self { position, policy }
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn into_position(self) -> Position {
        self.position
    }

    /// Initial order actions: one entry order per entry zone.
    pub fn start(&mut self) -> Outcome {
        let mut outcome = Outcome::default();
        let plan = self.position.plan.clone();
        for (i, zone) in plan.entry_zones.iter().enumerate() {
            let quantity = plan.quantity * zone.fraction;
            let intent = self.intent(
                OrderPurpose::Entry,
                i as u32,
                OrderType::Limit,
                quantity,
                Some(zone.price),
                None,
                false,
            );
            outcome.actions.push(OrderAction::Place(intent));
        }
        outcome
    }

    /// Apply one event. Serialized per position by the caller.
    pub fn apply(&mut self, event: PositionEvent) -> Result<Outcome> {
        if self.position.is_terminal() {
            // Late updates for a settled position carry nothing new.
            return Ok(Outcome::default());
        }
        let outcome = match event {
            PositionEvent::OrderUpdate(result) => self.on_order_update(result)?,
            PositionEvent::Command(command) => self.on_command(command)?,
            PositionEvent::ForcedClose { reason } => {
                let mut outcome = self.begin_close()?;
                outcome.notify(NotificationKind::RiskForcedClose { reason });
                outcome
            }
        };
        self.position.updated_at = chrono::Utc::now();
        Ok(outcome)
    }

    /// Venue-authoritative position quantity, from a reconciliation query.
    /// Clamps local remaining quantity to what the venue actually holds.
    pub fn reconcile(&mut self, venue_quantity: Decimal) -> Result<Outcome> {
        let mut outcome = Outcome::default();
        let venue_abs = venue_quantity.abs();
        let local = self.position.remaining_quantity;
        if venue_abs == local {
            return Ok(outcome);
        }

        let conflict = SigtradeError::ReconciliationConflict {
            position_id: self.position.id.to_string(),
            detail: format!("local remaining {} vs venue {}", local, venue_abs),
        };
        warn!(error = %conflict, "adopting venue quantity");
        self.position.remaining_quantity = venue_abs;

        if venue_abs.is_zero() && !self.position.is_terminal() {
            self.cancel_all_working(&mut outcome);
            self.position.stop_loss = None;
            if self.position.state == PositionState::PendingEntry {
                self.transition(PositionState::Closed, "reconciled flat before entry")?;
            } else {
                self.transition(PositionState::Closed, "reconciled flat with venue")?;
            }
            outcome.notify(NotificationKind::Closed {
                realized_pnl: self.position.realized_pnl,
            });
        }
        Ok(outcome)
    }

    fn on_order_update(&mut self, result: OrderResult) -> Result<Outcome> {
        let Some(idx) = self
            .position
            .working_orders
            .iter()
            .position(|w| w.client_key == result.client_key)
        else {
            // An order we already settled or replaced. A fill on such a
            // key (a replaced stop executing before its cancel landed)
            // means our accounting is behind the venue's.
            warn!(
                position_id = %self.position.id,
                client_key = %result.client_key,
                filled = %result.filled_quantity,
                "order update for untracked client key"
            );
            let mut outcome = Outcome::default();
            if result.filled_quantity > Decimal::ZERO {
                outcome.actions.push(OrderAction::Reconcile);
            }
            return Ok(outcome);
        };

        let working = self.position.working_orders[idx].clone();
        let delta = (result.filled_quantity - working.observed_fill).max(Decimal::ZERO);
        self.position.working_orders[idx].observed_fill =
            working.observed_fill.max(result.filled_quantity);

        let fill_price = result
            .avg_fill_price
            .filter(|p| !p.is_zero())
            .unwrap_or(working.price);

        let mut outcome = match working.purpose {
            OrderPurpose::Entry => self.on_entry_update(&result, delta, fill_price)?,
            OrderPurpose::TakeProfit { target } => {
                self.on_tp_update(target, &result, delta, fill_price)?
            }
            OrderPurpose::StopLoss => self.on_sl_update(&result, delta, fill_price)?,
            OrderPurpose::Close => self.on_close_update(&result, delta, fill_price)?,
        };

        if result.status.is_terminal() {
            self.position
                .working_orders
                .retain(|w| w.client_key != result.client_key);
        }
        // Entry completeness is judged once the settled order is removed.
        if self.position.state == PositionState::PendingEntry {
            let mut rest = self.maybe_finish_entry()?;
            outcome.actions.append(&mut rest.actions);
            outcome.notifications.append(&mut rest.notifications);
        }
        Ok(outcome)
    }

    fn on_entry_update(
        &mut self,
        result: &OrderResult,
        delta: Decimal,
        fill_price: Decimal,
    ) -> Result<Outcome> {
        let mut outcome = Outcome::default();
        if delta > Decimal::ZERO {
            let prev = self.position.filled_entry_quantity;
            let new_total = prev + delta;
            self.position.avg_entry_price =
                (self.position.avg_entry_price * prev + fill_price * delta) / new_total;
            self.position.filled_entry_quantity = new_total;
            self.position.remaining_quantity += delta;
        }

        if result.status == OrderStatus::Rejected {
            outcome.notify(NotificationKind::Rejected {
                reason: result
                    .error
                    .clone()
                    .unwrap_or_else(|| "entry order rejected".to_string()),
            });
        }
        Ok(outcome)
    }

    /// Once no entry order is left working, the position either opens with
    /// whatever filled or fails if nothing did.
    fn maybe_finish_entry(&mut self) -> Result<Outcome> {
        let mut outcome = Outcome::default();
        let entries_active = self
            .position
            .working_orders
            .iter()
            .any(|w| matches!(w.purpose, OrderPurpose::Entry));
        if entries_active {
            return Ok(outcome);
        }

        if self.position.filled_entry_quantity.is_zero() {
            self.transition(PositionState::EntryFailed, "entry rejected or expired")?;
            return Ok(outcome);
        }

        self.transition(PositionState::Open, "entry filled")?;
        outcome.notify(NotificationKind::Entered {
            quantity: self.position.filled_entry_quantity,
            avg_price: self.position.avg_entry_price,
        });

        // Protective stop covers the whole filled quantity.
        let stop_price = self.position.plan.stop_loss;
        let place = self.stop_loss_intent(stop_price);
        outcome.actions.push(OrderAction::ReplaceStopLoss {
            cancel: None,
            place,
        });

        if let Some(action) = self.next_tp_placement() {
            outcome.actions.push(action);
        }
        Ok(outcome)
    }

    fn on_tp_update(
        &mut self,
        target: usize,
        result: &OrderResult,
        delta: Decimal,
        fill_price: Decimal,
    ) -> Result<Outcome> {
        let mut outcome = Outcome::default();
        if delta > Decimal::ZERO {
            let applied = delta.min(self.position.remaining_quantity);
            if applied < delta {
                // Overlapping exit fills; the venue knows the truth.
                outcome.actions.push(OrderAction::Reconcile);
            }
            self.position.remaining_quantity -= applied;
            self.position.realized_pnl += self.exit_pnl(fill_price, applied);
            self.position.tp_fills.push(crate::domain::TpFill {
                target_index: target,
                quantity: applied,
                price: fill_price,
                timestamp: chrono::Utc::now(),
            });
        }

        match result.status {
            OrderStatus::Filled => {
                outcome.notify(NotificationKind::TpHit {
                    target,
                    quantity: result.filled_quantity,
                    price: fill_price,
                });
                if self.position.remaining_quantity > Decimal::ZERO {
                    if self.position.state == PositionState::Open {
                        self.transition(
                            PositionState::PartiallyClosed,
                            format!("take-profit {} filled", target + 1),
                        )?;
                    }
                    self.after_partial_exit(target, fill_price, &mut outcome);
                } else {
                    self.cancel_all_working(&mut outcome);
                    self.position.stop_loss = None;
                    self.transition(PositionState::Closed, "all take-profits filled")?;
                    outcome.notify(NotificationKind::Closed {
                        realized_pnl: self.position.realized_pnl,
                    });
                }
            }
            OrderStatus::Rejected => {
                outcome.notify(NotificationKind::Rejected {
                    reason: result
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("take-profit {} rejected", target + 1)),
                });
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Stop adjustment and next take-profit placement after a target fills.
    fn after_partial_exit(&mut self, target: usize, tp_price: Decimal, outcome: &mut Outcome) {
        if let Some(stop) = self.position.stop_loss.clone() {
            let next_stop = policy::stop_after_tp(
                &self.policy,
                self.position.plan.side,
                self.position.avg_entry_price,
                stop.price,
                target,
                tp_price,
            );
            if let Some(price) = next_stop {
                let cancel = CancelRef {
                    symbol: self.position.plan.symbol.clone(),
                    client_key: stop.client_key.clone(),
                };
                self.position
                    .working_orders
                    .retain(|w| w.client_key != stop.client_key);
                let place = self.stop_loss_intent(price);
                outcome.actions.push(OrderAction::ReplaceStopLoss {
                    cancel: Some(cancel),
                    place,
                });
                outcome.notify(NotificationKind::SlMoved { price });
            }
        }

        if !self.position.paused {
            if let Some(action) = self.next_tp_placement() {
                outcome.actions.push(action);
            }
        }
    }

    fn on_sl_update(
        &mut self,
        result: &OrderResult,
        delta: Decimal,
        fill_price: Decimal,
    ) -> Result<Outcome> {
        let mut outcome = Outcome::default();
        if delta > Decimal::ZERO {
            let applied = delta.min(self.position.remaining_quantity);
            if applied < delta {
                outcome.actions.push(OrderAction::Reconcile);
            }
            self.position.remaining_quantity -= applied;
            self.position.realized_pnl += self.exit_pnl(fill_price, applied);
        }

        match result.status {
            OrderStatus::Filled => {
                self.cancel_all_working_except(&result.client_key, &mut outcome);
                self.position.stop_loss = None;
                self.transition(PositionState::StoppedOut, "stop-loss filled")?;
                outcome.notify(NotificationKind::StoppedOut {
                    quantity: result.filled_quantity,
                    price: fill_price,
                });
            }
            OrderStatus::Rejected => {
                // The position is unprotected; this must reach a human.
                self.position.stop_loss = None;
                outcome.notify(NotificationKind::Rejected {
                    reason: result
                        .error
                        .clone()
                        .unwrap_or_else(|| "stop-loss order rejected".to_string()),
                });
            }
            _ => {}
        }
        Ok(outcome)
    }

    fn on_close_update(
        &mut self,
        result: &OrderResult,
        delta: Decimal,
        fill_price: Decimal,
    ) -> Result<Outcome> {
        let mut outcome = Outcome::default();
        if delta > Decimal::ZERO {
            let applied = delta.min(self.position.remaining_quantity);
            self.position.remaining_quantity -= applied;
            self.position.realized_pnl += self.exit_pnl(fill_price, applied);
        }

        if result.status == OrderStatus::Filled {
            self.cancel_all_working_except(&result.client_key, &mut outcome);
            self.position.stop_loss = None;
            self.transition(PositionState::Closed, "close order filled")?;
            outcome.notify(NotificationKind::Closed {
                realized_pnl: self.position.realized_pnl,
            });
        } else if result.status == OrderStatus::Rejected {
            outcome.notify(NotificationKind::Rejected {
                reason: result
                    .error
                    .clone()
                    .unwrap_or_else(|| "close order rejected".to_string()),
            });
        }
        Ok(outcome)
    }

    fn on_command(&mut self, command: PositionCommand) -> Result<Outcome> {
        match command {
            PositionCommand::Close => self.begin_close(),
            PositionCommand::AdjustStopLoss(price) => self.adjust_stop(price),
            PositionCommand::Pause => {
                self.position.paused = true;
                let mut outcome = Outcome::default();
                outcome.notify(NotificationKind::Paused);
                Ok(outcome)
            }
            PositionCommand::Resume => {
                self.position.paused = false;
                let mut outcome = Outcome::default();
                outcome.notify(NotificationKind::Resumed);
                let has_working_tp = self
                    .position
                    .working_orders
                    .iter()
                    .any(|w| matches!(w.purpose, OrderPurpose::TakeProfit { .. }));
                if !has_working_tp
                    && self.position.remaining_quantity > Decimal::ZERO
                    && !self.position.state.is_terminal()
                    && self.position.state != PositionState::PendingEntry
                {
                    if let Some(action) = self.next_tp_placement() {
                        outcome.actions.push(action);
                    }
                }
                Ok(outcome)
            }
        }
    }

    /// Cancel everything in flight, then close the remainder at market.
    /// The state change to `Closed` waits for the close fill.
    fn begin_close(&mut self) -> Result<Outcome> {
        let mut outcome = Outcome::default();
        self.cancel_all_working(&mut outcome);
        self.position.stop_loss = None;

        if self.position.remaining_quantity > Decimal::ZERO {
            let seq = self.position.close_seq;
            self.position.close_seq += 1;
            let intent = self.intent(
                OrderPurpose::Close,
                seq,
                OrderType::Market,
                self.position.remaining_quantity,
                None,
                None,
                true,
            );
            outcome.actions.push(OrderAction::Place(intent));
        } else {
            self.transition(PositionState::Closed, "closed before any fill")?;
            outcome.notify(NotificationKind::Closed {
                realized_pnl: self.position.realized_pnl,
            });
        }
        Ok(outcome)
    }

    fn adjust_stop(&mut self, price: Decimal) -> Result<Outcome> {
        if price <= Decimal::ZERO {
            return Err(SigtradeError::validation("stop price must be positive"));
        }
        let Some(stop) = self.position.stop_loss.clone() else {
            return Err(SigtradeError::validation(
                "position has no active stop-loss to adjust",
            ));
        };

        let mut outcome = Outcome::default();
        let cancel = CancelRef {
            symbol: self.position.plan.symbol.clone(),
            client_key: stop.client_key.clone(),
        };
        self.position
            .working_orders
            .retain(|w| w.client_key != stop.client_key);
        let place = self.stop_loss_intent(price);
        outcome.actions.push(OrderAction::ReplaceStopLoss {
            cancel: Some(cancel),
            place,
        });
        outcome.notify(NotificationKind::SlMoved { price });
        Ok(outcome)
    }

    fn next_tp_placement(&mut self) -> Option<OrderAction> {
        let target = self.position.next_tp_index()?;
        let tp = self.position.plan.take_profits[target];
        let is_last = target + 1 == self.position.plan.take_profits.len();
        let full_allocation = self.position.plan.total_tp_allocation() == Decimal::ONE;

        // The final fully-allocated target sweeps the remainder so step
        // rounding can never strand dust.
        let quantity = if is_last && full_allocation {
            self.position.remaining_quantity
        } else {
            (tp.allocation * self.position.filled_entry_quantity)
                .min(self.position.remaining_quantity)
        };
        if quantity <= Decimal::ZERO {
            return None;
        }

        let intent = self.intent(
            OrderPurpose::TakeProfit { target },
            0,
            OrderType::TakeProfitMarket,
            quantity,
            None,
            Some(tp.price),
            true,
        );
        Some(OrderAction::Place(intent))
    }

    fn stop_loss_intent(&mut self, price: Decimal) -> OrderIntent {
        let seq = self.position.sl_seq;
        self.position.sl_seq += 1;
        let intent = self.intent(
            OrderPurpose::StopLoss,
            seq,
            OrderType::StopMarket,
            self.position.remaining_quantity,
            None,
            Some(price),
            true,
        );
        self.position.stop_loss = Some(StopLossRef {
            client_key: intent.client_key.clone(),
            venue_order_id: None,
            price,
        });
        intent
    }

    /// Build an intent, record it as working, and hand it out.
    #[allow(clippy::too_many_arguments)]
    fn intent(
        &mut self,
        purpose: OrderPurpose,
        seq: u32,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
        trigger_price: Option<Decimal>,
        reduce_only: bool,
    ) -> OrderIntent {
        let plan = &self.position.plan;
        let side = match purpose {
            OrderPurpose::Entry => plan.side.entry_side(),
            _ => plan.side.exit_side(),
        };
        let client_key = OrderIntent::client_key_for(&self.position.id, purpose, seq);
        self.position.working_orders.push(WorkingOrder {
            client_key: client_key.clone(),
            purpose,
            quantity,
            price: price.or(trigger_price).unwrap_or(Decimal::ZERO),
            observed_fill: Decimal::ZERO,
        });
        OrderIntent {
            client_key,
            position_id: self.position.id,
            venue: plan.venue,
            account: plan.account.clone(),
            symbol: plan.symbol.clone(),
            side,
            order_type,
            quantity,
            price,
            trigger_price,
            reduce_only,
            purpose,
        }
    }

    fn cancel_all_working(&mut self, outcome: &mut Outcome) {
        let symbol = self.position.plan.symbol.clone();
        for working in self.position.working_orders.drain(..) {
            outcome.actions.push(OrderAction::Cancel(CancelRef {
                symbol: symbol.clone(),
                client_key: working.client_key,
            }));
        }
    }

    fn cancel_all_working_except(&mut self, keep: &str, outcome: &mut Outcome) {
        let symbol = self.position.plan.symbol.clone();
        let mut kept = Vec::new();
        for working in self.position.working_orders.drain(..) {
            if working.client_key == keep {
                kept.push(working);
            } else {
                outcome.actions.push(OrderAction::Cancel(CancelRef {
                    symbol: symbol.clone(),
                    client_key: working.client_key,
                }));
            }
        }
        self.position.working_orders = kept;
    }

    fn exit_pnl(&self, exit_price: Decimal, quantity: Decimal) -> Decimal {
        let per_unit = match self.position.plan.side {
            Side::Long => exit_price - self.position.avg_entry_price,
            Side::Short => self.position.avg_entry_price - exit_price,
        };
        per_unit * quantity
    }

    fn transition(&mut self, to: PositionState, reason: impl Into<String>) -> Result<()> {
        let from = self.position.state;
        if !from.can_transition_to(to) {
            return Err(SigtradeError::InvalidStateTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        let record = StateTransition::new(from, to, reason);
        info!(
            position_id = %self.position.id,
            from = from.as_str(),
            to = to.as_str(),
            reason = %record.reason,
            "position transition"
        );
        self.position.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExchangeKind, TradeSignal};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn plan() -> TradePlan {
        let signal = TradeSignal {
            exchange: ExchangeKind::Paper,
            account: "main".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            entry: Some(dec!(60000)),
            entry_zones: vec![],
            stop_loss: Some(dec!(58000)),
            take_profits: vec![(dec!(61000), dec!(0.5)), (dec!(63000), dec!(0.5))],
            position_size_quote: dec!(6000),
            leverage: Some(1),
            margin_mode: None,
        };
        let policy = PolicyConfig {
            min_risk_reward: dec!(0.4),
            ..PolicyConfig::default()
        };
        TradePlan::from_signal(&signal, &policy).unwrap()
    }

    fn machine() -> PositionStateMachine {
        let policy = PolicyConfig {
            min_risk_reward: dec!(0.4),
            ..PolicyConfig::default()
        };
        PositionStateMachine::new(plan(), policy)
    }

    fn update(client_key: &str, status: OrderStatus, filled: Decimal, avg: Decimal) -> PositionEvent {
        PositionEvent::OrderUpdate(OrderResult {
            client_key: client_key.to_string(),
            venue_order_id: Some("v1".to_string()),
            venue: ExchangeKind::Paper,
            symbol: "BTCUSDT".to_string(),
            status,
            filled_quantity: filled,
            avg_fill_price: if avg.is_zero() { None } else { Some(avg) },
            error: None,
            timestamp: Utc::now(),
        })
    }

    fn placed_keys(outcome: &Outcome) -> Vec<String> {
        outcome
            .actions
            .iter()
            .filter_map(|a| match a {
                OrderAction::Place(intent) => Some(intent.client_key.clone()),
                OrderAction::ReplaceStopLoss { place, .. } => Some(place.client_key.clone()),
                _ => None,
            })
            .collect()
    }

    /// Drive the machine through entry, returning (entry_key, sl_key, tp0_key).
    fn open_position(sm: &mut PositionStateMachine) -> (String, String, String) {
        let start = sm.start();
        let entry_key = placed_keys(&start)[0].clone();

        let qty = sm.position().plan.quantity;
        let outcome = sm
            .apply(update(&entry_key, OrderStatus::Filled, qty, dec!(60000)))
            .unwrap();
        assert_eq!(sm.position().state, PositionState::Open);
        let keys = placed_keys(&outcome);
        // Stop first, then the first take-profit.
        (entry_key, keys[0].clone(), keys[1].clone())
    }

    #[test]
    fn test_start_emits_entry_per_zone() {
        let mut sm = machine();
        let outcome = sm.start();
        assert_eq!(outcome.actions.len(), 1);
        match &outcome.actions[0] {
            OrderAction::Place(intent) => {
                assert_eq!(intent.purpose, OrderPurpose::Entry);
                assert_eq!(intent.order_type, OrderType::Limit);
                assert_eq!(intent.quantity, dec!(0.1));
                assert!(!intent.reduce_only);
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_full_fill_opens_with_stop_and_first_tp() {
        let mut sm = machine();
        let start = sm.start();
        let entry_key = placed_keys(&start)[0].clone();
        let outcome = sm
            .apply(update(&entry_key, OrderStatus::Filled, dec!(0.1), dec!(60000)))
            .unwrap();

        assert_eq!(sm.position().state, PositionState::Open);
        assert_eq!(sm.position().remaining_quantity, dec!(0.1));
        assert!(matches!(
            outcome.notifications[0],
            NotificationKind::Entered { .. }
        ));

        assert_eq!(outcome.actions.len(), 2);
        match &outcome.actions[0] {
            OrderAction::ReplaceStopLoss { cancel, place } => {
                assert!(cancel.is_none());
                assert_eq!(place.trigger_price, Some(dec!(58000)));
                assert!(place.reduce_only);
            }
            other => panic!("unexpected action: {:?}", other),
        }
        match &outcome.actions[1] {
            OrderAction::Place(intent) => {
                assert_eq!(intent.purpose, OrderPurpose::TakeProfit { target: 0 });
                assert_eq!(intent.trigger_price, Some(dec!(61000)));
                assert_eq!(intent.quantity, dec!(0.05));
            }
            other => panic!("unexpected action: {:?}", other),
        }
        assert_eq!(sm.position().stop_loss.as_ref().unwrap().price, dec!(58000));
    }

    #[test]
    fn test_partial_entry_stays_pending() {
        let mut sm = machine();
        let start = sm.start();
        let entry_key = placed_keys(&start)[0].clone();
        let outcome = sm
            .apply(update(
                &entry_key,
                OrderStatus::PartiallyFilled,
                dec!(0.04),
                dec!(60000),
            ))
            .unwrap();
        assert_eq!(sm.position().state, PositionState::PendingEntry);
        assert_eq!(sm.position().filled_entry_quantity, dec!(0.04));
        assert!(outcome.actions.is_empty());
    }

    #[test]
    fn test_entry_rejected_fails_position() {
        let mut sm = machine();
        let start = sm.start();
        let entry_key = placed_keys(&start)[0].clone();
        let outcome = sm
            .apply(update(&entry_key, OrderStatus::Rejected, dec!(0), dec!(0)))
            .unwrap();
        assert_eq!(sm.position().state, PositionState::EntryFailed);
        assert!(outcome
            .notifications
            .iter()
            .any(|n| matches!(n, NotificationKind::Rejected { .. })));
    }

    #[test]
    fn test_tp1_moves_stop_to_break_even_and_places_tp2() {
        let mut sm = machine();
        let (_, _sl_key, tp0_key) = open_position(&mut sm);

        let outcome = sm
            .apply(update(&tp0_key, OrderStatus::Filled, dec!(0.05), dec!(61000)))
            .unwrap();
        assert_eq!(sm.position().state, PositionState::PartiallyClosed);
        assert_eq!(sm.position().remaining_quantity, dec!(0.05));
        assert_eq!(sm.position().realized_pnl, dec!(50.00));

        // Sequenced stop replacement to entry, then the second target.
        match &outcome.actions[0] {
            OrderAction::ReplaceStopLoss { cancel, place } => {
                assert!(cancel.is_some());
                assert_eq!(place.trigger_price, Some(dec!(60000)));
                assert_eq!(place.quantity, dec!(0.05));
            }
            other => panic!("unexpected action: {:?}", other),
        }
        match &outcome.actions[1] {
            OrderAction::Place(intent) => {
                assert_eq!(intent.purpose, OrderPurpose::TakeProfit { target: 1 });
                assert_eq!(intent.quantity, dec!(0.05));
            }
            other => panic!("unexpected action: {:?}", other),
        }
        assert_eq!(sm.position().stop_loss.as_ref().unwrap().price, dec!(60000));
        assert!(outcome
            .notifications
            .iter()
            .any(|n| matches!(n, NotificationKind::SlMoved { price } if *price == dec!(60000))));
    }

    #[test]
    fn test_final_tp_closes_and_cancels_stop() {
        let mut sm = machine();
        let (_, _, tp0_key) = open_position(&mut sm);
        let outcome = sm
            .apply(update(&tp0_key, OrderStatus::Filled, dec!(0.05), dec!(61000)))
            .unwrap();
        let tp1_key = placed_keys(&outcome)
            .into_iter()
            .find(|k| k.contains("tp1"))
            .unwrap();

        let outcome = sm
            .apply(update(&tp1_key, OrderStatus::Filled, dec!(0.05), dec!(63000)))
            .unwrap();
        assert_eq!(sm.position().state, PositionState::Closed);
        assert_eq!(sm.position().remaining_quantity, dec!(0));
        assert!(sm.position().stop_loss.is_none());
        assert!(sm.position().working_orders.is_empty());
        // The replaced stop gets canceled on the way out.
        assert!(outcome
            .actions
            .iter()
            .any(|a| matches!(a, OrderAction::Cancel(c) if c.client_key.contains("-sl-"))));
        // 0.05 * 1000 + 0.05 * 3000
        assert_eq!(sm.position().realized_pnl, dec!(200.00));
    }

    #[test]
    fn test_stop_fill_cancels_pending_tps() {
        let mut sm = machine();
        let (_, sl_key, _) = open_position(&mut sm);

        let outcome = sm
            .apply(update(&sl_key, OrderStatus::Filled, dec!(0.1), dec!(58000)))
            .unwrap();
        assert_eq!(sm.position().state, PositionState::StoppedOut);
        assert_eq!(sm.position().remaining_quantity, dec!(0));
        assert!(outcome
            .actions
            .iter()
            .any(|a| matches!(a, OrderAction::Cancel(c) if c.client_key.contains("tp0"))));
        assert!(outcome
            .notifications
            .iter()
            .any(|n| matches!(n, NotificationKind::StoppedOut { .. })));
        assert_eq!(sm.position().realized_pnl, dec!(-200.00));
    }

    #[test]
    fn test_manual_close_cancels_then_markets_out() {
        let mut sm = machine();
        open_position(&mut sm);

        let outcome = sm
            .apply(PositionEvent::Command(PositionCommand::Close))
            .unwrap();
        // Still open until the close order confirms.
        assert_eq!(sm.position().state, PositionState::Open);
        let cancels = outcome
            .actions
            .iter()
            .filter(|a| matches!(a, OrderAction::Cancel(_)))
            .count();
        assert_eq!(cancels, 2);
        let close_key = placed_keys(&outcome)[0].clone();
        let close_intent = outcome
            .actions
            .iter()
            .find_map(|a| match a {
                OrderAction::Place(i) => Some(i),
                _ => None,
            })
            .unwrap();
        assert_eq!(close_intent.order_type, OrderType::Market);
        assert!(close_intent.reduce_only);

        let outcome = sm
            .apply(update(&close_key, OrderStatus::Filled, dec!(0.1), dec!(60500)))
            .unwrap();
        assert_eq!(sm.position().state, PositionState::Closed);
        assert!(outcome
            .notifications
            .iter()
            .any(|n| matches!(n, NotificationKind::Closed { .. })));
    }

    #[test]
    fn test_forced_close_notifies_risk() {
        let mut sm = machine();
        open_position(&mut sm);
        let outcome = sm
            .apply(PositionEvent::ForcedClose {
                reason: "loss floor breached".to_string(),
            })
            .unwrap();
        assert!(outcome
            .notifications
            .iter()
            .any(|n| matches!(n, NotificationKind::RiskForcedClose { .. })));
        assert!(!placed_keys(&outcome).is_empty());
    }

    #[test]
    fn test_adjust_stop_command_replaces_in_sequence() {
        let mut sm = machine();
        open_position(&mut sm);
        let outcome = sm
            .apply(PositionEvent::Command(PositionCommand::AdjustStopLoss(
                dec!(59000),
            )))
            .unwrap();
        match &outcome.actions[0] {
            OrderAction::ReplaceStopLoss { cancel, place } => {
                assert!(cancel.is_some());
                assert_eq!(place.trigger_price, Some(dec!(59000)));
            }
            other => panic!("unexpected action: {:?}", other),
        }
        assert_eq!(sm.position().stop_loss.as_ref().unwrap().price, dec!(59000));
    }

    #[test]
    fn test_adjust_stop_without_position_rejected() {
        let mut sm = machine();
        sm.start();
        let err = sm
            .apply(PositionEvent::Command(PositionCommand::AdjustStopLoss(
                dec!(59000),
            )))
            .unwrap_err();
        assert!(matches!(err, SigtradeError::Validation(_)));
    }

    #[test]
    fn test_pause_suppresses_next_tp_until_resume() {
        let mut sm = machine();
        let (_, _, tp0_key) = open_position(&mut sm);

        sm.apply(PositionEvent::Command(PositionCommand::Pause))
            .unwrap();
        let outcome = sm
            .apply(update(&tp0_key, OrderStatus::Filled, dec!(0.05), dec!(61000)))
            .unwrap();
        assert!(!placed_keys(&outcome).iter().any(|k| k.contains("tp1")));

        let outcome = sm
            .apply(PositionEvent::Command(PositionCommand::Resume))
            .unwrap();
        assert!(placed_keys(&outcome).iter().any(|k| k.contains("tp1")));
    }

    #[test]
    fn test_duplicate_update_is_idempotent() {
        let mut sm = machine();
        let (_, _, tp0_key) = open_position(&mut sm);

        sm.apply(update(
            &tp0_key,
            OrderStatus::PartiallyFilled,
            dec!(0.03),
            dec!(61000),
        ))
        .unwrap();
        // Same cumulative quantity again: no double counting.
        sm.apply(update(
            &tp0_key,
            OrderStatus::PartiallyFilled,
            dec!(0.03),
            dec!(61000),
        ))
        .unwrap();
        assert_eq!(sm.position().remaining_quantity, dec!(0.07));
    }

    #[test]
    fn test_overlapping_exit_requests_reconciliation() {
        let mut sm = machine();
        let (_, sl_key, tp0_key) = open_position(&mut sm);

        sm.apply(update(&tp0_key, OrderStatus::Filled, dec!(0.05), dec!(61000)))
            .unwrap();
        // Venue races: the old stop reports a full-size fill too.
        let outcome = sm
            .apply(update(&sl_key, OrderStatus::Filled, dec!(0.1), dec!(58000)))
            .unwrap();
        assert!(outcome
            .actions
            .iter()
            .any(|a| matches!(a, OrderAction::Reconcile)));
        // Remaining never goes negative.
        assert!(sm.position().remaining_quantity >= dec!(0));
    }

    #[test]
    fn test_reconcile_adopts_venue_quantity() {
        let mut sm = machine();
        open_position(&mut sm);
        // A fill happened while we were down; the venue holds less.
        let outcome = sm.reconcile(dec!(0.04)).unwrap();
        assert_eq!(sm.position().remaining_quantity, dec!(0.04));
        assert!(outcome.actions.is_empty());

        let outcome = sm.reconcile(dec!(0)).unwrap();
        assert_eq!(sm.position().state, PositionState::Closed);
        assert!(outcome
            .notifications
            .iter()
            .any(|n| matches!(n, NotificationKind::Closed { .. })));
    }

    #[test]
    fn test_terminal_position_ignores_events() {
        let mut sm = machine();
        let (_, sl_key, tp0_key) = open_position(&mut sm);
        sm.apply(update(&sl_key, OrderStatus::Filled, dec!(0.1), dec!(58000)))
            .unwrap();

        let outcome = sm
            .apply(update(&tp0_key, OrderStatus::Filled, dec!(0.05), dec!(61000)))
            .unwrap();
        assert!(outcome.actions.is_empty());
        assert_eq!(sm.position().state, PositionState::StoppedOut);
    }

    #[test]
    fn test_remaining_quantity_accounting() {
        let mut sm = machine();
        let (_, _, tp0_key) = open_position(&mut sm);

        sm.apply(update(&tp0_key, OrderStatus::Filled, dec!(0.05), dec!(61000)))
            .unwrap();
        let p = sm.position();
        let tp_total: Decimal = p.tp_fills.iter().map(|f| f.quantity).sum();
        assert_eq!(p.remaining_quantity, p.filled_entry_quantity - tp_total);
    }
}
