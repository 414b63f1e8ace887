//! Account-level risk evaluation. Runs on its own clock, independent of
//! any single position's events. Evaluation is pure; the coordinator
//! feeds it snapshots and executes the forced closes it recommends.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use uuid::Uuid;

use crate::config::RiskConfig;
use crate::domain::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginHealth {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub enum RiskBreach {
    ExposureCeiling { limit: Decimal, current: Decimal },
    LossFloor { floor: Decimal, current: Decimal },
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskReport {
    pub total_exposure: Decimal,
    pub total_unrealized: Decimal,
    pub health: MarginHealth,
    pub breaches: Vec<RiskBreach>,
    /// Positions to force-close, largest loss first.
    pub forced_closes: Vec<ForcedClose>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForcedClose {
    pub position_id: Uuid,
    pub symbol: String,
    pub unrealized: Decimal,
    pub reason: String,
}

impl RiskReport {
    pub fn has_breaches(&self) -> bool {
        !self.breaches.is_empty()
    }
}

pub struct RiskMonitor {
    config: RiskConfig,
}

impl RiskMonitor {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Evaluate all open positions against the account limits. Each entry
    /// pairs a position snapshot with its current mark price.
    pub fn evaluate(&self, positions: &[(Position, Decimal)]) -> RiskReport {
        let mut total_exposure = Decimal::ZERO;
        let mut total_unrealized = Decimal::ZERO;
        let mut per_position: Vec<(Uuid, String, Decimal)> = Vec::new();

        for (position, mark) in positions {
            let exposure = position.notional(*mark);
            let unrealized = position.unrealized_at(*mark);
            total_exposure += exposure;
            total_unrealized += unrealized;
            per_position.push((position.id, position.plan.symbol.clone(), unrealized));
        }

        let mut breaches = Vec::new();
        if total_exposure > self.config.max_total_exposure {
            breaches.push(RiskBreach::ExposureCeiling {
                limit: self.config.max_total_exposure,
                current: total_exposure,
            });
        }
        let loss_floor = -self.config.max_unrealized_loss;
        if total_unrealized < loss_floor {
            breaches.push(RiskBreach::LossFloor {
                floor: loss_floor,
                current: total_unrealized,
            });
        }

        let health = self.health(total_unrealized);
        let forced_closes = if breaches.is_empty() {
            Vec::new()
        } else {
            self.pick_forced_closes(&breaches, per_position)
        };

        RiskReport {
            total_exposure,
            total_unrealized,
            health,
            breaches,
            forced_closes,
        }
    }

    fn health(&self, total_unrealized: Decimal) -> MarginHealth {
        if total_unrealized >= Decimal::ZERO {
            return MarginHealth::Healthy;
        }
        let used = -total_unrealized / self.config.max_unrealized_loss;
        if used > dec!(0.8) {
            MarginHealth::Critical
        } else if used > dec!(0.6) {
            MarginHealth::Warning
        } else {
            MarginHealth::Healthy
        }
    }

    /// Largest loss first. The whole losing tail is nominated; closing
    /// winners to cure an exposure breach would realize nothing useful
    /// and is left to the operator.
    fn pick_forced_closes(
        &self,
        breaches: &[RiskBreach],
        mut per_position: Vec<(Uuid, String, Decimal)>,
    ) -> Vec<ForcedClose> {
        per_position.sort_by(|a, b| a.2.cmp(&b.2));
        let reason = breaches
            .iter()
            .map(|b| match b {
                RiskBreach::ExposureCeiling { limit, current } => {
                    format!("exposure {} over ceiling {}", current, limit)
                }
                RiskBreach::LossFloor { floor, current } => {
                    format!("unrealized {} under floor {}", current, floor)
                }
            })
            .collect::<Vec<_>>()
            .join("; ");

        per_position
            .into_iter()
            .filter(|(_, _, unrealized)| *unrealized < Decimal::ZERO)
            .map(|(position_id, symbol, unrealized)| ForcedClose {
                position_id,
                symbol,
                unrealized,
                reason: reason.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::domain::{ExchangeKind, Side, TradePlan, TradeSignal};

    fn test_config() -> RiskConfig {
        RiskConfig {
            check_interval_secs: 1,
            max_total_exposure: dec!(20000),
            max_unrealized_loss: dec!(500),
        }
    }

    fn open_position(symbol: &str, entry: Decimal, qty: Decimal) -> Position {
        let signal = TradeSignal {
            exchange: ExchangeKind::Paper,
            account: "main".to_string(),
            symbol: symbol.to_string(),
            side: Side::Long,
            entry: Some(entry),
            entry_zones: vec![],
            stop_loss: Some(entry * dec!(0.95)),
            take_profits: vec![(entry * dec!(1.1), dec!(1.0))],
            position_size_quote: entry * qty,
            leverage: Some(1),
            margin_mode: None,
        };
        let policy = PolicyConfig {
            min_risk_reward: dec!(0.4),
            ..PolicyConfig::default()
        };
        let mut position = Position::new(TradePlan::from_signal(&signal, &policy).unwrap());
        position.state = crate::domain::PositionState::Open;
        position.filled_entry_quantity = qty;
        position.remaining_quantity = qty;
        position.avg_entry_price = entry;
        position
    }

    #[test]
    fn test_healthy_account_has_no_closes() {
        let monitor = RiskMonitor::new(test_config());
        let positions = vec![(open_position("BTCUSDT", dec!(10000), dec!(1)), dec!(10100))];
        let report = monitor.evaluate(&positions);
        assert!(!report.has_breaches());
        assert!(report.forced_closes.is_empty());
        assert_eq!(report.health, MarginHealth::Healthy);
    }

    #[test]
    fn test_loss_floor_closes_largest_loss_first() {
        let monitor = RiskMonitor::new(test_config());
        let positions = vec![
            // Down 300.
            (open_position("ETHUSDT", dec!(3000), dec!(1)), dec!(2700)),
            // Down 400.
            (open_position("BTCUSDT", dec!(10000), dec!(1)), dec!(9600)),
        ];
        let report = monitor.evaluate(&positions);
        assert!(report.has_breaches());
        assert_eq!(report.forced_closes.len(), 2);
        assert_eq!(report.forced_closes[0].symbol, "BTCUSDT");
        assert_eq!(report.forced_closes[1].symbol, "ETHUSDT");
    }

    #[test]
    fn test_exposure_ceiling_breach() {
        let monitor = RiskMonitor::new(test_config());
        let positions = vec![
            (open_position("BTCUSDT", dec!(10000), dec!(2)), dec!(9990)),
            (open_position("ETHUSDT", dec!(3000), dec!(2)), dec!(3000)),
        ];
        let report = monitor.evaluate(&positions);
        assert!(matches!(
            report.breaches[0],
            RiskBreach::ExposureCeiling { .. }
        ));
        // Only the loser is nominated.
        assert_eq!(report.forced_closes.len(), 1);
        assert_eq!(report.forced_closes[0].symbol, "BTCUSDT");
    }

    #[test]
    fn test_health_thresholds() {
        let monitor = RiskMonitor::new(test_config());
        // 70% of the loss budget used.
        let positions = vec![(open_position("BTCUSDT", dec!(10000), dec!(1)), dec!(9650))];
        let report = monitor.evaluate(&positions);
        assert_eq!(report.health, MarginHealth::Warning);

        // 90% used.
        let positions = vec![(open_position("BTCUSDT", dec!(10000), dec!(1)), dec!(9550))];
        let report = monitor.evaluate(&positions);
        assert_eq!(report.health, MarginHealth::Critical);
        assert!(!report.has_breaches());
    }
}
