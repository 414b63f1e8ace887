//! Stop-loss adjustment policy. Kept apart from the state machine so the
//! behavior after a take-profit fill stays a configuration concern.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::PolicyConfig;
use crate::domain::Side;

/// Where the protective stop should sit after take-profit `target` filled
/// at `tp_price`. `None` means leave the stop where it is.
pub fn stop_after_tp(
    policy: &PolicyConfig,
    side: Side,
    avg_entry: Decimal,
    current_stop: Decimal,
    target: usize,
    tp_price: Decimal,
) -> Option<Decimal> {
    let candidate = if target == 0 && policy.break_even_after_tp1 {
        Some(avg_entry)
    } else if policy.trail_after_tp {
        // Halfway between entry and the level that just paid out.
        Some(avg_entry + (tp_price - avg_entry) * dec!(0.5))
    } else {
        None
    }?;

    // Never move the stop backwards.
    let improves = match side {
        Side::Long => candidate > current_stop,
        Side::Short => candidate < current_stop,
    };
    improves.then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(break_even: bool, trail: bool) -> PolicyConfig {
        PolicyConfig {
            break_even_after_tp1: break_even,
            trail_after_tp: trail,
            ..PolicyConfig::default()
        }
    }

    #[test]
    fn test_break_even_after_first_tp() {
        let next = stop_after_tp(
            &policy(true, false),
            Side::Long,
            dec!(60000),
            dec!(58000),
            0,
            dec!(61000),
        );
        assert_eq!(next, Some(dec!(60000)));
    }

    #[test]
    fn test_no_move_when_disabled() {
        let next = stop_after_tp(
            &policy(false, false),
            Side::Long,
            dec!(60000),
            dec!(58000),
            0,
            dec!(61000),
        );
        assert_eq!(next, None);
    }

    #[test]
    fn test_trailing_moves_halfway() {
        let next = stop_after_tp(
            &policy(false, true),
            Side::Long,
            dec!(60000),
            dec!(60000),
            1,
            dec!(63000),
        );
        assert_eq!(next, Some(dec!(61500.0)));
    }

    #[test]
    fn test_never_moves_backwards() {
        // Stop already at break-even; later break-even suggestion is a no-op.
        let next = stop_after_tp(
            &policy(true, false),
            Side::Short,
            dec!(60000),
            dec!(60000),
            0,
            dec!(59000),
        );
        assert_eq!(next, None);
    }
}
