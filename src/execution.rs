//! Execution model: adverse slippage, maker/taker fees, exit evaluation.

use crate::types::{Bar, ExitReason, Position, Side};
use serde::{Deserialize, Serialize};

/// Outcome of evaluating a position against a bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitTrigger {
    /// Close the whole position at `raw_price` (before exit slippage).
    Close { raw_price: f64, reason: ExitReason },
    /// Close `fraction` of the position at `raw_price`.
    PartialClose {
        raw_price: f64,
        fraction: f64,
        reason: ExitReason,
    },
}

/// Handles realistic order execution.
///
/// Slippage is always adverse: entries fill away from the trader, exits
/// fill away from the trader. Fees are charged per side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionModel {
    /// Slippage per side as a decimal (0.0002 = 0.02%).
    pub slippage: f64,
    /// Taker fee per side as a decimal (0.00015 = 0.015%).
    pub taker_fee: f64,
    /// Maker fee per side as a decimal.
    pub maker_fee: f64,
}

impl Default for ExecutionModel {
    fn default() -> Self {
        Self {
            slippage: 0.0002,
            taker_fee: 0.00015,
            maker_fee: 0.0,
        }
    }
}

impl ExecutionModel {
    pub fn new(slippage: f64, taker_fee: f64, maker_fee: f64) -> Self {
        Self {
            slippage,
            taker_fee,
            maker_fee,
        }
    }

    /// Entry price after adverse slippage: LONG pays up, SHORT receives less.
    pub fn entry_price(&self, raw: f64, side: Side) -> f64 {
        match side {
            Side::Long => raw * (1.0 + self.slippage),
            Side::Short => raw * (1.0 - self.slippage),
        }
    }

    /// Exit price after adverse slippage: LONG receives less, SHORT pays up.
    pub fn exit_price(&self, raw: f64, side: Side) -> f64 {
        match side {
            Side::Long => raw * (1.0 - self.slippage),
            Side::Short => raw * (1.0 + self.slippage),
        }
    }

    /// Fee for one side of a trade.
    pub fn fee(&self, size_usd: f64, is_maker: bool) -> f64 {
        let rate = if is_maker {
            self.maker_fee
        } else {
            self.taker_fee
        };
        size_usd * rate
    }

    /// Slippage cost in quote units for one side of a trade.
    pub fn slippage_cost(&self, size_usd: f64) -> f64 {
        size_usd * self.slippage
    }

    /// Would a resting limit order fill on this bar?
    ///
    /// A buy limit fills when the bar trades down to it, a sell limit when
    /// the bar trades up to it.
    pub fn check_limit_fill(&self, limit_price: f64, side: Side, bar: &Bar) -> bool {
        match side {
            Side::Long => bar.low <= limit_price,
            Side::Short => bar.high >= limit_price,
        }
    }

    /// Would an entry stop order fill on this bar? Returns the raw fill
    /// price: the open when the bar gapped through the stop, otherwise the
    /// stop price itself.
    pub fn check_stop_fill(&self, stop_price: f64, side: Side, bar: &Bar) -> Option<f64> {
        match side {
            Side::Long => {
                if bar.open >= stop_price {
                    Some(bar.open)
                } else if bar.high >= stop_price {
                    Some(stop_price)
                } else {
                    None
                }
            }
            Side::Short => {
                if bar.open <= stop_price {
                    Some(bar.open)
                } else if bar.low <= stop_price {
                    Some(stop_price)
                } else {
                    None
                }
            }
        }
    }

    /// Evaluate a position's exit rules against a bar.
    ///
    /// Priority: gap-through stop, gap-through take profit, intra-bar stop,
    /// breakeven activation + trailing ratchet (which may fire a same-bar
    /// stop), intra-bar take profit (partial first when configured).
    /// Mutates the position's extremes and breakeven/trailing state; returns
    /// the first matching trigger with its raw (pre-slippage) price.
    pub fn check_exit(&self, pos: &mut Position, bar: &Bar) -> Option<ExitTrigger> {
        pos.position_high = pos.position_high.max(bar.high);
        pos.position_low = pos.position_low.min(bar.low);

        if let Some(trigger) = self.check_gap_exits(pos, bar) {
            return Some(trigger);
        }

        if let Some(sl) = pos.stop_loss {
            if Self::stop_hit(pos.side, sl, bar) {
                return Some(ExitTrigger::Close {
                    raw_price: sl,
                    reason: stop_reason(pos, false),
                });
            }
        }

        self.update_breakeven(pos);
        self.update_trailing(pos);

        // A stop raised this bar can fire on this same bar.
        if let Some(sl) = pos.stop_loss {
            if Self::stop_hit(pos.side, sl, bar) {
                return Some(ExitTrigger::Close {
                    raw_price: sl,
                    reason: stop_reason(pos, false),
                });
            }
        }

        if let Some(tp) = pos.take_profit {
            let tp_hit = match pos.side {
                Side::Long => bar.high >= tp,
                Side::Short => bar.low <= tp,
            };
            if tp_hit {
                if pos.partial_tp_pct > 0.0 && !pos.partial_tp_done {
                    return Some(ExitTrigger::PartialClose {
                        raw_price: tp,
                        fraction: pos.partial_tp_pct,
                        reason: ExitReason::PartialTp,
                    });
                }
                return Some(ExitTrigger::Close {
                    raw_price: tp,
                    reason: ExitReason::TakeProfit,
                });
            }
        }

        None
    }

    /// Gap protection: the bar opened already beyond SL or TP.
    fn check_gap_exits(&self, pos: &Position, bar: &Bar) -> Option<ExitTrigger> {
        if let Some(sl) = pos.stop_loss {
            let gapped = match pos.side {
                Side::Long => bar.open <= sl,
                Side::Short => bar.open >= sl,
            };
            if gapped {
                return Some(ExitTrigger::Close {
                    raw_price: bar.open,
                    reason: stop_reason(pos, true),
                });
            }
        }
        if let Some(tp) = pos.take_profit {
            let gapped = match pos.side {
                Side::Long => bar.open >= tp,
                Side::Short => bar.open <= tp,
            };
            if gapped {
                // Partial TP does not apply to gap fills.
                return Some(ExitTrigger::Close {
                    raw_price: bar.open,
                    reason: ExitReason::TakeProfitGap,
                });
            }
        }
        None
    }

    fn stop_hit(side: Side, sl: f64, bar: &Bar) -> bool {
        match side {
            Side::Long => bar.low <= sl,
            Side::Short => bar.high >= sl,
        }
    }

    /// Once favorable excursion reaches the trigger, lock the stop at a
    /// small profit. Sticky: never loosens an already-raised stop.
    fn update_breakeven(&self, pos: &mut Position) {
        if pos.breakeven_activated || pos.breakeven_trigger_pct <= 0.0 {
            return;
        }
        if pos.peak_profit_pct() < pos.breakeven_trigger_pct {
            return;
        }
        let lock = match pos.side {
            Side::Long => pos.entry_price * (1.0 + pos.breakeven_lock_pct),
            Side::Short => pos.entry_price * (1.0 - pos.breakeven_lock_pct),
        };
        pos.stop_loss = Some(tighter_stop(pos.side, pos.stop_loss, lock));
        pos.breakeven_activated = true;
    }

    /// Ratchet the stop toward price once activation excursion is reached.
    fn update_trailing(&self, pos: &mut Position) {
        if pos.trail_pct <= 0.0 {
            return;
        }
        if pos.peak_profit_pct() < pos.trail_activation_pct {
            return;
        }
        pos.trailing_activated = true;
        let trail_sl = match pos.side {
            Side::Long => pos.position_high * (1.0 - pos.trail_pct),
            Side::Short => pos.position_low * (1.0 + pos.trail_pct),
        };
        pos.stop_loss = Some(tighter_stop(pos.side, pos.stop_loss, trail_sl));
    }
}

/// The tighter of an existing stop and a candidate: higher for LONG, lower
/// for SHORT.
fn tighter_stop(side: Side, current: Option<f64>, candidate: f64) -> f64 {
    match (side, current) {
        (Side::Long, Some(sl)) => sl.max(candidate),
        (Side::Short, Some(sl)) => sl.min(candidate),
        (_, None) => candidate,
    }
}

/// Which stop variant to report, by activation state. Trailing takes
/// precedence over breakeven.
fn stop_reason(pos: &Position, gap: bool) -> ExitReason {
    if pos.trailing_activated {
        if gap {
            ExitReason::TrailingStopGap
        } else {
            ExitReason::TrailingStop
        }
    } else if pos.breakeven_activated {
        if gap {
            ExitReason::BreakevenGap
        } else {
            ExitReason::Breakeven
        }
    } else if gap {
        ExitReason::StopLossGap
    } else {
        ExitReason::StopLoss
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar::new(
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
            1_000.0,
        )
    }

    fn long_position(entry: f64, sl: Option<f64>, tp: Option<f64>) -> Position {
        Position {
            side: Side::Long,
            entry_price: entry,
            entry_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            size_usd: 10_000.0,
            stop_loss: sl,
            take_profit: tp,
            symbol: "ETH".to_string(),
            group: None,
            entry_fees: 0.0,
            position_high: entry,
            position_low: entry,
            breakeven_activated: false,
            breakeven_trigger_pct: 0.0,
            breakeven_lock_pct: 0.0,
            trail_pct: 0.0,
            trail_activation_pct: 0.0,
            trailing_activated: false,
            partial_tp_pct: 0.0,
            partial_tp_new_tp_pct: 0.0,
            partial_tp_done: false,
        }
    }

    #[test]
    fn test_entry_slippage_is_adverse() {
        let exec = ExecutionModel::default();
        assert!(exec.entry_price(100.0, Side::Long) > 100.0);
        assert!(exec.entry_price(100.0, Side::Short) < 100.0);
        assert!((exec.entry_price(102.0, Side::Long) - 102.0204).abs() < 1e-9);
    }

    #[test]
    fn test_exit_slippage_is_adverse() {
        let exec = ExecutionModel::default();
        assert!(exec.exit_price(100.0, Side::Long) < 100.0);
        assert!(exec.exit_price(100.0, Side::Short) > 100.0);
        assert!((exec.exit_price(95.0, Side::Long) - 94.981).abs() < 1e-9);
    }

    #[test]
    fn test_fee_maker_taker() {
        let exec = ExecutionModel::default();
        assert!((exec.fee(10_000.0, false) - 1.5).abs() < 1e-12);
        assert!((exec.fee(10_000.0, true) - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_gap_through_stop() {
        let exec = ExecutionModel::default();
        let mut pos = long_position(100.0, Some(97.0), None);
        // Bar opens at 95, well below the 97 stop.
        let trigger = exec.check_exit(&mut pos, &bar(95.0, 95.0, 94.0, 94.5));
        assert_eq!(
            trigger,
            Some(ExitTrigger::Close {
                raw_price: 95.0,
                reason: ExitReason::StopLossGap,
            })
        );
    }

    #[test]
    fn test_open_exactly_at_stop_is_gap() {
        let exec = ExecutionModel::default();
        let mut pos = long_position(100.0, Some(97.0), None);
        let trigger = exec.check_exit(&mut pos, &bar(97.0, 98.0, 96.5, 97.5));
        assert!(matches!(
            trigger,
            Some(ExitTrigger::Close {
                reason: ExitReason::StopLossGap,
                ..
            })
        ));
    }

    #[test]
    fn test_intra_bar_stop_fills_at_level() {
        let exec = ExecutionModel::default();
        let mut pos = long_position(100.0, Some(97.0), None);
        let trigger = exec.check_exit(&mut pos, &bar(99.0, 99.5, 96.8, 98.0));
        assert_eq!(
            trigger,
            Some(ExitTrigger::Close {
                raw_price: 97.0,
                reason: ExitReason::StopLoss,
            })
        );
    }

    #[test]
    fn test_gap_stop_beats_intra_bar_tp() {
        let exec = ExecutionModel::default();
        let mut pos = long_position(100.0, Some(97.0), Some(101.0));
        // Opens through the stop but also trades up through TP: stop wins.
        let trigger = exec.check_exit(&mut pos, &bar(96.0, 102.0, 95.0, 101.0));
        assert!(matches!(
            trigger,
            Some(ExitTrigger::Close {
                reason: ExitReason::StopLossGap,
                ..
            })
        ));
    }

    #[test]
    fn test_breakeven_activates_and_sticks() {
        let exec = ExecutionModel::default();
        let mut pos = long_position(100.0, Some(97.0), None);
        pos.breakeven_trigger_pct = 0.015;
        pos.breakeven_lock_pct = 0.005;

        // Reaches +1.6% with the low held above the lock level: no exit,
        // SL rewritten to 100.5.
        let trigger = exec.check_exit(&mut pos, &bar(100.8, 101.6, 100.6, 100.9));
        assert!(trigger.is_none());
        assert!(pos.breakeven_activated);
        assert!((pos.stop_loss.unwrap() - 100.5).abs() < 1e-9);

        // A dip to 100.6 does not touch the raised stop.
        let trigger = exec.check_exit(&mut pos, &bar(100.8, 101.0, 100.6, 100.9));
        assert!(trigger.is_none());

        // A dip through 100.5 exits there, tagged as breakeven.
        let trigger = exec.check_exit(&mut pos, &bar(100.8, 100.9, 100.4, 100.6));
        assert_eq!(
            trigger,
            Some(ExitTrigger::Close {
                raw_price: 100.5,
                reason: ExitReason::Breakeven,
            })
        );
    }

    #[test]
    fn test_trailing_can_fire_on_activation_bar() {
        let exec = ExecutionModel::default();
        let mut pos = long_position(100.0, Some(95.0), None);
        pos.trail_pct = 0.01;
        pos.trail_activation_pct = 0.02;

        // High of 103 activates the trail; trail SL = 103 * 0.99 = 101.97,
        // and the bar's low of 101 is already below it.
        let trigger = exec.check_exit(&mut pos, &bar(100.5, 103.0, 101.0, 101.5));
        assert!(pos.trailing_activated);
        assert_eq!(
            trigger,
            Some(ExitTrigger::Close {
                raw_price: 101.97,
                reason: ExitReason::TrailingStop,
            })
        );
    }

    #[test]
    fn test_partial_tp_fires_before_full() {
        let exec = ExecutionModel::default();
        let mut pos = long_position(100.0, None, Some(105.0));
        pos.partial_tp_pct = 0.5;
        pos.partial_tp_new_tp_pct = 0.10;

        let trigger = exec.check_exit(&mut pos, &bar(101.0, 105.5, 100.5, 104.0));
        assert_eq!(
            trigger,
            Some(ExitTrigger::PartialClose {
                raw_price: 105.0,
                fraction: 0.5,
                reason: ExitReason::PartialTp,
            })
        );
    }

    #[test]
    fn test_partial_tp_ignored_on_gap() {
        let exec = ExecutionModel::default();
        let mut pos = long_position(100.0, None, Some(105.0));
        pos.partial_tp_pct = 0.5;

        let trigger = exec.check_exit(&mut pos, &bar(106.0, 107.0, 105.5, 106.5));
        assert_eq!(
            trigger,
            Some(ExitTrigger::Close {
                raw_price: 106.0,
                reason: ExitReason::TakeProfitGap,
            })
        );
    }

    #[test]
    fn test_short_side_mirrors() {
        let exec = ExecutionModel::default();
        let mut pos = long_position(100.0, Some(103.0), Some(95.0));
        pos.side = Side::Short;

        // Short stop is above entry: a spike through 103 exits.
        let trigger = exec.check_exit(&mut pos, &bar(101.0, 103.5, 100.5, 102.0));
        assert_eq!(
            trigger,
            Some(ExitTrigger::Close {
                raw_price: 103.0,
                reason: ExitReason::StopLoss,
            })
        );
    }

    #[test]
    fn test_limit_and_stop_triggers() {
        let exec = ExecutionModel::default();
        let b = bar(100.0, 101.0, 99.0, 100.5);
        assert!(exec.check_limit_fill(99.5, Side::Long, &b));
        assert!(!exec.check_limit_fill(98.5, Side::Long, &b));
        assert!(exec.check_limit_fill(100.5, Side::Short, &b));

        // Buy stop at 100.8 triggers intra-bar at the stop price.
        assert_eq!(exec.check_stop_fill(100.8, Side::Long, &b), Some(100.8));
        // Buy stop below the open fills at the open (gap through).
        assert_eq!(exec.check_stop_fill(99.5, Side::Long, &b), Some(100.0));
        assert_eq!(exec.check_stop_fill(102.0, Side::Long, &b), None);
    }
}
