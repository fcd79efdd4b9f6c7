//! Strategy trait and related types.
//!
//! A strategy is defined by the capability set `configure` / `on_bar` /
//! `on_fill` / `on_exit` / `check_exits`; everything except `on_bar` has a
//! no-op default. Callbacks are fallible so the engine can surface a
//! failure with the bar it occurred on; a callback error aborts the run
//! with no partial results.
//!
//! The engine owns execution: an order returned from `on_bar` executes at
//! the *next* bar at the earliest, and the indicator values passed to
//! `on_bar(bar_t)` are derived from bars strictly before `bar_t`.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::indicators::IndicatorValues;
use crate::types::{Bar, ExitReason, Fill, OrderRequest, Position, Trade};

/// A strategy-initiated exit returned from [`Strategy::check_exits`].
///
/// `index` addresses the positions slice the callback received; the raw
/// price still gets exit slippage applied.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyExit {
    pub index: usize,
    pub price: f64,
    pub reason: ExitReason,
    /// Close only this fraction of the position when set.
    pub fraction: Option<f64>,
}

impl StrategyExit {
    pub fn full(index: usize, price: f64, reason: ExitReason) -> Self {
        Self {
            index,
            price,
            reason,
            fraction: None,
        }
    }

    pub fn partial(index: usize, price: f64, reason: ExitReason, fraction: f64) -> Self {
        Self {
            index,
            price,
            reason,
            fraction: Some(fraction),
        }
    }
}

/// Trait implemented by all trading strategies.
pub trait Strategy: Send {
    /// One-shot initialization before the run starts.
    fn configure(&mut self, _config: &EngineConfig) -> Result<()> {
        Ok(())
    }

    /// Called once per completed bar with the current indicator values and
    /// a snapshot of this symbol's open positions. Returned orders are
    /// queued for execution on subsequent bars.
    fn on_bar(
        &mut self,
        bar: &Bar,
        indicators: &IndicatorValues,
        positions: &[Position],
    ) -> Result<Vec<OrderRequest>>;

    /// Called after every entry or merge fill.
    fn on_fill(&mut self, _fill: &Fill) -> Result<Option<OrderRequest>> {
        Ok(None)
    }

    /// Called after each position close (full or partial).
    fn on_exit(&mut self, _fill: &Fill, _trade: &Trade) -> Result<Option<OrderRequest>> {
        Ok(None)
    }

    /// Strategy-driven exits, evaluated after the engine's own exit rules.
    fn check_exits(&mut self, _bar: &Bar, _positions: &[Position]) -> Result<Vec<StrategyExit>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Order, Side};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    struct CountingStrategy {
        bars_seen: usize,
    }

    impl Strategy for CountingStrategy {
        fn on_bar(
            &mut self,
            _bar: &Bar,
            _indicators: &IndicatorValues,
            _positions: &[Position],
        ) -> Result<Vec<OrderRequest>> {
            self.bars_seen += 1;
            if self.bars_seen == 1 {
                Ok(vec![Order::market(Side::Long).into()])
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[test]
    fn test_default_callbacks_are_noops() {
        let mut strategy = CountingStrategy { bars_seen: 0 };
        let bar = Bar::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            100.0,
            101.0,
            99.0,
            100.0,
            1.0,
        );

        let requests = strategy
            .on_bar(&bar, &BTreeMap::new(), &[])
            .unwrap();
        assert_eq!(requests.len(), 1);

        assert!(strategy.check_exits(&bar, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_strategy_exit_constructors() {
        let full = StrategyExit::full(0, 101.5, ExitReason::Signal);
        assert_eq!(full.fraction, None);

        let partial = StrategyExit::partial(1, 99.0, ExitReason::Signal, 0.25);
        assert_eq!(partial.fraction, Some(0.25));
        assert_eq!(partial.index, 1);
    }
}
