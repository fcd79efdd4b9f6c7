//! Step mode: a `reset()`/`step(action)` re-expression of the bar loop
//! for reinforcement-learning callers.
//!
//! The engine's signal phase is replaced by a proxy strategy that never
//! emits orders; the agent controls entries exclusively through
//! `step(action)`. Exit management (SL/TP/breakeven/trailing) still runs
//! inside the engine as usual. An optional inner strategy can be attached
//! to keep `on_fill`/`on_exit`/`check_exits` behavior while the agent owns
//! entries.

use crate::config::EngineConfig;
use crate::data::DataProvider;
use crate::engine::Engine;
use crate::error::{BacktestError, Result};
use crate::indicators::IndicatorValues;
use crate::strategy::{Strategy, StrategyExit};
use crate::types::{Bar, Fill, Order, OrderRequest, Position, Trade};

/// What the agent sees after each step.
#[derive(Debug, Clone)]
pub struct StepObservation {
    /// The bar just processed; `None` only when the stream was empty.
    pub bar: Option<Bar>,
    pub indicators: IndicatorValues,
    pub positions: Vec<Position>,
    pub equity: f64,
    pub step_count: usize,
    pub done: bool,
}

/// Fills and closed trades produced by one step.
#[derive(Debug, Clone, Default)]
pub struct StepInfo {
    pub fills: Vec<Fill>,
    pub exits: Vec<Trade>,
}

/// Returned from [`StepEngine::step`].
#[derive(Debug, Clone)]
pub struct StepResult {
    pub observation: StepObservation,
    /// Equity change over the step.
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
}

/// Internal strategy whose signal phase yields nothing; optional inner
/// strategy handles the other callbacks.
struct ProxyStrategy {
    inner: Option<Box<dyn Strategy>>,
}

impl Strategy for ProxyStrategy {
    fn configure(&mut self, config: &EngineConfig) -> Result<()> {
        if let Some(inner) = &mut self.inner {
            inner.configure(config)?;
        }
        Ok(())
    }

    fn on_bar(
        &mut self,
        _bar: &Bar,
        _indicators: &IndicatorValues,
        _positions: &[Position],
    ) -> Result<Vec<OrderRequest>> {
        Ok(Vec::new())
    }

    fn on_fill(&mut self, fill: &Fill) -> Result<Option<OrderRequest>> {
        match &mut self.inner {
            Some(inner) => inner.on_fill(fill),
            None => Ok(None),
        }
    }

    fn on_exit(&mut self, fill: &Fill, trade: &Trade) -> Result<Option<OrderRequest>> {
        match &mut self.inner {
            Some(inner) => inner.on_exit(fill, trade),
            None => Ok(None),
        }
    }

    fn check_exits(&mut self, bar: &Bar, positions: &[Position]) -> Result<Vec<StrategyExit>> {
        match &mut self.inner {
            Some(inner) => inner.check_exits(bar, positions),
            None => Ok(Vec::new()),
        }
    }
}

/// Gym-like step interface wrapping the backtest engine.
pub struct StepEngine {
    engine: Engine,
    provider: Box<dyn DataProvider>,
    proxy: ProxyStrategy,
    step_count: usize,
    done: bool,
    prev_equity: f64,
    current_bar: Option<Bar>,
}

impl StepEngine {
    /// Create a step engine over a provider. `inner` optionally keeps a
    /// strategy's fill/exit callbacks active while the agent drives
    /// entries.
    pub fn new(
        provider: Box<dyn DataProvider>,
        config: EngineConfig,
        inner: Option<Box<dyn Strategy>>,
    ) -> Result<Self> {
        let initial_equity = config.initial_equity;
        let engine = Engine::new(config)?;
        Ok(Self {
            engine,
            provider,
            proxy: ProxyStrategy { inner },
            step_count: 0,
            done: false,
            prev_equity: initial_equity,
            current_bar: None,
        })
    }

    pub fn portfolio(&self) -> &crate::portfolio::Portfolio {
        self.engine.portfolio()
    }

    fn observation(&self, bar: Option<Bar>, done: bool) -> StepObservation {
        StepObservation {
            bar,
            indicators: self.engine.processor().indicators().values(),
            positions: self.engine.portfolio().positions().to_vec(),
            equity: self.engine.portfolio().equity,
            step_count: self.step_count,
            done,
        }
    }

    /// Rewind everything and advance to the first bar, which seeds the
    /// indicators. Returns the initial observation.
    pub fn reset(&mut self) -> Result<StepObservation> {
        let config = self.engine.config().clone();
        self.proxy.configure(&config)?;
        self.engine.reset_state();
        self.provider.reset();
        self.step_count = 0;
        self.done = false;
        self.prev_equity = self.engine.portfolio().initial_equity;

        let Some(bar) = self.provider.next_bar() else {
            self.done = true;
            return Ok(self.observation(None, true));
        };

        self.engine.processor_mut().indicators_mut().update(&bar);
        self.current_bar = Some(bar.clone());
        Ok(self.observation(Some(bar), false))
    }

    /// Queue the agent's action as if it came from the signal phase, then
    /// advance one bar through the loop (fills and exit evaluation run,
    /// the signal phase yields nothing).
    pub fn step(&mut self, action: Option<Order>) -> Result<StepResult> {
        if self.done {
            return Err(BacktestError::InvalidInput(
                "data exhausted; call reset() to start over".to_string(),
            ));
        }

        if let Some(order) = action {
            self.engine.processor_mut().inject(order)?;
        }

        let fills_before = self.engine.portfolio().fills().len();
        let trades_before = self.engine.portfolio().trades().len();

        let Some(bar) = self.provider.next_bar() else {
            self.done = true;
            let equity = self.engine.portfolio().equity;
            let reward = equity - self.prev_equity;
            self.prev_equity = equity;
            self.step_count += 1;
            let observation = self.observation(self.current_bar.clone(), true);
            return Ok(StepResult {
                observation,
                reward,
                done: true,
                info: StepInfo::default(),
            });
        };

        self.current_bar = Some(bar.clone());
        self.engine.process_one(&bar, &mut self.proxy)?;

        let equity = self.engine.portfolio().equity;
        let reward = equity - self.prev_equity;
        self.prev_equity = equity;
        self.step_count += 1;

        let info = StepInfo {
            fills: self.engine.portfolio().fills()[fills_before..].to_vec(),
            exits: self.engine.portfolio().trades()[trades_before..].to_vec(),
        };

        Ok(StepResult {
            observation: self.observation(Some(bar), false),
            reward,
            done: false,
            info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SliceProvider;
    use crate::types::Side;
    use chrono::{Duration, TimeZone, Utc};

    fn bars(count: usize, price: f64) -> Vec<Bar> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..count)
            .map(|i| {
                Bar::new(
                    base + Duration::minutes(i as i64),
                    price,
                    price + 1.0,
                    price - 1.0,
                    price,
                    10.0,
                )
            })
            .collect()
    }

    fn step_engine(count: usize) -> StepEngine {
        let provider = Box::new(SliceProvider::new(bars(count, 100.0), "ETH"));
        StepEngine::new(provider, EngineConfig::default(), None).unwrap()
    }

    #[test]
    fn test_reset_returns_first_bar() {
        let mut env = step_engine(5);
        let obs = env.reset().unwrap();
        assert!(!obs.done);
        assert_eq!(obs.step_count, 0);
        assert_eq!(obs.equity, 10_000.0);
        assert!(obs.bar.is_some());
        assert!(obs.positions.is_empty());
    }

    #[test]
    fn test_market_action_fills_next_step() {
        let mut env = step_engine(5);
        env.reset().unwrap();

        let result = env
            .step(Some(Order::market(Side::Long).with_size(5_000.0)))
            .unwrap();
        assert_eq!(result.info.fills.len(), 1);
        assert_eq!(result.observation.positions.len(), 1);
        assert!((result.observation.positions[0].size_usd - 5_000.0).abs() < 1e-9);
        // Entry fee only; no price move on flat bars.
        assert!(result.reward < 0.0);
    }

    #[test]
    fn test_reward_is_equity_delta() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        // Price jumps to 110 on the third bar so the TP at +5% fires.
        let series = vec![
            Bar::new(base, 100.0, 100.5, 99.5, 100.0, 1.0),
            Bar::new(base + Duration::minutes(1), 100.0, 100.5, 99.5, 100.0, 1.0),
            Bar::new(base + Duration::minutes(2), 110.0, 110.5, 109.5, 110.0, 1.0),
        ];
        let provider = Box::new(SliceProvider::new(series, "ETH"));
        let mut config = EngineConfig::default();
        config.slippage = 0.0;
        config.taker_fee = 0.0;
        let mut env = StepEngine::new(provider, config, None).unwrap();
        env.reset().unwrap();

        let fill_step = env
            .step(Some(Order::market(Side::Long).with_take_profit(0.05)))
            .unwrap();
        assert_eq!(fill_step.info.fills.len(), 1);

        // Bar 2 opens at 110, gapping through the 105 TP.
        let exit_step = env.step(None).unwrap();
        assert_eq!(exit_step.info.exits.len(), 1);
        assert!((exit_step.reward - 1_000.0).abs() < 1e-9);
        assert!((env.portfolio().equity - 11_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_done_after_exhaustion() {
        let mut env = step_engine(2);
        env.reset().unwrap();
        let r1 = env.step(None).unwrap();
        assert!(!r1.done);
        let r2 = env.step(None).unwrap();
        assert!(r2.done);
        assert!(env.step(None).is_err());
    }

    #[test]
    fn test_reset_restarts_cleanly() {
        let mut env = step_engine(3);
        env.reset().unwrap();
        env.step(Some(Order::market(Side::Long))).unwrap();
        assert_eq!(env.portfolio().fills().len(), 1);

        let obs = env.reset().unwrap();
        assert!(!obs.done);
        assert_eq!(env.portfolio().fills().len(), 0);
        assert_eq!(env.portfolio().equity, 10_000.0);
    }
}
