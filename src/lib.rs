//! Kestrel - a deterministic, bias-free bar-replay backtesting engine.
//!
//! # Overview
//!
//! Kestrel simulates trading strategies against a chronological stream of
//! 1-minute OHLCV bars with realistic execution:
//!
//! - **No look-ahead**: indicator values visible on bar T are derived from
//!   bars strictly before T; higher-timeframe indicators only ever see
//!   closed buckets.
//! - **Realistic fills**: orders fill on the bar after they are emitted,
//!   with adverse slippage and maker/taker fees per side.
//! - **Gap protection**: a bar opening beyond a stop or target fills at
//!   the open, never at the skipped level.
//! - **Position lifecycle**: stop-loss, take-profit, sticky breakeven,
//!   trailing stops, one-shot partial take-profits, and limit-order merges
//!   into an existing position.
//! - **Deterministic accounting**: append-only fills and trades, an
//!   equity curve sampled at each close, and byte-identical reruns.
//!
//! # Quick start
//!
//! ```no_run
//! use kestrel::config::EngineConfig;
//! use kestrel::data::{CsvProvider, LoaderConfig};
//! use kestrel::declarative::DeclarativeStrategy;
//! use kestrel::engine::Engine;
//!
//! let mut strategy = DeclarativeStrategy::from_json_path("trend.json")?;
//! let mut config = EngineConfig::default();
//! config.indicators = strategy.indicators().clone();
//!
//! let mut provider = CsvProvider::new("ETH_1m.csv", "", &LoaderConfig::default())?;
//! let mut engine = Engine::new(config)?;
//! let results = engine.run(&mut strategy, &mut provider)?;
//! println!("{}", results.summary());
//! # Ok::<(), kestrel::error::BacktestError>(())
//! ```
//!
//! # Custom strategies
//!
//! Implement [`strategy::Strategy`] to write strategies in code:
//!
//! ```
//! use kestrel::error::Result;
//! use kestrel::indicators::IndicatorValues;
//! use kestrel::strategy::Strategy;
//! use kestrel::types::{Bar, Order, OrderRequest, Position, Side};
//!
//! struct Momentum;
//!
//! impl Strategy for Momentum {
//!     fn on_bar(
//!         &mut self,
//!         bar: &Bar,
//!         indicators: &IndicatorValues,
//!         positions: &[Position],
//!     ) -> Result<Vec<OrderRequest>> {
//!         if positions.is_empty() && bar.is_bullish() {
//!             Ok(vec![Order::market(Side::Long).with_stop_loss(0.03).into()])
//!         } else {
//!             Ok(Vec::new())
//!         }
//!     }
//! }
//! ```
//!
//! # Modules
//!
//! - [`types`]: core value types (Bar, Order, Position, Fill, Trade)
//! - [`execution`]: slippage, fees, and exit evaluation
//! - [`indicators`]: streaming indicators, resampling, the manager
//! - [`portfolio`]: position ownership, equity, drawdown
//! - [`engine`]: the 4-phase bar loop, events, parameter sweeps
//! - [`multi_asset`]: time-merged multi-symbol runs over one portfolio
//! - [`step`]: `reset()`/`step(action)` interface for RL agents
//! - [`declarative`]: JSON condition-tree strategies
//! - [`data`]: providers, CSV/Parquet loading, stream validation
//! - [`results`]: metrics, monthly breakdowns, summaries

pub mod config;
pub mod data;
pub mod declarative;
pub mod engine;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod multi_asset;
pub mod portfolio;
pub mod results;
pub mod sizing;
pub mod step;
pub mod strategy;
pub mod types;

// Re-exports for convenience
pub use config::{EngineConfig, SymbolOverrides};
pub use data::{
    load_bars, load_csv, load_parquet, CsvProvider, DataProvider, LoaderConfig, ReplayProvider,
    SliceProvider, ValidationPolicy,
};
pub use declarative::{DeclarativeStrategy, StrategySpec};
pub use engine::{BarProcessor, Engine, Event, EventKind, Listener, ListenerId};
pub use error::{BacktestError, Result};
pub use execution::{ExecutionModel, ExitTrigger};
pub use indicators::{IndicatorManager, IndicatorSpec, IndicatorValue, IndicatorValues};
pub use multi_asset::MultiAssetEngine;
pub use portfolio::Portfolio;
pub use results::{BacktestResults, MonthStats, MultiAssetResults, SymbolSummary};
pub use sizing::{EquityPctSizer, FixedSizer, PositionSizer, RiskPctSizer};
pub use step::{StepEngine, StepObservation, StepResult};
pub use strategy::{Strategy, StrategyExit};
pub use types::{
    Bar, EquityPoint, ExitReason, Fill, Order, OrderKind, OrderRequest, Position, Side, Timeframe,
    Trade,
};
