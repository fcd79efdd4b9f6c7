//! Time-synchronized multi-symbol backtesting.
//!
//! Bars from all providers are merged chronologically through a min-heap;
//! equal timestamps resolve in lexicographic symbol order for determinism.
//! Each symbol keeps its own pending queues and indicator manager, while a
//! single shared portfolio tracks all positions, so equity and drawdown
//! are portfolio-wide and correlated drawdowns are captured. Dispatch is
//! serialized, which makes sharing the portfolio safe.

use crate::config::EngineConfig;
use crate::data::DataProvider;
use crate::engine::{BarProcessor, EventHub, EventKind, Listener, ListenerId};
use crate::error::{BacktestError, Result};
use crate::execution::ExecutionModel;
use crate::portfolio::Portfolio;
use crate::results::MultiAssetResults;
use crate::strategy::Strategy;
use crate::types::Bar;
use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, BTreeMap};
use tracing::info;

/// Heap entry: ordered by (timestamp, symbol rank), carrying the bar and
/// the provider it came from.
struct HeapItem {
    timestamp: DateTime<Utc>,
    rank: usize,
    provider_idx: usize,
    bar: Bar,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.rank == other.rank
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.timestamp, self.rank).cmp(&(other.timestamp, other.rank))
    }
}

/// Run one strategy against multiple symbols in a single merged loop.
pub struct MultiAssetEngine {
    config: EngineConfig,
    portfolio: Portfolio,
    events: EventHub,
}

impl MultiAssetEngine {
    /// Create a multi-asset engine. Fails fast on an invalid
    /// configuration.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let execution = ExecutionModel::new(config.slippage, config.taker_fee, config.maker_fee);
        let mut portfolio =
            Portfolio::new(config.initial_equity, config.default_size_usd, execution);
        if let Some(sizer) = &config.sizer {
            portfolio.set_sizer(sizer.clone());
        }
        portfolio.set_exposure_cap(config.max_total_exposure_usd);
        Ok(Self {
            config,
            portfolio,
            events: EventHub::new(),
        })
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    /// Register an event listener shared across all symbols.
    pub fn on(&mut self, kind: EventKind, callback: Listener) -> ListenerId {
        self.events.on(kind, callback)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.events.remove(id)
    }

    /// Execute the backtest across all providers.
    pub fn run(
        &mut self,
        strategy: &mut dyn Strategy,
        providers: &mut [Box<dyn DataProvider>],
    ) -> Result<MultiAssetResults> {
        if providers.is_empty() {
            return Err(BacktestError::NoData);
        }

        let symbols: Vec<String> = providers.iter().map(|p| p.symbol().to_string()).collect();
        {
            let mut unique: Vec<&String> = symbols.iter().collect();
            unique.sort();
            unique.dedup();
            if unique.len() != symbols.len() {
                return Err(BacktestError::InvalidInput(
                    "duplicate symbols across providers".to_string(),
                ));
            }
        }

        // Rank symbols lexicographically for deterministic tie-breaks.
        let mut sorted_symbols = symbols.clone();
        sorted_symbols.sort();
        let rank_of = |symbol: &str| -> usize {
            sorted_symbols
                .iter()
                .position(|s| s == symbol)
                .expect("symbol is present")
        };

        strategy.configure(&self.config)?;
        self.portfolio.reset();

        // One processor per symbol, with that symbol's config overrides.
        let mut processors: Vec<BarProcessor> = symbols
            .iter()
            .map(|symbol| BarProcessor::new(&self.config.resolve_for(symbol)))
            .collect();

        let mut first_bars: BTreeMap<String, Bar> = BTreeMap::new();
        let mut last_bars: BTreeMap<String, Bar> = BTreeMap::new();

        info!(symbols = ?sorted_symbols, "starting multi-asset backtest");

        let mut heap: BinaryHeap<Reverse<HeapItem>> = BinaryHeap::new();
        for (idx, provider) in providers.iter_mut().enumerate() {
            provider.reset();
            if let Some(mut bar) = provider.next_bar() {
                if bar.symbol.is_empty() {
                    bar.symbol = symbols[idx].clone();
                }
                heap.push(Reverse(HeapItem {
                    timestamp: bar.timestamp,
                    rank: rank_of(&symbols[idx]),
                    provider_idx: idx,
                    bar,
                }));
            }
        }

        while let Some(Reverse(item)) = heap.pop() {
            let idx = item.provider_idx;
            let bar = item.bar;

            first_bars
                .entry(symbols[idx].clone())
                .or_insert_with(|| bar.clone());
            last_bars.insert(symbols[idx].clone(), bar.clone());

            processors[idx].process_bar(&bar, &mut self.portfolio, strategy, &mut self.events)?;

            if let Some(mut next) = providers[idx].next_bar() {
                if next.symbol.is_empty() {
                    next.symbol = symbols[idx].clone();
                }
                heap.push(Reverse(HeapItem {
                    timestamp: next.timestamp,
                    rank: item.rank,
                    provider_idx: idx,
                    bar: next,
                }));
            }
        }

        let results = MultiAssetResults::from_portfolio(&self.portfolio, &first_bars, &last_bars);
        info!(
            net_pnl = results.net_pnl,
            trades = results.total_trades,
            "multi-asset backtest complete"
        );
        Ok(results)
    }
}
