//! The backtest engine: per-bar state machine and run loop.
//!
//! Each arriving 1m bar moves through four strictly ordered phases:
//!
//! 1. Fill pending orders: the market slot, then the limit queue in
//!    insertion order, then the stop queue in insertion order.
//! 2. Exit evaluation with gap protection (see [`crate::execution`]).
//! 3. Strategy-initiated exits via `check_exits`.
//! 4. Strategy signals via `on_bar` (skipped when an exit fired this bar
//!    and `skip_signal_on_close` is set), then the indicator update.
//!
//! Indicators are updated with the bar *after* `on_bar` ran, so the values
//! a strategy observes on bar T are derived from bars [0..T-1] only.

use crate::config::EngineConfig;
use crate::data::{DataProvider, SliceProvider};
use crate::error::{BacktestError, Result};
use crate::execution::{ExecutionModel, ExitTrigger};
use crate::indicators::IndicatorManager;
use crate::portfolio::Portfolio;
use crate::results::BacktestResults;
use crate::strategy::Strategy;
use crate::types::{Bar, Fill, Order, OrderKind, OrderRequest, Position, Trade};
use rayon::prelude::*;
use tracing::{debug, info, warn};

/// Event stream kinds a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Bar,
    Fill,
    Exit,
    Signal,
}

/// A single engine event, borrowed for the duration of the callback.
#[derive(Debug)]
pub enum Event<'a> {
    Bar(&'a Bar),
    Fill(&'a Fill),
    Exit(&'a Trade),
    Signal(&'a Order),
}

impl Event<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Bar(_) => EventKind::Bar,
            Event::Fill(_) => EventKind::Fill,
            Event::Exit(_) => EventKind::Exit,
            Event::Signal(_) => EventKind::Signal,
        }
    }
}

/// Handle for removing a registered listener.
pub type ListenerId = u64;

/// A registered event callback.
pub type Listener = Box<dyn FnMut(&Event<'_>) + Send>;

/// Listener registry. Callbacks fire synchronously in registration order;
/// removal is by the id returned at registration.
#[derive(Default)]
pub struct EventHub {
    next_id: ListenerId,
    listeners: Vec<(ListenerId, EventKind, Listener)>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, kind: EventKind, callback: Listener) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.push((id, kind, callback));
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _, _)| *lid != id);
        self.listeners.len() < before
    }

    pub fn emit(&mut self, event: &Event<'_>) {
        let kind = event.kind();
        for (_, k, callback) in self.listeners.iter_mut() {
            if *k == kind {
                callback(event);
            }
        }
    }
}

/// A queued order plus the number of bars it has been waiting.
#[derive(Debug, Clone)]
struct PendingEntry {
    order: Order,
    bars_elapsed: usize,
}

impl PendingEntry {
    fn new(order: Order) -> Self {
        Self {
            order,
            bars_elapsed: 0,
        }
    }
}

/// Per-symbol 4-phase execution loop. Owns the pending-order queues and
/// the symbol's indicator manager; all position state lives in the
/// portfolio passed to [`BarProcessor::process_bar`].
pub struct BarProcessor {
    max_positions: usize,
    default_size_usd: f64,
    skip_signal_on_close: bool,
    same_direction_only: bool,
    pending_market: Option<Order>,
    pending_limits: Vec<PendingEntry>,
    pending_stops: Vec<PendingEntry>,
    indicators: IndicatorManager,
}

fn wrap_strategy<T>(result: Result<T>, bar: &Bar) -> Result<T> {
    result.map_err(|e| match e {
        err @ BacktestError::StrategyError { .. } => err,
        other => BacktestError::strategy(bar.timestamp, other.to_string()),
    })
}

fn order_symbol(order: &Order, bar: &Bar) -> String {
    order.symbol.clone().unwrap_or_else(|| bar.symbol.clone())
}

impl BarProcessor {
    /// Build a processor from an already symbol-resolved configuration.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_positions: config.max_positions,
            default_size_usd: config.default_size_usd,
            skip_signal_on_close: config.skip_signal_on_close,
            same_direction_only: config.same_direction_only,
            pending_market: None,
            pending_limits: Vec::new(),
            pending_stops: Vec::new(),
            indicators: IndicatorManager::new(&config.indicators),
        }
    }

    pub fn indicators(&self) -> &IndicatorManager {
        &self.indicators
    }

    pub fn indicators_mut(&mut self) -> &mut IndicatorManager {
        &mut self.indicators
    }

    /// Clear pending state and restart indicator warmup.
    pub fn reset(&mut self) {
        self.pending_market = None;
        self.pending_limits.clear();
        self.pending_stops.clear();
        self.indicators.reset();
    }

    /// Queue an order directly, bypassing the signal phase (step mode).
    pub fn inject(&mut self, order: Order) -> Result<()> {
        order.validate()?;
        if order.cancel_pending_limits {
            self.pending_limits.clear();
        }
        match order.kind {
            OrderKind::Market => self.pending_market = Some(order),
            OrderKind::Limit { .. } => self.pending_limits.push(PendingEntry::new(order)),
            OrderKind::Stop { .. } => self.pending_stops.push(PendingEntry::new(order)),
        }
        Ok(())
    }

    /// Explicit size, then the portfolio's sizer, then this processor's
    /// default size.
    fn resolve_size(
        &self,
        portfolio: &Portfolio,
        order: &Order,
        price: f64,
        symbol: &str,
    ) -> f64 {
        if let Some(size) = order.size_usd {
            return size;
        }
        portfolio
            .sizer_size(order, price, symbol)
            .unwrap_or(self.default_size_usd)
    }

    /// Route a strategy-returned request into the queues. Market orders
    /// replace the pending market slot (last wins); limit and stop orders
    /// append. Returns true when the limit queue was cleared.
    fn queue_request(
        &mut self,
        request: OrderRequest,
        bar: &Bar,
        portfolio: &Portfolio,
        check_direction: bool,
        events: &mut EventHub,
    ) -> Result<bool> {
        match request {
            OrderRequest::CancelPendingLimits => {
                self.pending_limits.clear();
                Ok(true)
            }
            OrderRequest::Place(order) => {
                order.validate()?;
                if check_direction && self.same_direction_only {
                    let symbol = order_symbol(&order, bar);
                    if portfolio
                        .symbol_side(&symbol)
                        .is_some_and(|side| side != order.side)
                    {
                        debug!(symbol = %symbol, "dropped opposite-side order");
                        return Ok(false);
                    }
                }
                let cancelled = order.cancel_pending_limits;
                if cancelled {
                    self.pending_limits.clear();
                }
                events.emit(&Event::Signal(&order));
                match order.kind {
                    OrderKind::Market => self.pending_market = Some(order),
                    OrderKind::Limit { .. } => self.pending_limits.push(PendingEntry::new(order)),
                    OrderKind::Stop { .. } => self.pending_stops.push(PendingEntry::new(order)),
                }
                Ok(cancelled)
            }
        }
    }

    /// Emit the fill event, run `on_fill`, and queue any follow-up.
    /// Returns true when the follow-up cleared the limit queue.
    fn after_fill(
        &mut self,
        fill: &Fill,
        bar: &Bar,
        portfolio: &Portfolio,
        strategy: &mut dyn Strategy,
        events: &mut EventHub,
    ) -> Result<bool> {
        events.emit(&Event::Fill(fill));
        let follow_up = wrap_strategy(strategy.on_fill(fill), bar)?;
        match follow_up {
            Some(request) => self.queue_request(request, bar, portfolio, false, events),
            None => Ok(false),
        }
    }

    /// Emit the exit event, run `on_exit`, and queue any follow-up.
    fn after_exit(
        &mut self,
        trade: &Trade,
        bar: &Bar,
        portfolio: &Portfolio,
        strategy: &mut dyn Strategy,
        events: &mut EventHub,
    ) -> Result<()> {
        events.emit(&Event::Exit(trade));
        let fill = portfolio
            .fills()
            .last()
            .cloned()
            .expect("close recorded an exit fill");
        let follow_up = wrap_strategy(strategy.on_exit(&fill, trade), bar)?;
        if let Some(request) = follow_up {
            self.queue_request(request, bar, portfolio, false, events)?;
        }
        Ok(())
    }

    /// Process one bar through the four phases.
    pub fn process_bar(
        &mut self,
        bar: &Bar,
        portfolio: &mut Portfolio,
        strategy: &mut dyn Strategy,
        events: &mut EventHub,
    ) -> Result<()> {
        // Phase 1: pending market order fills at this bar's open.
        if let Some(order) = self.pending_market.clone() {
            let symbol = order_symbol(&order, bar);
            if self.same_direction_only
                && portfolio
                    .symbol_side(&symbol)
                    .is_some_and(|side| side != order.side)
            {
                // Conflicting direction: the order is discarded outright.
                self.pending_market = None;
            } else if portfolio.can_open(&symbol, order.group.as_deref(), self.max_positions) {
                let adj_price = portfolio.execution().entry_price(bar.open, order.side);
                let size = self.resolve_size(portfolio, &order, adj_price, &symbol);
                self.pending_market = None;
                if portfolio.exposure_allows(size) {
                    let sized = order.with_size(size);
                    let fill = portfolio.open_position(bar, &sized, bar.open, false);
                    self.after_fill(&fill, bar, portfolio, strategy, events)?;
                } else {
                    debug!(symbol = %symbol, size, "market order rejected by exposure cap");
                }
            }
            // Otherwise the slot stays occupied until a position frees up.
        }

        self.process_pending_limits(bar, portfolio, strategy, events)?;
        self.process_pending_stops(bar, portfolio, strategy, events)?;

        // Phase 2: engine exit rules with gap protection.
        let mut just_closed = false;
        let execution = *portfolio.execution();
        let mut triggers: Vec<(usize, ExitTrigger)> = Vec::new();
        for (idx, pos) in portfolio.positions_mut().iter_mut().enumerate() {
            if pos.symbol != bar.symbol {
                continue;
            }
            if let Some(trigger) = execution.check_exit(pos, bar) {
                triggers.push((idx, trigger));
            }
        }
        // Highest index first so earlier indices stay valid across removals.
        for (idx, trigger) in triggers.into_iter().rev() {
            let trade = match trigger {
                ExitTrigger::Close { raw_price, reason } => {
                    portfolio.close_position(idx, raw_price, bar.timestamp, reason, false)
                }
                ExitTrigger::PartialClose {
                    raw_price,
                    fraction,
                    reason,
                } => portfolio.partial_close_position(
                    idx,
                    fraction,
                    raw_price,
                    bar.timestamp,
                    reason,
                ),
            };
            self.after_exit(&trade, bar, portfolio, strategy, events)?;
            just_closed = true;
        }

        // Phase 3: strategy-initiated exits on this symbol's positions.
        let (snapshot, portfolio_indices) = self.symbol_positions(portfolio, bar);
        let mut strategy_exits = wrap_strategy(strategy.check_exits(bar, &snapshot), bar)?;
        strategy_exits.sort_by(|a, b| b.index.cmp(&a.index));
        let mut last_index = usize::MAX;
        for exit in strategy_exits {
            if exit.index >= portfolio_indices.len() || exit.index == last_index {
                continue;
            }
            last_index = exit.index;
            let pidx = portfolio_indices[exit.index];
            let trade = match exit.fraction {
                Some(fraction) => portfolio.partial_close_position(
                    pidx,
                    fraction,
                    exit.price,
                    bar.timestamp,
                    exit.reason,
                ),
                None => {
                    portfolio.close_position(pidx, exit.price, bar.timestamp, exit.reason, false)
                }
            };
            self.after_exit(&trade, bar, portfolio, strategy, events)?;
            just_closed = true;
        }

        // Phase 4: strategy signals, then the indicator update. Indicators
        // must only absorb this bar after on_bar observed the prior state.
        events.emit(&Event::Bar(bar));
        if !(just_closed && self.skip_signal_on_close) {
            let values = self.indicators.values();
            let (snapshot, _) = self.symbol_positions(portfolio, bar);
            let requests = wrap_strategy(strategy.on_bar(bar, &values, &snapshot), bar)?;
            for request in requests {
                self.queue_request(request, bar, portfolio, true, events)?;
            }
        }
        self.indicators.update(bar);

        Ok(())
    }

    /// Snapshot of this symbol's positions plus their portfolio indices.
    fn symbol_positions(&self, portfolio: &Portfolio, bar: &Bar) -> (Vec<Position>, Vec<usize>) {
        let mut snapshot = Vec::new();
        let mut indices = Vec::new();
        for (idx, pos) in portfolio.positions().iter().enumerate() {
            if pos.symbol == bar.symbol {
                snapshot.push(pos.clone());
                indices.push(idx);
            }
        }
        (snapshot, indices)
    }

    /// Phase 1b: walk the limit queue in insertion order.
    fn process_pending_limits(
        &mut self,
        bar: &Bar,
        portfolio: &mut Portfolio,
        strategy: &mut dyn Strategy,
        events: &mut EventHub,
    ) -> Result<()> {
        if self.pending_limits.is_empty() {
            return Ok(());
        }

        let mut queue = std::mem::take(&mut self.pending_limits);
        let mut survivors: Vec<PendingEntry> = Vec::new();
        let mut halted = false;

        for mut pending in queue.drain(..) {
            if halted {
                survivors.push(pending);
                continue;
            }

            let OrderKind::Limit {
                limit_price,
                timeout_bars,
                use_maker_fee,
                min_positions,
                merge_position,
            } = pending.order.kind
            else {
                continue;
            };
            let symbol = order_symbol(&pending.order, bar);
            let side = pending.order.side;

            let merge_idx = if merge_position {
                portfolio.find_mergeable(&symbol, side)
            } else {
                None
            };

            if merge_position {
                // Merge fills need an existing position to merge into.
                if merge_idx.is_none() {
                    pending.bars_elapsed += 1;
                    if !(timeout_bars > 0 && pending.bars_elapsed >= timeout_bars) {
                        survivors.push(pending);
                    }
                    continue;
                }
            } else {
                if !portfolio.can_open(&symbol, pending.order.group.as_deref(), self.max_positions)
                {
                    // Capacity exhausted: freeze the rest of the queue.
                    survivors.push(pending);
                    halted = true;
                    continue;
                }
                if self.same_direction_only
                    && portfolio
                        .symbol_side(&symbol)
                        .is_some_and(|existing| existing != side)
                {
                    continue;
                }
            }

            pending.bars_elapsed += 1;

            if min_positions > 0 && portfolio.open_count(&symbol) < min_positions {
                survivors.push(pending);
                continue;
            }

            if portfolio.execution().check_limit_fill(limit_price, side, bar) {
                let adj_price = portfolio.execution().entry_price(limit_price, side);
                let size = self.resolve_size(portfolio, &pending.order, adj_price, &symbol);
                if !portfolio.exposure_allows(size) {
                    debug!(symbol = %symbol, size, "limit fill rejected by exposure cap");
                    continue;
                }
                let sized = pending.order.clone().with_size(size);
                let fill = match merge_idx {
                    Some(idx) => {
                        portfolio.merge_position(idx, bar, limit_price, &sized, use_maker_fee)
                    }
                    None => portfolio.open_position(bar, &sized, limit_price, use_maker_fee),
                };
                let cancelled = self.after_fill(&fill, bar, portfolio, strategy, events)?;
                if cancelled {
                    survivors.clear();
                }
            } else if timeout_bars > 0 && pending.bars_elapsed >= timeout_bars {
                debug!(symbol = %symbol, limit_price, "limit order timed out");
            } else {
                survivors.push(pending);
            }
        }

        // Keep orders appended by callbacks during this pass.
        let appended = std::mem::take(&mut self.pending_limits);
        survivors.extend(appended);
        self.pending_limits = survivors;
        Ok(())
    }

    /// Phase 1c: walk the stop queue in insertion order. A triggered stop
    /// fills like a market order at the stop price (or the open when the
    /// bar gapped through), with taker fee and entry slippage.
    fn process_pending_stops(
        &mut self,
        bar: &Bar,
        portfolio: &mut Portfolio,
        strategy: &mut dyn Strategy,
        events: &mut EventHub,
    ) -> Result<()> {
        if self.pending_stops.is_empty() {
            return Ok(());
        }

        let mut queue = std::mem::take(&mut self.pending_stops);
        let mut survivors: Vec<PendingEntry> = Vec::new();
        let mut halted = false;

        for mut pending in queue.drain(..) {
            if halted {
                survivors.push(pending);
                continue;
            }

            let OrderKind::Stop {
                stop_price,
                timeout_bars,
            } = pending.order.kind
            else {
                continue;
            };
            let symbol = order_symbol(&pending.order, bar);
            let side = pending.order.side;

            if !portfolio.can_open(&symbol, pending.order.group.as_deref(), self.max_positions) {
                survivors.push(pending);
                halted = true;
                continue;
            }
            if self.same_direction_only
                && portfolio
                    .symbol_side(&symbol)
                    .is_some_and(|existing| existing != side)
            {
                continue;
            }

            pending.bars_elapsed += 1;

            if let Some(raw_price) = portfolio
                .execution()
                .check_stop_fill(stop_price, side, bar)
            {
                let adj_price = portfolio.execution().entry_price(raw_price, side);
                let size = self.resolve_size(portfolio, &pending.order, adj_price, &symbol);
                if !portfolio.exposure_allows(size) {
                    debug!(symbol = %symbol, size, "stop fill rejected by exposure cap");
                    continue;
                }
                let sized = pending.order.clone().with_size(size);
                let fill = portfolio.open_position(bar, &sized, raw_price, false);
                // Cancel sentinel clears limits only; stops stay queued.
                self.after_fill(&fill, bar, portfolio, strategy, events)?;
            } else if timeout_bars > 0 && pending.bars_elapsed >= timeout_bars {
                debug!(symbol = %symbol, stop_price, "stop order timed out");
            } else {
                survivors.push(pending);
            }
        }

        let appended = std::mem::take(&mut self.pending_stops);
        survivors.extend(appended);
        self.pending_stops = survivors;
        Ok(())
    }

    #[cfg(test)]
    fn pending_limit_count(&self) -> usize {
        self.pending_limits.len()
    }
}

/// Single-symbol backtest engine.
pub struct Engine {
    config: EngineConfig,
    portfolio: Portfolio,
    processor: BarProcessor,
    events: EventHub,
}

impl Engine {
    /// Create an engine. Fails fast on an invalid configuration.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let execution = ExecutionModel::new(config.slippage, config.taker_fee, config.maker_fee);
        let mut portfolio =
            Portfolio::new(config.initial_equity, config.default_size_usd, execution);
        if let Some(sizer) = &config.sizer {
            portfolio.set_sizer(sizer.clone());
        }
        portfolio.set_exposure_cap(config.max_total_exposure_usd);
        let processor = BarProcessor::new(&config);
        Ok(Self {
            config,
            portfolio,
            processor,
            events: EventHub::new(),
        })
    }

    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default()).expect("default config is valid")
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub(crate) fn portfolio_mut(&mut self) -> &mut Portfolio {
        &mut self.portfolio
    }

    pub(crate) fn processor_mut(&mut self) -> &mut BarProcessor {
        &mut self.processor
    }

    pub fn processor(&self) -> &BarProcessor {
        &self.processor
    }

    /// Register an event listener. Callbacks fire synchronously.
    pub fn on(&mut self, kind: EventKind, callback: Listener) -> ListenerId {
        self.events.on(kind, callback)
    }

    /// Remove a listener by id.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.events.remove(id)
    }

    pub(crate) fn reset_state(&mut self) {
        self.portfolio.reset();
        self.processor.reset();
    }

    pub(crate) fn process_one(
        &mut self,
        bar: &Bar,
        strategy: &mut dyn Strategy,
    ) -> Result<()> {
        self.processor
            .process_bar(bar, &mut self.portfolio, strategy, &mut self.events)
    }

    /// Run a backtest over a provider. The engine, indicators, and
    /// provider are reset first, so repeated runs are byte-identical.
    pub fn run(
        &mut self,
        strategy: &mut dyn Strategy,
        provider: &mut dyn DataProvider,
    ) -> Result<BacktestResults> {
        strategy.configure(&self.config)?;
        self.reset_state();
        provider.reset();

        info!(symbol = provider.symbol(), "starting backtest");
        let mut first_bar: Option<Bar> = None;
        let mut last_bar: Option<Bar> = None;

        while let Some(bar) = provider.next_bar() {
            if first_bar.is_none() {
                first_bar = Some(bar.clone());
            }
            self.process_one(&bar, strategy)?;
            last_bar = Some(bar);
        }

        if first_bar.is_none() {
            return Err(BacktestError::NoData);
        }

        let results = BacktestResults::from_portfolio(
            &self.portfolio,
            provider.symbol(),
            first_bar.as_ref(),
            last_bar.as_ref(),
        );
        info!(
            net_pnl = results.net_pnl,
            trades = results.total_trades,
            max_drawdown_pct = results.max_drawdown_pct,
            "backtest complete"
        );
        Ok(results)
    }

    /// Parallel parameter sweep: each parameter set gets an independent
    /// engine over the shared bar data. Failed runs are logged and
    /// dropped.
    pub fn sweep<P, F>(
        config: &EngineConfig,
        bars: &[Bar],
        symbol: &str,
        params: Vec<P>,
        strategy_factory: F,
    ) -> Vec<(P, BacktestResults)>
    where
        P: Clone + Send + Sync,
        F: Fn(&P) -> Box<dyn Strategy> + Send + Sync,
    {
        params
            .par_iter()
            .filter_map(|param| {
                let mut engine = match Engine::new(config.clone()) {
                    Ok(engine) => engine,
                    Err(e) => {
                        warn!("sweep configuration rejected: {e}");
                        return None;
                    }
                };
                let mut provider = SliceProvider::new(bars.to_vec(), symbol);
                let mut strategy = strategy_factory(param);
                match engine.run(strategy.as_mut(), &mut provider) {
                    Ok(results) => Some((param.clone(), results)),
                    Err(e) => {
                        warn!("sweep run failed: {e}");
                        None
                    }
                }
            })
            .collect()
    }
}
