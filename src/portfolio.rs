//! Portfolio: position ownership, trade/fill records, equity and drawdown.
//!
//! All position mutation flows through the portfolio. Trades and fills are
//! append-only; each close updates equity, peak equity, running max
//! drawdown, and appends an equity-curve sample.

use crate::execution::ExecutionModel;
use crate::sizing::PositionSizer;
use crate::types::{Bar, EquityPoint, ExitReason, Fill, Order, Position, Side, Trade};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

const MERGE_REASON: &str = "MERGE";

#[derive(Debug)]
pub struct Portfolio {
    pub initial_equity: f64,
    pub equity: f64,
    pub peak_equity: f64,
    /// Running maximum drawdown ratio.
    pub max_drawdown: f64,
    pub default_size_usd: f64,
    execution: ExecutionModel,
    sizer: Option<Arc<dyn PositionSizer>>,
    /// Portfolio-level cap on the sum of open position sizes.
    max_total_exposure_usd: Option<f64>,
    positions: Vec<Position>,
    trades: Vec<Trade>,
    fills: Vec<Fill>,
    pub total_fees: f64,
    equity_curve: Vec<EquityPoint>,
}

impl Portfolio {
    pub fn new(initial_equity: f64, default_size_usd: f64, execution: ExecutionModel) -> Self {
        Self {
            initial_equity,
            equity: initial_equity,
            peak_equity: initial_equity,
            max_drawdown: 0.0,
            default_size_usd,
            execution,
            sizer: None,
            max_total_exposure_usd: None,
            positions: Vec::new(),
            trades: Vec::new(),
            fills: Vec::new(),
            total_fees: 0.0,
            equity_curve: Vec::new(),
        }
    }

    pub fn set_sizer(&mut self, sizer: Arc<dyn PositionSizer>) {
        self.sizer = Some(sizer);
    }

    pub fn set_exposure_cap(&mut self, cap: Option<f64>) {
        self.max_total_exposure_usd = cap;
    }

    pub fn execution(&self) -> &ExecutionModel {
        &self.execution
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn positions_mut(&mut self) -> &mut [Position] {
        &mut self.positions
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn has_position(&self) -> bool {
        !self.positions.is_empty()
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    /// Open positions in one symbol.
    pub fn open_count(&self, symbol: &str) -> usize {
        self.positions.iter().filter(|p| p.symbol == symbol).count()
    }

    /// Side of the first open position in a symbol, if any.
    pub fn symbol_side(&self, symbol: &str) -> Option<Side> {
        self.positions
            .iter()
            .find(|p| p.symbol == symbol)
            .map(|p| p.side)
    }

    /// Index of the first open same-symbol same-side position.
    pub fn find_mergeable(&self, symbol: &str, side: Side) -> Option<usize> {
        self.positions
            .iter()
            .position(|p| p.symbol == symbol && p.side == side)
    }

    fn group_taken(&self, group: &str) -> bool {
        self.positions
            .iter()
            .any(|p| p.group.as_deref() == Some(group))
    }

    /// True when a new position may be opened: the symbol's open-position
    /// count is below `limit` and the order's group (if any) is free.
    pub fn can_open(&self, symbol: &str, group: Option<&str>, limit: usize) -> bool {
        if self.open_count(symbol) >= limit {
            return false;
        }
        match group {
            Some(g) => !self.group_taken(g),
            None => true,
        }
    }

    /// Sum of open position sizes.
    pub fn total_exposure(&self) -> f64 {
        self.positions.iter().map(|p| p.size_usd).sum()
    }

    /// Whether an additional entry of `size_usd` fits under the exposure cap.
    pub fn exposure_allows(&self, size_usd: f64) -> bool {
        match self.max_total_exposure_usd {
            Some(cap) => self.total_exposure() + size_usd <= cap,
            None => true,
        }
    }

    /// The configured sizer's size for an order, if a sizer is set.
    pub fn sizer_size(&self, order: &Order, price: f64, symbol: &str) -> Option<f64> {
        self.sizer.as_ref().map(|sizer| {
            sizer.get_size(
                self.equity,
                order.side,
                price,
                symbol,
                order.sl_pct.unwrap_or(0.0),
            )
        })
    }

    /// Resolve the size for an order: explicit size, then sizer, then the
    /// portfolio default.
    pub fn resolve_size(&self, order: &Order, price: f64, symbol: &str) -> f64 {
        if let Some(size) = order.size_usd {
            return size;
        }
        self.sizer_size(order, price, symbol)
            .unwrap_or(self.default_size_usd)
    }

    /// Open a new position. `raw_price` is the pre-slippage fill price
    /// (bar open for market orders, the limit/stop level otherwise); entry
    /// slippage and the entry fee are applied here. Returns the entry fill.
    pub fn open_position(
        &mut self,
        bar: &Bar,
        order: &Order,
        raw_price: f64,
        is_maker: bool,
    ) -> Fill {
        let price = self.execution.entry_price(raw_price, order.side);
        let symbol = order.symbol.clone().unwrap_or_else(|| bar.symbol.clone());
        let size_usd = self.resolve_size(order, price, &symbol);

        let (stop_loss, take_profit) = exit_levels(order.side, price, order.sl_pct, order.tp_pct);

        let fees = self.execution.fee(size_usd, is_maker);
        self.total_fees += fees;
        self.equity -= fees;

        self.positions.push(Position {
            side: order.side,
            entry_price: price,
            entry_time: bar.timestamp,
            size_usd,
            stop_loss,
            take_profit,
            symbol: symbol.clone(),
            group: order.group.clone(),
            entry_fees: fees,
            position_high: price,
            position_low: price,
            breakeven_activated: false,
            breakeven_trigger_pct: order.be_trigger_pct.unwrap_or(0.0),
            breakeven_lock_pct: order.be_lock_pct.unwrap_or(0.0),
            trail_pct: order.trail_pct.unwrap_or(0.0),
            trail_activation_pct: order.trail_activation_pct.unwrap_or(0.0),
            trailing_activated: false,
            partial_tp_pct: order.partial_tp_pct.unwrap_or(0.0),
            partial_tp_new_tp_pct: order.partial_tp_new_tp_pct.unwrap_or(0.0),
            partial_tp_done: false,
        });

        debug!(
            symbol = %symbol,
            side = %order.side,
            price,
            size_usd,
            "opened position"
        );

        let fill = Fill {
            timestamp: bar.timestamp,
            side: order.side,
            price,
            size_usd,
            symbol,
            fees,
            slippage_cost: self.execution.slippage_cost(size_usd),
            is_entry: true,
            reason: String::new(),
        };
        self.fills.push(fill.clone());
        fill
    }

    /// Merge a limit fill into the position at `index`: size-weighted
    /// average entry, summed size, and exit levels re-derived from the new
    /// average entry using the merging order's percentages.
    pub fn merge_position(
        &mut self,
        index: usize,
        bar: &Bar,
        limit_price: f64,
        order: &Order,
        is_maker: bool,
    ) -> Fill {
        let fill_price = self.execution.entry_price(limit_price, order.side);
        let symbol = self.positions[index].symbol.clone();
        let new_size = self.resolve_size(order, fill_price, &symbol);

        let fees = self.execution.fee(new_size, is_maker);
        self.total_fees += fees;
        self.equity -= fees;

        let pos = &mut self.positions[index];
        let old_size = pos.size_usd;
        let total = old_size + new_size;
        pos.entry_price = (pos.entry_price * old_size + fill_price * new_size) / total;
        pos.size_usd = total;
        pos.entry_fees += fees;

        let (sl, tp) = exit_levels(pos.side, pos.entry_price, order.sl_pct, order.tp_pct);
        if order.sl_pct.is_some() {
            pos.stop_loss = sl;
        }
        if order.tp_pct.is_some() {
            pos.take_profit = tp;
        }
        if let Some(trigger) = order.be_trigger_pct {
            pos.breakeven_trigger_pct = trigger;
            pos.breakeven_lock_pct = order.be_lock_pct.unwrap_or(pos.breakeven_lock_pct);
        }
        if let Some(trail) = order.trail_pct {
            pos.trail_pct = trail;
            pos.trail_activation_pct = order
                .trail_activation_pct
                .unwrap_or(pos.trail_activation_pct);
        }

        debug!(
            symbol = %symbol,
            entry = pos.entry_price,
            size_usd = pos.size_usd,
            "merged into position"
        );

        let fill = Fill {
            timestamp: bar.timestamp,
            side: order.side,
            price: fill_price,
            size_usd: new_size,
            symbol,
            fees,
            slippage_cost: self.execution.slippage_cost(new_size),
            is_entry: true,
            reason: MERGE_REASON.to_string(),
        };
        self.fills.push(fill.clone());
        fill
    }

    /// Close the position at `index` at `raw_price` (pre-slippage).
    /// Removes the position, books the trade, and updates equity, peak
    /// equity, drawdown, and the equity curve.
    pub fn close_position(
        &mut self,
        index: usize,
        raw_price: f64,
        timestamp: DateTime<Utc>,
        reason: ExitReason,
        is_maker: bool,
    ) -> Trade {
        let pos = self.positions.remove(index);
        let exit_price = self.execution.exit_price(raw_price, pos.side);

        let pnl_pct = gross_pnl_pct(pos.side, pos.entry_price, exit_price);
        let gross = pos.size_usd * pnl_pct;

        let exit_fee = self.execution.fee(pos.size_usd, is_maker);
        self.total_fees += exit_fee;
        let fees = pos.entry_fees + exit_fee;

        // Entry fees were charged when the position opened.
        self.equity += gross - exit_fee;
        self.apply_equity_sample(timestamp);

        let trade = Trade {
            entry_time: pos.entry_time,
            exit_time: timestamp,
            side: pos.side,
            entry_price: pos.entry_price,
            exit_price,
            size_usd: pos.size_usd,
            pnl_usd: gross - fees,
            pnl_pct,
            fees,
            reason,
            symbol: pos.symbol.clone(),
            is_partial: false,
            group: pos.group.clone(),
        };
        self.trades.push(trade.clone());

        self.fills.push(Fill {
            timestamp,
            side: pos.side,
            price: exit_price,
            size_usd: pos.size_usd,
            symbol: pos.symbol,
            fees: exit_fee,
            slippage_cost: self.execution.slippage_cost(pos.size_usd),
            is_entry: false,
            reason: reason.as_str().to_string(),
        });

        debug!(
            symbol = %trade.symbol,
            reason = %reason,
            pnl_usd = trade.pnl_usd,
            equity = self.equity,
            "closed position"
        );
        trade
    }

    /// Close `fraction` of the position at `index`. The remaining position
    /// shrinks, its TP is rewritten from `partial_tp_new_tp_pct`, and the
    /// partial-TP rule is marked done (it fires at most once).
    pub fn partial_close_position(
        &mut self,
        index: usize,
        fraction: f64,
        raw_price: f64,
        timestamp: DateTime<Utc>,
        reason: ExitReason,
    ) -> Trade {
        let fraction = fraction.clamp(0.0, 1.0);
        let (trade, fill) = {
            let pos = &mut self.positions[index];
            let closed_size = pos.size_usd * fraction;
            let exit_price = self.execution.exit_price(raw_price, pos.side);

            let pnl_pct = gross_pnl_pct(pos.side, pos.entry_price, exit_price);
            let gross = closed_size * pnl_pct;

            let exit_fee = self.execution.fee(closed_size, false);
            let entry_share = pos.entry_fees * fraction;
            let fees = entry_share + exit_fee;

            pos.size_usd -= closed_size;
            pos.entry_fees -= entry_share;
            pos.partial_tp_done = true;
            if pos.partial_tp_new_tp_pct > 0.0 {
                let (_, tp) = exit_levels(
                    pos.side,
                    pos.entry_price,
                    None,
                    Some(pos.partial_tp_new_tp_pct),
                );
                pos.take_profit = tp;
            }

            let trade = Trade {
                entry_time: pos.entry_time,
                exit_time: timestamp,
                side: pos.side,
                entry_price: pos.entry_price,
                exit_price,
                size_usd: closed_size,
                pnl_usd: gross - fees,
                pnl_pct,
                fees,
                reason,
                symbol: pos.symbol.clone(),
                is_partial: true,
                group: pos.group.clone(),
            };
            let fill = Fill {
                timestamp,
                side: pos.side,
                price: exit_price,
                size_usd: closed_size,
                symbol: pos.symbol.clone(),
                fees: exit_fee,
                slippage_cost: self.execution.slippage_cost(closed_size),
                is_entry: false,
                reason: reason.as_str().to_string(),
            };
            self.total_fees += exit_fee;
            self.equity += gross - exit_fee;
            (trade, fill)
        };

        self.apply_equity_sample(timestamp);
        self.trades.push(trade.clone());
        self.fills.push(fill);
        trade
    }

    /// Floor equity at zero, roll peak/drawdown, record a curve sample.
    fn apply_equity_sample(&mut self, timestamp: DateTime<Utc>) {
        self.equity = self.equity.max(0.0);
        self.peak_equity = self.peak_equity.max(self.equity);
        if self.peak_equity > 0.0 {
            let drawdown = (self.peak_equity - self.equity) / self.peak_equity;
            self.max_drawdown = self.max_drawdown.max(drawdown);
        }
        self.equity_curve.push(EquityPoint {
            timestamp,
            equity: self.equity,
        });
    }

    /// Reset to the initial state, keeping configuration.
    pub fn reset(&mut self) {
        self.equity = self.initial_equity;
        self.peak_equity = self.initial_equity;
        self.max_drawdown = 0.0;
        self.positions.clear();
        self.trades.clear();
        self.fills.clear();
        self.total_fees = 0.0;
        self.equity_curve.clear();
    }
}

fn gross_pnl_pct(side: Side, entry: f64, exit: f64) -> f64 {
    match side {
        Side::Long => (exit - entry) / entry,
        Side::Short => (entry - exit) / entry,
    }
}

fn exit_levels(
    side: Side,
    entry: f64,
    sl_pct: Option<f64>,
    tp_pct: Option<f64>,
) -> (Option<f64>, Option<f64>) {
    let sl = sl_pct.filter(|p| *p > 0.0).map(|p| match side {
        Side::Long => entry * (1.0 - p),
        Side::Short => entry * (1.0 + p),
    });
    let tp = tp_pct.filter(|p| *p > 0.0).map(|p| match side {
        Side::Long => entry * (1.0 + p),
        Side::Short => entry * (1.0 - p),
    });
    (sl, tp)
}
