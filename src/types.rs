//! Core data types for the backtest engine.

use crate::error::{BacktestError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bar timeframes supported by the engine and resampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Timeframe {
    #[default]
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "3m")]
    Minute3,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "2h")]
    Hour2,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
}

impl Timeframe {
    /// Bar duration in minutes.
    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::Minute1 => 1,
            Timeframe::Minute3 => 3,
            Timeframe::Minute5 => 5,
            Timeframe::Minute15 => 15,
            Timeframe::Minute30 => 30,
            Timeframe::Hour1 => 60,
            Timeframe::Hour2 => 120,
            Timeframe::Hour4 => 240,
            Timeframe::Day1 => 1440,
        }
    }

    /// Bar duration in seconds.
    pub fn seconds(&self) -> i64 {
        self.minutes() * 60
    }

    /// The canonical label, e.g. `"15m"` or `"1h"`.
    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::Minute1 => "1m",
            Timeframe::Minute3 => "3m",
            Timeframe::Minute5 => "5m",
            Timeframe::Minute15 => "15m",
            Timeframe::Minute30 => "30m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour2 => "2h",
            Timeframe::Hour4 => "4h",
            Timeframe::Day1 => "1d",
        }
    }

    /// Parse a label like `"5m"`, `"1h"` or `"1d"`.
    pub fn parse(label: &str) -> Result<Self> {
        match label {
            "1m" | "1min" => Ok(Timeframe::Minute1),
            "3m" | "3min" => Ok(Timeframe::Minute3),
            "5m" | "5min" => Ok(Timeframe::Minute5),
            "15m" | "15min" => Ok(Timeframe::Minute15),
            "30m" | "30min" => Ok(Timeframe::Minute30),
            "1h" => Ok(Timeframe::Hour1),
            "2h" => Ok(Timeframe::Hour2),
            "4h" => Ok(Timeframe::Hour4),
            "1d" | "1D" => Ok(Timeframe::Day1),
            other => Err(BacktestError::ConfigError(format!(
                "Unsupported timeframe: '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// OHLCV bar representing a single time period of market data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub timeframe: Timeframe,
}

impl Bar {
    /// Create a new 1-minute bar with no symbol tag.
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            symbol: String::new(),
            timeframe: Timeframe::Minute1,
        }
    }

    /// Tag the bar with a symbol.
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = symbol.into();
        self
    }

    /// Tag the bar with a timeframe.
    pub fn with_timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = timeframe;
        self
    }

    /// Validate that bar data is internally consistent.
    pub fn validate(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite()
            && self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.open > 0.0
            && self.close > 0.0
            && self.volume >= 0.0
    }

    /// Typical price (HLC average), used by VWAP.
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// Bar range (high - low).
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// True when close > open.
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The side that closes this one.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Why a position was closed (or partially closed).
///
/// The `*Gap` variants indicate the bar opened already beyond the trigger
/// level and the fill used the open price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    StopLossGap,
    TakeProfit,
    TakeProfitGap,
    Breakeven,
    BreakevenGap,
    TrailingStop,
    TrailingStopGap,
    PartialTp,
    Signal,
}

impl ExitReason {
    /// Wire/report label, e.g. `"STOP_LOSS_GAP"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::StopLossGap => "STOP_LOSS_GAP",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::TakeProfitGap => "TAKE_PROFIT_GAP",
            ExitReason::Breakeven => "BREAKEVEN",
            ExitReason::BreakevenGap => "BREAKEVEN_GAP",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::TrailingStopGap => "TRAILING_STOP_GAP",
            ExitReason::PartialTp => "PARTIAL_TP",
            ExitReason::Signal => "SIGNAL",
        }
    }

    /// True for the gap-through variants.
    pub fn is_gap(&self) -> bool {
        matches!(
            self,
            ExitReason::StopLossGap
                | ExitReason::TakeProfitGap
                | ExitReason::BreakevenGap
                | ExitReason::TrailingStopGap
        )
    }

    /// Fold a gap variant into its base reason (for reporting breakdowns).
    pub fn base(&self) -> ExitReason {
        match self {
            ExitReason::StopLossGap => ExitReason::StopLoss,
            ExitReason::TakeProfitGap => ExitReason::TakeProfit,
            ExitReason::BreakevenGap => ExitReason::Breakeven,
            ExitReason::TrailingStopGap => ExitReason::TrailingStop,
            other => *other,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution style of an order, with kind-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderKind {
    /// Fills at the next bar's open with taker fee and entry slippage.
    Market,
    /// Fills when price trades through `limit_price`.
    Limit {
        limit_price: f64,
        /// Bars to keep the order alive; 0 = no timeout.
        timeout_bars: usize,
        /// Charge the maker fee on fill (resting order).
        use_maker_fee: bool,
        /// Only fill when at least this many positions already exist.
        min_positions: usize,
        /// On fill, merge into an existing same-symbol same-side position
        /// instead of opening a new one.
        merge_position: bool,
    },
    /// Entry stop: fills when price breaks through `stop_price`.
    Stop { stop_price: f64, timeout_bars: usize },
}

/// An order emitted by a strategy.
///
/// Exit-management fields are independent percentages relative to the fill
/// price; unset fields leave the corresponding mechanism disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub side: Side,
    pub kind: OrderKind,
    /// Position size in quote units; `None` uses the configured sizer or
    /// the engine default.
    pub size_usd: Option<f64>,
    /// Target symbol; `None` inherits the processed bar's symbol.
    pub symbol: Option<String>,
    /// Position group label; at most one open position per group.
    pub group: Option<String>,
    pub tp_pct: Option<f64>,
    pub sl_pct: Option<f64>,
    pub be_trigger_pct: Option<f64>,
    pub be_lock_pct: Option<f64>,
    pub trail_pct: Option<f64>,
    pub trail_activation_pct: Option<f64>,
    /// Fraction of the position to close at TP, in (0, 1).
    pub partial_tp_pct: Option<f64>,
    /// New TP percentage (from entry) applied after the partial close.
    pub partial_tp_new_tp_pct: Option<f64>,
    /// Clear the pending limit queue before this order is queued.
    pub cancel_pending_limits: bool,
}

impl Order {
    fn with_kind(side: Side, kind: OrderKind) -> Self {
        Self {
            side,
            kind,
            size_usd: None,
            symbol: None,
            group: None,
            tp_pct: None,
            sl_pct: None,
            be_trigger_pct: None,
            be_lock_pct: None,
            trail_pct: None,
            trail_activation_pct: None,
            partial_tp_pct: None,
            partial_tp_new_tp_pct: None,
            cancel_pending_limits: false,
        }
    }

    /// Create a market order.
    pub fn market(side: Side) -> Self {
        Self::with_kind(side, OrderKind::Market)
    }

    /// Create a limit order at `limit_price` with no timeout.
    pub fn limit(side: Side, limit_price: f64) -> Self {
        Self::with_kind(
            side,
            OrderKind::Limit {
                limit_price,
                timeout_bars: 0,
                use_maker_fee: true,
                min_positions: 0,
                merge_position: false,
            },
        )
    }

    /// Create an entry stop order at `stop_price` with no timeout.
    pub fn stop(side: Side, stop_price: f64) -> Self {
        Self::with_kind(
            side,
            OrderKind::Stop {
                stop_price,
                timeout_bars: 0,
            },
        )
    }

    pub fn with_size(mut self, size_usd: f64) -> Self {
        self.size_usd = Some(size_usd);
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_take_profit(mut self, tp_pct: f64) -> Self {
        self.tp_pct = Some(tp_pct);
        self
    }

    pub fn with_stop_loss(mut self, sl_pct: f64) -> Self {
        self.sl_pct = Some(sl_pct);
        self
    }

    pub fn with_breakeven(mut self, trigger_pct: f64, lock_pct: f64) -> Self {
        self.be_trigger_pct = Some(trigger_pct);
        self.be_lock_pct = Some(lock_pct);
        self
    }

    pub fn with_trailing(mut self, trail_pct: f64, activation_pct: f64) -> Self {
        self.trail_pct = Some(trail_pct);
        self.trail_activation_pct = Some(activation_pct);
        self
    }

    pub fn with_partial_tp(mut self, fraction: f64, new_tp_pct: f64) -> Self {
        self.partial_tp_pct = Some(fraction);
        self.partial_tp_new_tp_pct = Some(new_tp_pct);
        self
    }

    pub fn with_timeout(mut self, bars: usize) -> Self {
        match &mut self.kind {
            OrderKind::Limit { timeout_bars, .. } | OrderKind::Stop { timeout_bars, .. } => {
                *timeout_bars = bars;
            }
            OrderKind::Market => {}
        }
        self
    }

    pub fn with_min_positions(mut self, min: usize) -> Self {
        if let OrderKind::Limit { min_positions, .. } = &mut self.kind {
            *min_positions = min;
        }
        self
    }

    pub fn with_merge_position(mut self, merge: bool) -> Self {
        if let OrderKind::Limit { merge_position, .. } = &mut self.kind {
            *merge_position = merge;
        }
        self
    }

    pub fn with_maker_fee(mut self, maker: bool) -> Self {
        if let OrderKind::Limit { use_maker_fee, .. } = &mut self.kind {
            *use_maker_fee = maker;
        }
        self
    }

    pub fn cancel_pending_limits(mut self) -> Self {
        self.cancel_pending_limits = true;
        self
    }

    /// Fail fast on contradictory or nonsensical order parameters.
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.size_usd {
            if !(size > 0.0) {
                return Err(BacktestError::InvalidOrder(format!(
                    "size_usd must be positive, got {size}"
                )));
            }
        }
        match &self.kind {
            OrderKind::Limit { limit_price, .. } if !(*limit_price > 0.0) => {
                return Err(BacktestError::InvalidOrder(format!(
                    "limit_price must be positive, got {limit_price}"
                )));
            }
            OrderKind::Stop { stop_price, .. } if !(*stop_price > 0.0) => {
                return Err(BacktestError::InvalidOrder(format!(
                    "stop_price must be positive, got {stop_price}"
                )));
            }
            _ => {}
        }
        for (name, pct) in [
            ("tp_pct", self.tp_pct),
            ("sl_pct", self.sl_pct),
            ("be_trigger_pct", self.be_trigger_pct),
            ("be_lock_pct", self.be_lock_pct),
            ("trail_pct", self.trail_pct),
            ("trail_activation_pct", self.trail_activation_pct),
            ("partial_tp_new_tp_pct", self.partial_tp_new_tp_pct),
        ] {
            if let Some(p) = pct {
                if !(p >= 0.0) || !p.is_finite() {
                    return Err(BacktestError::InvalidOrder(format!(
                        "{name} must be a non-negative finite number, got {p}"
                    )));
                }
            }
        }
        if let (Some(trigger), Some(lock)) = (self.be_trigger_pct, self.be_lock_pct) {
            if lock >= trigger {
                return Err(BacktestError::InvalidOrder(format!(
                    "be_lock_pct ({lock}) must be below be_trigger_pct ({trigger})"
                )));
            }
        }
        if let Some(frac) = self.partial_tp_pct {
            if !(frac > 0.0 && frac < 1.0) {
                return Err(BacktestError::InvalidOrder(format!(
                    "partial_tp_pct must be in (0, 1), got {frac}"
                )));
            }
        }
        Ok(())
    }
}

/// What a strategy callback hands back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderRequest {
    /// Queue an order (market replaces the pending slot; limit/stop append).
    Place(Order),
    /// Clear the pending limit queue without placing anything.
    CancelPendingLimits,
}

impl From<Order> for OrderRequest {
    fn from(order: Order) -> Self {
        OrderRequest::Place(order)
    }
}

/// An open position owned by the portfolio.
///
/// Invariant: for LONG, `stop_loss <= entry_price <= take_profit`; for
/// SHORT the inequalities flip. Either level may be absent when the
/// corresponding exit rule is not configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub size_usd: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub symbol: String,
    pub group: Option<String>,
    /// Entry fees charged so far for the current size (merges accumulate;
    /// partial closes consume their share).
    pub entry_fees: f64,
    /// Highest/lowest prices seen since entry.
    pub position_high: f64,
    pub position_low: f64,
    pub breakeven_activated: bool,
    pub breakeven_trigger_pct: f64,
    pub breakeven_lock_pct: f64,
    pub trail_pct: f64,
    pub trail_activation_pct: f64,
    pub trailing_activated: bool,
    pub partial_tp_pct: f64,
    pub partial_tp_new_tp_pct: f64,
    pub partial_tp_done: bool,
}

impl Position {
    pub fn is_long(&self) -> bool {
        self.side == Side::Long
    }

    /// Favorable excursion since entry, as a fraction of the entry price.
    pub fn peak_profit_pct(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        match self.side {
            Side::Long => (self.position_high - self.entry_price) / self.entry_price,
            Side::Short => (self.entry_price - self.position_low) / self.entry_price,
        }
    }
}

/// A completed fill (entry, merge, or exit), slippage already applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub price: f64,
    pub size_usd: f64,
    pub symbol: String,
    pub fees: f64,
    pub slippage_cost: f64,
    pub is_entry: bool,
    /// Exit reason label, `"MERGE"` for merge fills, empty for entries.
    pub reason: String,
}

/// A completed round-trip trade (or partial close).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size_usd: f64,
    pub pnl_usd: f64,
    pub pnl_pct: f64,
    pub fees: f64,
    pub reason: ExitReason,
    pub symbol: String,
    pub is_partial: bool,
    pub group: Option<String>,
}

/// Equity sample recorded after each position close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
}
