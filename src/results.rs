//! Backtest results: aggregate metrics, monthly breakdown, summaries.

use crate::portfolio::Portfolio;
use crate::types::{Bar, EquityPoint, Fill, Trade};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Statistics for a single calendar month, keyed by exit time (PnL is
/// realized at exit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthStats {
    pub year: i32,
    pub month: u32,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub net_pnl: f64,
    pub fees: f64,
    pub max_win: f64,
    pub max_loss: f64,
}

impl MonthStats {
    fn new(year: i32, month: u32) -> Self {
        Self {
            year,
            month,
            trades: 0,
            wins: 0,
            losses: 0,
            gross_profit: 0.0,
            gross_loss: 0.0,
            net_pnl: 0.0,
            fees: 0.0,
            max_win: 0.0,
            max_loss: 0.0,
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades > 0 {
            self.wins as f64 / self.trades as f64 * 100.0
        } else {
            0.0
        }
    }

    pub fn label(&self) -> String {
        format!("{}-{:02}", self.year, self.month)
    }
}

/// Group trades by exit month, chronologically sorted.
pub fn monthly_breakdown(trades: &[Trade]) -> Vec<MonthStats> {
    use chrono::Datelike;

    let mut months: BTreeMap<(i32, u32), MonthStats> = BTreeMap::new();
    for trade in trades {
        let key = (trade.exit_time.year(), trade.exit_time.month());
        let m = months
            .entry(key)
            .or_insert_with(|| MonthStats::new(key.0, key.1));
        m.trades += 1;
        m.fees += trade.fees;
        m.net_pnl += trade.pnl_usd;
        if trade.pnl_usd > 0.0 {
            m.wins += 1;
            m.gross_profit += trade.pnl_usd;
            m.max_win = m.max_win.max(trade.pnl_usd);
        } else {
            m.losses += 1;
            m.gross_loss += trade.pnl_usd.abs();
            m.max_loss = m.max_loss.min(trade.pnl_usd);
        }
    }
    months.into_values().collect()
}

/// Format a monthly breakdown as a plain-text table.
pub fn format_monthly_table(months: &[MonthStats], initial_equity: f64) -> String {
    if months.is_empty() {
        return "  No trades to display.".to_string();
    }

    let rule = format!("  {}", "-".repeat(62));
    let mut lines = vec![
        rule.clone(),
        format!(
            "  {:<10} {:>6} {:>6} {:>10} {:>8} {:>9} {:>9}",
            "Month", "Trades", "WR%", "Net PnL", "Return%", "MaxWin", "MaxLoss"
        ),
        rule.clone(),
    ];

    let mut running_equity = initial_equity;
    let mut total_trades = 0;
    let mut total_wins = 0;
    let mut total_pnl = 0.0;

    for m in months {
        let ret_pct = if running_equity > 0.0 {
            m.net_pnl / running_equity * 100.0
        } else {
            0.0
        };
        running_equity += m.net_pnl;
        total_trades += m.trades;
        total_wins += m.wins;
        total_pnl += m.net_pnl;

        lines.push(format!(
            "  {:<10} {:>6} {:>5.1}% {:>+10.0} {:>+7.1}% {:>9.0} {:>+9.0}",
            m.label(),
            m.trades,
            m.win_rate(),
            m.net_pnl,
            ret_pct,
            m.max_win,
            m.max_loss
        ));
    }

    lines.push(rule.clone());
    let total_wr = if total_trades > 0 {
        total_wins as f64 / total_trades as f64 * 100.0
    } else {
        0.0
    };
    lines.push(format!(
        "  {:<10} {:>6} {:>5.1}% {:>+10.0} {:>+7.1}%",
        "TOTAL",
        total_trades,
        total_wr,
        total_pnl,
        total_pnl / initial_equity * 100.0
    ));
    lines.push(rule);
    lines.join("\n")
}

struct TradeStats {
    total: usize,
    wins: usize,
    losses: usize,
    win_rate: f64,
    avg_win: f64,
    avg_loss: f64,
    avg_win_pct: f64,
    avg_loss_pct: f64,
    profit_factor: f64,
}

fn trade_stats(trades: &[Trade]) -> TradeStats {
    let winners: Vec<&Trade> = trades.iter().filter(|t| t.pnl_usd > 0.0).collect();
    let losers: Vec<&Trade> = trades.iter().filter(|t| t.pnl_usd <= 0.0).collect();
    let total = trades.len();
    let n_win = winners.len();
    let n_lose = losers.len();

    let gross_profit: f64 = winners.iter().map(|t| t.pnl_usd).sum();
    let gross_loss: f64 = losers.iter().map(|t| t.pnl_usd.abs()).sum();

    TradeStats {
        total,
        wins: n_win,
        losses: n_lose,
        win_rate: if total > 0 {
            n_win as f64 / total as f64 * 100.0
        } else {
            0.0
        },
        avg_win: if n_win > 0 {
            gross_profit / n_win as f64
        } else {
            0.0
        },
        avg_loss: if n_lose > 0 {
            gross_loss / n_lose as f64
        } else {
            0.0
        },
        avg_win_pct: if n_win > 0 {
            winners.iter().map(|t| t.pnl_pct).sum::<f64>() / n_win as f64 * 100.0
        } else {
            0.0
        },
        avg_loss_pct: if n_lose > 0 {
            losers.iter().map(|t| t.pnl_pct).sum::<f64>().abs() / n_lose as f64 * 100.0
        } else {
            0.0
        },
        // No losses with some profit: sentinel infinity.
        profit_factor: if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        },
    }
}

/// Exit reason counts with gap variants folded into their base reason.
fn exit_breakdown(trades: &[Trade]) -> BTreeMap<String, usize> {
    let mut breakdown = BTreeMap::new();
    for trade in trades {
        *breakdown
            .entry(trade.reason.base().as_str().to_string())
            .or_insert(0) += 1;
    }
    breakdown
}

fn buy_hold_return(first: Option<&Bar>, last: Option<&Bar>) -> Option<f64> {
    let first_price = first?.close;
    let last_price = last?.close;
    if first_price > 0.0 {
        Some((last_price - first_price) / first_price * 100.0)
    } else {
        None
    }
}

/// Complete results of a single-symbol run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResults {
    pub run_id: Uuid,
    pub symbol: String,
    pub initial_equity: f64,
    pub final_equity: f64,
    pub net_pnl: f64,
    pub net_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub profit_factor: f64,
    pub total_fees: f64,
    pub trades: Vec<Trade>,
    pub fills: Vec<Fill>,
    pub exit_breakdown: BTreeMap<String, usize>,
    pub equity_curve: Vec<EquityPoint>,
    pub buy_hold_return_pct: Option<f64>,
    pub first_price: Option<f64>,
    pub last_price: Option<f64>,
    pub monthly: Vec<MonthStats>,
}

impl BacktestResults {
    /// Build results from a portfolio after a run.
    pub fn from_portfolio(
        portfolio: &Portfolio,
        symbol: &str,
        first_bar: Option<&Bar>,
        last_bar: Option<&Bar>,
    ) -> Self {
        let trades = portfolio.trades();
        let stats = trade_stats(trades);

        Self {
            run_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            initial_equity: portfolio.initial_equity,
            final_equity: portfolio.equity,
            net_pnl: portfolio.equity - portfolio.initial_equity,
            net_return_pct: (portfolio.equity - portfolio.initial_equity)
                / portfolio.initial_equity
                * 100.0,
            max_drawdown_pct: portfolio.max_drawdown * 100.0,
            total_trades: stats.total,
            winning_trades: stats.wins,
            losing_trades: stats.losses,
            win_rate: stats.win_rate,
            avg_win: stats.avg_win,
            avg_loss: stats.avg_loss,
            avg_win_pct: stats.avg_win_pct,
            avg_loss_pct: stats.avg_loss_pct,
            profit_factor: stats.profit_factor,
            total_fees: portfolio.total_fees,
            trades: trades.to_vec(),
            fills: portfolio.fills().to_vec(),
            exit_breakdown: exit_breakdown(trades),
            equity_curve: portfolio.equity_curve().to_vec(),
            buy_hold_return_pct: buy_hold_return(first_bar, last_bar),
            first_price: first_bar.map(|b| b.close),
            last_price: last_bar.map(|b| b.close),
            monthly: monthly_breakdown(trades),
        }
    }

    /// Formatted summary report.
    pub fn summary(&self) -> String {
        let rule = "=".repeat(60);
        let thin = format!("  {}", "-".repeat(56));
        let mut lines = vec![
            rule.clone(),
            format!(
                "  Backtest Results: {}",
                if self.symbol.is_empty() {
                    "N/A"
                } else {
                    self.symbol.as_str()
                }
            ),
            rule.clone(),
            format!(
                "  Net PnL:          ${:.2} ({:+.1}%)",
                self.net_pnl, self.net_return_pct
            ),
            format!("  Max Drawdown:     {:.1}%", self.max_drawdown_pct),
            format!("  Total Trades:     {}", self.total_trades),
            format!("  Win Rate:         {:.1}%", self.win_rate),
            format!(
                "  Avg Win:          ${:.2} ({:.2}%)",
                self.avg_win, self.avg_win_pct
            ),
            format!(
                "  Avg Loss:         ${:.2} ({:.2}%)",
                self.avg_loss, self.avg_loss_pct
            ),
            format!("  Profit Factor:    {:.2}", self.profit_factor),
            format!("  Total Fees:       ${:.2}", self.total_fees),
            format!("  Initial Equity:   ${:.2}", self.initial_equity),
            format!("  Final Equity:     ${:.2}", self.final_equity),
        ];

        if let Some(bh) = self.buy_hold_return_pct {
            lines.push(thin.clone());
            lines.push(format!("  Buy & Hold:       {bh:+.1}%"));
            lines.push(format!("  Alpha:            {:+.1}%", self.net_return_pct - bh));
        }

        if !self.exit_breakdown.is_empty() {
            lines.push(thin);
            lines.push("  Exit Breakdown:".to_string());
            for (reason, count) in &self.exit_breakdown {
                let pct = *count as f64 / self.total_trades as f64 * 100.0;
                lines.push(format!("    {reason:<20} {count:>4} ({pct:.1}%)"));
            }
        }

        lines.push(rule);
        lines.join("\n")
    }

    /// Formatted monthly breakdown table.
    pub fn monthly_table(&self) -> String {
        format_monthly_table(&self.monthly, self.initial_equity)
    }
}

/// Per-symbol slice of a multi-asset run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSummary {
    pub symbol: String,
    pub net_pnl: f64,
    pub total_trades: usize,
    pub win_rate: f64,
    pub total_fees: f64,
    pub buy_hold_return_pct: Option<f64>,
}

/// Results of a multi-asset run over one shared portfolio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiAssetResults {
    pub run_id: Uuid,
    pub symbols: Vec<String>,
    pub initial_equity: f64,
    pub final_equity: f64,
    pub net_pnl: f64,
    pub net_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub total_trades: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_fees: f64,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub exit_breakdown: BTreeMap<String, usize>,
    pub per_symbol: Vec<SymbolSummary>,
    pub monthly: Vec<MonthStats>,
}

impl MultiAssetResults {
    /// Build combined results from the shared portfolio, with a per-symbol
    /// breakdown computed from each symbol's trades.
    pub fn from_portfolio(
        portfolio: &Portfolio,
        first_bars: &BTreeMap<String, Bar>,
        last_bars: &BTreeMap<String, Bar>,
    ) -> Self {
        let trades = portfolio.trades();
        let stats = trade_stats(trades);

        let mut symbols: Vec<String> = first_bars.keys().cloned().collect();
        symbols.sort();

        let per_symbol = symbols
            .iter()
            .map(|sym| {
                let sym_trades: Vec<Trade> = trades
                    .iter()
                    .filter(|t| &t.symbol == sym)
                    .cloned()
                    .collect();
                let sym_stats = trade_stats(&sym_trades);
                SymbolSummary {
                    symbol: sym.clone(),
                    net_pnl: sym_trades.iter().map(|t| t.pnl_usd).sum(),
                    total_trades: sym_stats.total,
                    win_rate: sym_stats.win_rate,
                    total_fees: sym_trades.iter().map(|t| t.fees).sum(),
                    buy_hold_return_pct: buy_hold_return(
                        first_bars.get(sym),
                        last_bars.get(sym),
                    ),
                }
            })
            .collect();

        Self {
            run_id: Uuid::new_v4(),
            symbols,
            initial_equity: portfolio.initial_equity,
            final_equity: portfolio.equity,
            net_pnl: portfolio.equity - portfolio.initial_equity,
            net_return_pct: (portfolio.equity - portfolio.initial_equity)
                / portfolio.initial_equity
                * 100.0,
            max_drawdown_pct: portfolio.max_drawdown * 100.0,
            total_trades: stats.total,
            win_rate: stats.win_rate,
            profit_factor: stats.profit_factor,
            total_fees: portfolio.total_fees,
            trades: trades.to_vec(),
            equity_curve: portfolio.equity_curve().to_vec(),
            exit_breakdown: exit_breakdown(trades),
            per_symbol,
            monthly: monthly_breakdown(trades),
        }
    }

    /// Formatted combined + per-symbol summary.
    pub fn summary(&self) -> String {
        let rule = "=".repeat(60);
        let mut lines = vec![
            rule.clone(),
            "  Multi-Asset Backtest Results".to_string(),
            rule.clone(),
            format!("  Symbols:          {}", self.symbols.join(", ")),
            format!(
                "  Net PnL:          ${:.2} ({:+.1}%)",
                self.net_pnl, self.net_return_pct
            ),
            format!("  Max Drawdown:     {:.1}%", self.max_drawdown_pct),
            format!("  Total Trades:     {}", self.total_trades),
            format!("  Win Rate:         {:.1}%", self.win_rate),
            format!("  Profit Factor:    {:.2}", self.profit_factor),
            format!("  Total Fees:       ${:.2}", self.total_fees),
            format!("  Initial Equity:   ${:.2}", self.initial_equity),
            format!("  Final Equity:     ${:.2}", self.final_equity),
            format!("  {}", "-".repeat(56)),
            "  Per-Symbol Breakdown:".to_string(),
            format!(
                "    {:<8} {:>10} {:>6} {:>6}",
                "Symbol", "Net PnL", "Trades", "WR%"
            ),
        ];
        for s in &self.per_symbol {
            lines.push(format!(
                "    {:<8} {:>+10.0} {:>6} {:>5.1}%",
                s.symbol, s.net_pnl, s.total_trades, s.win_rate
            ));
        }
        lines.push(rule);
        lines.join("\n")
    }

    pub fn monthly_table(&self) -> String {
        format_monthly_table(&self.monthly, self.initial_equity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, Side};
    use chrono::{TimeZone, Utc};

    fn trade(month: u32, pnl: f64, reason: ExitReason) -> Trade {
        let entry = Utc.with_ymd_and_hms(2024, month, 1, 0, 0, 0).unwrap();
        let exit = Utc.with_ymd_and_hms(2024, month, 2, 0, 0, 0).unwrap();
        Trade {
            entry_time: entry,
            exit_time: exit,
            side: Side::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl / 100.0,
            size_usd: 10_000.0,
            pnl_usd: pnl,
            pnl_pct: pnl / 10_000.0,
            fees: 3.0,
            reason,
            symbol: "ETH".to_string(),
            is_partial: false,
            group: None,
        }
    }

    #[test]
    fn test_monthly_breakdown_groups_by_exit_month() {
        let trades = vec![
            trade(1, 100.0, ExitReason::TakeProfit),
            trade(1, -50.0, ExitReason::StopLoss),
            trade(2, 75.0, ExitReason::TakeProfitGap),
        ];
        let months = monthly_breakdown(&trades);
        assert_eq!(months.len(), 2);
        assert_eq!(months[0].trades, 2);
        assert_eq!(months[0].wins, 1);
        assert!((months[0].net_pnl - 50.0).abs() < 1e-9);
        assert_eq!(months[1].trades, 1);
        assert_eq!(months[0].label(), "2024-01");
    }

    #[test]
    fn test_exit_breakdown_folds_gap_variants() {
        let trades = vec![
            trade(1, 10.0, ExitReason::TakeProfit),
            trade(1, 10.0, ExitReason::TakeProfitGap),
            trade(1, -10.0, ExitReason::StopLossGap),
        ];
        let breakdown = exit_breakdown(&trades);
        assert_eq!(breakdown["TAKE_PROFIT"], 2);
        assert_eq!(breakdown["STOP_LOSS"], 1);
        assert!(!breakdown.contains_key("TAKE_PROFIT_GAP"));
    }

    #[test]
    fn test_profit_factor_infinity_with_no_losses() {
        let trades = vec![trade(1, 10.0, ExitReason::TakeProfit)];
        let stats = trade_stats(&trades);
        assert!(stats.profit_factor.is_infinite());

        let stats = trade_stats(&[]);
        assert_eq!(stats.profit_factor, 0.0);
    }

    #[test]
    fn test_win_rate() {
        let trades = vec![
            trade(1, 10.0, ExitReason::TakeProfit),
            trade(1, -10.0, ExitReason::StopLoss),
            trade(1, 20.0, ExitReason::Signal),
            trade(1, 0.0, ExitReason::Signal),
        ];
        let stats = trade_stats(&trades);
        // Zero-PnL trades count as losses.
        assert_eq!(stats.wins, 2);
        assert_eq!(stats.losses, 2);
        assert!((stats.win_rate - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_monthly_table_formats() {
        let trades = vec![trade(1, 100.0, ExitReason::TakeProfit)];
        let table = format_monthly_table(&monthly_breakdown(&trades), 10_000.0);
        assert!(table.contains("2024-01"));
        assert!(table.contains("TOTAL"));

        assert_eq!(format_monthly_table(&[], 10_000.0), "  No trades to display.");
    }
}
