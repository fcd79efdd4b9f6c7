//! Declarative strategies: a JSON condition tree instead of code.
//!
//! A configuration names its indicators, AND-ed entry conditions for long
//! and short, exit percentages forwarded onto emitted orders, and an
//! optional scale-in section that places a merge limit order below each
//! entry fill.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::indicators::{IndicatorSpec, IndicatorValues};
use crate::strategy::Strategy;
use crate::types::{Bar, Fill, Order, OrderRequest, Position, Side, Trade};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One entry condition. Operands reference indicator names, record fields
/// as `name.field`, the pseudo-names `bar.close`/`bar.open`/`bar.high`/
/// `bar.low`, or numeric literals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// `fast` crossed above `slow` on this bar.
    Crossover { fast: String, slow: String },
    /// `fast` crossed below `slow` on this bar.
    Crossunder { fast: String, slow: String },
    Above { left: String, right: String },
    Below { left: String, right: String },
    AboveThreshold { indicator: String, threshold: f64 },
    BelowThreshold { indicator: String, threshold: f64 },
    CrossesAbove { indicator: String, threshold: f64 },
    CrossesBelow { indicator: String, threshold: f64 },
}

/// Resolve an operand against the bar and current indicator values.
/// Returns `None` for unknown names, warming-up indicators, and bare
/// record-valued indicators.
fn resolve_operand(name: &str, bar: &Bar, values: &IndicatorValues) -> Option<f64> {
    if let Some(field) = name.strip_prefix("bar.") {
        return match field {
            "close" => Some(bar.close),
            "open" => Some(bar.open),
            "high" => Some(bar.high),
            "low" => Some(bar.low),
            _ => None,
        };
    }
    if let Some(value) = values.get(name) {
        return value.as_ref().and_then(|v| v.as_scalar());
    }
    if let Ok(literal) = name.parse::<f64>() {
        return Some(literal);
    }
    if let Some((base, field)) = name.rsplit_once('.') {
        if let Some(value) = values.get(base) {
            return value.as_ref().and_then(|v| v.field(field));
        }
    }
    None
}

impl Condition {
    /// Evaluate against current and previous indicator values. Any
    /// unresolved operand makes the condition false.
    fn evaluate(
        &self,
        bar: &Bar,
        values: &IndicatorValues,
        prev_values: &IndicatorValues,
    ) -> bool {
        match self {
            Condition::Crossover { fast, slow } | Condition::Crossunder { fast, slow } => {
                let resolved = (
                    resolve_operand(fast, bar, values),
                    resolve_operand(slow, bar, values),
                    resolve_operand(fast, bar, prev_values),
                    resolve_operand(slow, bar, prev_values),
                );
                let (Some(fast_now), Some(slow_now), Some(fast_prev), Some(slow_prev)) = resolved
                else {
                    return false;
                };
                if matches!(self, Condition::Crossunder { .. }) {
                    fast_now < slow_now && fast_prev >= slow_prev
                } else {
                    fast_now > slow_now && fast_prev <= slow_prev
                }
            }
            Condition::Above { left, right } | Condition::Below { left, right } => {
                let (Some(l), Some(r)) = (
                    resolve_operand(left, bar, values),
                    resolve_operand(right, bar, values),
                ) else {
                    return false;
                };
                if matches!(self, Condition::Above { .. }) {
                    l > r
                } else {
                    l < r
                }
            }
            Condition::AboveThreshold {
                indicator,
                threshold,
            } => resolve_operand(indicator, bar, values).is_some_and(|v| v > *threshold),
            Condition::BelowThreshold {
                indicator,
                threshold,
            } => resolve_operand(indicator, bar, values).is_some_and(|v| v <= *threshold),
            Condition::CrossesAbove {
                indicator,
                threshold,
            } => {
                let (Some(curr), Some(prev)) = (
                    resolve_operand(indicator, bar, values),
                    resolve_operand(indicator, bar, prev_values),
                ) else {
                    return false;
                };
                curr > *threshold && prev <= *threshold
            }
            Condition::CrossesBelow {
                indicator,
                threshold,
            } => {
                let (Some(curr), Some(prev)) = (
                    resolve_operand(indicator, bar, values),
                    resolve_operand(indicator, bar, prev_values),
                ) else {
                    return false;
                };
                curr < *threshold && prev >= *threshold
            }
        }
    }
}

/// AND-chain: every condition must pass; an empty list never matches.
fn evaluate_all(
    conditions: &[Condition],
    bar: &Bar,
    values: &IndicatorValues,
    prev_values: &IndicatorValues,
) -> bool {
    !conditions.is_empty()
        && conditions
            .iter()
            .all(|c| c.evaluate(bar, values, prev_values))
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EntryRules {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EntryConfig {
    #[serde(default)]
    pub long: EntryRules,
    #[serde(default)]
    pub short: EntryRules,
}

/// Percentage exit fields forwarded onto every emitted order.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExitConfig {
    pub tp_pct: Option<f64>,
    pub sl_pct: Option<f64>,
    pub be_trigger_pct: Option<f64>,
    pub be_lock_pct: Option<f64>,
    pub trail_pct: Option<f64>,
    pub trail_activation_pct: Option<f64>,
    pub partial_tp_pct: Option<f64>,
    pub partial_tp_new_tp_pct: Option<f64>,
}

fn default_dip_pct() -> f64 {
    0.002
}
fn default_size_pct() -> f64 {
    0.5
}
fn default_scale_timeout() -> usize {
    48
}

/// Scale-in: after each entry fill, rest a merge limit a dip below it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleInConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_dip_pct")]
    pub dip_pct: f64,
    #[serde(default = "default_size_pct")]
    pub size_pct: f64,
    #[serde(default = "default_scale_timeout")]
    pub timeout_bars: usize,
}

impl Default for ScaleInConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dip_pct: default_dip_pct(),
            size_pct: default_size_pct(),
            timeout_bars: default_scale_timeout(),
        }
    }
}

/// Full declarative strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StrategySpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub indicators: BTreeMap<String, IndicatorSpec>,
    #[serde(default)]
    pub entry: EntryConfig,
    #[serde(default)]
    pub exit: ExitConfig,
    #[serde(default)]
    pub scale_in: ScaleInConfig,
}

/// Strategy driven entirely by a [`StrategySpec`].
pub struct DeclarativeStrategy {
    spec: StrategySpec,
    prev_values: IndicatorValues,
}

impl DeclarativeStrategy {
    pub fn new(spec: StrategySpec) -> Self {
        Self {
            spec,
            prev_values: IndicatorValues::new(),
        }
    }

    /// Load from a JSON file.
    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Parse from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let spec: StrategySpec = serde_json::from_str(json)?;
        Ok(Self::new(spec))
    }

    pub fn name(&self) -> &str {
        if self.spec.name.is_empty() {
            "declarative"
        } else {
            &self.spec.name
        }
    }

    /// The indicator specs this strategy needs; merge into
    /// [`EngineConfig::indicators`] before building the engine.
    pub fn indicators(&self) -> &BTreeMap<String, IndicatorSpec> {
        &self.spec.indicators
    }

    fn build_order(&self, side: Side) -> Order {
        let exit = &self.spec.exit;
        let mut order = Order::market(side);
        order.tp_pct = exit.tp_pct;
        order.sl_pct = exit.sl_pct;
        order.be_trigger_pct = exit.be_trigger_pct;
        order.be_lock_pct = exit.be_lock_pct;
        order.trail_pct = exit.trail_pct;
        order.trail_activation_pct = exit.trail_activation_pct;
        order.partial_tp_pct = exit.partial_tp_pct;
        order.partial_tp_new_tp_pct = exit.partial_tp_new_tp_pct;
        order
    }
}

impl Strategy for DeclarativeStrategy {
    fn configure(&mut self, _config: &EngineConfig) -> Result<()> {
        self.prev_values.clear();
        Ok(())
    }

    fn on_bar(
        &mut self,
        bar: &Bar,
        indicators: &IndicatorValues,
        positions: &[Position],
    ) -> Result<Vec<OrderRequest>> {
        // Flat-only entries: holding a position suppresses new signals.
        let mut requests = Vec::new();
        if positions.is_empty() {
            if evaluate_all(
                &self.spec.entry.long.conditions,
                bar,
                indicators,
                &self.prev_values,
            ) {
                requests.push(self.build_order(Side::Long).into());
            } else if evaluate_all(
                &self.spec.entry.short.conditions,
                bar,
                indicators,
                &self.prev_values,
            ) {
                requests.push(self.build_order(Side::Short).into());
            }
        }
        self.prev_values = indicators.clone();
        Ok(requests)
    }

    fn on_fill(&mut self, fill: &Fill) -> Result<Option<OrderRequest>> {
        let scale_in = &self.spec.scale_in;
        if !scale_in.enabled || !fill.is_entry || fill.reason == "MERGE" {
            return Ok(None);
        }
        let limit_price = match fill.side {
            Side::Long => fill.price * (1.0 - scale_in.dip_pct),
            Side::Short => fill.price * (1.0 + scale_in.dip_pct),
        };
        let order = Order::limit(fill.side, limit_price)
            .with_size(fill.size_usd * scale_in.size_pct)
            .with_timeout(scale_in.timeout_bars)
            .with_merge_position(true)
            .cancel_pending_limits();
        Ok(Some(order.into()))
    }

    fn on_exit(&mut self, _fill: &Fill, trade: &Trade) -> Result<Option<OrderRequest>> {
        // A take-profit exit retires any resting scale-in order.
        if self.spec.scale_in.enabled
            && trade.reason.base() == crate::types::ExitReason::TakeProfit
        {
            return Ok(Some(OrderRequest::CancelPendingLimits));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorValue;
    use crate::types::ExitReason;
    use chrono::{TimeZone, Utc};

    fn bar() -> Bar {
        Bar::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            100.0,
            101.0,
            99.0,
            100.5,
            1.0,
        )
    }

    fn values(entries: &[(&str, f64)]) -> IndicatorValues {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Some(IndicatorValue::scalar(*v))))
            .collect()
    }

    #[test]
    fn test_parse_full_spec() {
        let json = r#"{
            "name": "trend",
            "indicators": {
                "ema_fast": {"type": "ema", "period": 15, "timeframe": "30m"},
                "ema_slow": {"type": "ema", "period": 35, "timeframe": "30m"},
                "rsi_1h": {"type": "rsi", "period": 14, "timeframe": "1h"}
            },
            "entry": {
                "long": {"conditions": [
                    {"type": "crossover", "fast": "ema_fast", "slow": "ema_slow"},
                    {"type": "below_threshold", "indicator": "rsi_1h", "threshold": 70.0}
                ]},
                "short": {"conditions": [
                    {"type": "crossunder", "fast": "ema_fast", "slow": "ema_slow"}
                ]}
            },
            "exit": {"tp_pct": 0.08, "sl_pct": 0.035, "be_trigger_pct": 0.015, "be_lock_pct": 0.005},
            "scale_in": {"enabled": true, "dip_pct": 0.002}
        }"#;

        let strategy = DeclarativeStrategy::from_json_str(json).unwrap();
        assert_eq!(strategy.name(), "trend");
        assert_eq!(strategy.indicators().len(), 3);
        assert_eq!(strategy.spec.entry.long.conditions.len(), 2);
        assert_eq!(strategy.spec.exit.tp_pct, Some(0.08));
        assert!(strategy.spec.scale_in.enabled);
    }

    #[test]
    fn test_crossover_requires_prior_state() {
        let cond = Condition::Crossover {
            fast: "fast".to_string(),
            slow: "slow".to_string(),
        };
        let now = values(&[("fast", 11.0), ("slow", 10.0)]);
        let prev_below = values(&[("fast", 9.0), ("slow", 10.0)]);
        let prev_above = values(&[("fast", 12.0), ("slow", 10.0)]);

        assert!(cond.evaluate(&bar(), &now, &prev_below));
        // Already above: no new cross.
        assert!(!cond.evaluate(&bar(), &now, &prev_above));
        // Missing prior value: false.
        assert!(!cond.evaluate(&bar(), &now, &IndicatorValues::new()));
    }

    #[test]
    fn test_threshold_conditions() {
        let above = Condition::AboveThreshold {
            indicator: "rsi".to_string(),
            threshold: 70.0,
        };
        let below = Condition::BelowThreshold {
            indicator: "rsi".to_string(),
            threshold: 30.0,
        };
        let none = IndicatorValues::new();

        assert!(above.evaluate(&bar(), &values(&[("rsi", 75.0)]), &none));
        assert!(!above.evaluate(&bar(), &values(&[("rsi", 65.0)]), &none));
        assert!(below.evaluate(&bar(), &values(&[("rsi", 30.0)]), &none));
        // Warming up: false.
        assert!(!above.evaluate(&bar(), &none, &none));
    }

    #[test]
    fn test_operand_resolution() {
        let mut vals = values(&[("ema", 42.0)]);
        vals.insert(
            "macd_1h".to_string(),
            Some(IndicatorValue::record([("macd", 1.5), ("hist", -0.2)])),
        );

        let b = bar();
        assert_eq!(resolve_operand("bar.close", &b, &vals), Some(100.5));
        assert_eq!(resolve_operand("bar.low", &b, &vals), Some(99.0));
        assert_eq!(resolve_operand("ema", &b, &vals), Some(42.0));
        assert_eq!(resolve_operand("50.0", &b, &vals), Some(50.0));
        assert_eq!(resolve_operand("macd_1h.hist", &b, &vals), Some(-0.2));
        // A bare record name is not comparable.
        assert_eq!(resolve_operand("macd_1h", &b, &vals), None);
        assert_eq!(resolve_operand("missing", &b, &vals), None);
    }

    #[test]
    fn test_on_bar_emits_order_with_exit_fields() {
        let json = r#"{
            "entry": {"long": {"conditions": [
                {"type": "above", "left": "bar.close", "right": "100.0"}
            ]}},
            "exit": {"tp_pct": 0.05, "sl_pct": 0.02}
        }"#;
        let mut strategy = DeclarativeStrategy::from_json_str(json).unwrap();

        let requests = strategy.on_bar(&bar(), &IndicatorValues::new(), &[]).unwrap();
        assert_eq!(requests.len(), 1);
        match &requests[0] {
            OrderRequest::Place(order) => {
                assert_eq!(order.side, Side::Long);
                assert_eq!(order.tp_pct, Some(0.05));
                assert_eq!(order.sl_pct, Some(0.02));
            }
            other => panic!("expected order, got {other:?}"),
        }

        // In a position: no new signals.
        let pos = Position {
            side: Side::Long,
            entry_price: 100.0,
            entry_time: bar().timestamp,
            size_usd: 1_000.0,
            stop_loss: None,
            take_profit: None,
            symbol: "ETH".to_string(),
            group: None,
            entry_fees: 0.0,
            position_high: 100.0,
            position_low: 100.0,
            breakeven_activated: false,
            breakeven_trigger_pct: 0.0,
            breakeven_lock_pct: 0.0,
            trail_pct: 0.0,
            trail_activation_pct: 0.0,
            trailing_activated: false,
            partial_tp_pct: 0.0,
            partial_tp_new_tp_pct: 0.0,
            partial_tp_done: false,
        };
        let requests = strategy
            .on_bar(&bar(), &IndicatorValues::new(), &[pos])
            .unwrap();
        assert!(requests.is_empty());
    }

    #[test]
    fn test_scale_in_follow_ups() {
        let json = r#"{
            "scale_in": {"enabled": true, "dip_pct": 0.01, "size_pct": 0.5, "timeout_bars": 10}
        }"#;
        let mut strategy = DeclarativeStrategy::from_json_str(json).unwrap();

        let fill = Fill {
            timestamp: bar().timestamp,
            side: Side::Long,
            price: 100.0,
            size_usd: 10_000.0,
            symbol: "ETH".to_string(),
            fees: 0.0,
            slippage_cost: 0.0,
            is_entry: true,
            reason: String::new(),
        };
        let follow = strategy.on_fill(&fill).unwrap().unwrap();
        match follow {
            OrderRequest::Place(order) => {
                assert_eq!(order.size_usd, Some(5_000.0));
                assert!(order.cancel_pending_limits);
                match order.kind {
                    crate::types::OrderKind::Limit {
                        limit_price,
                        timeout_bars,
                        merge_position,
                        ..
                    } => {
                        assert!((limit_price - 99.0).abs() < 1e-9);
                        assert_eq!(timeout_bars, 10);
                        assert!(merge_position);
                    }
                    other => panic!("expected limit, got {other:?}"),
                }
            }
            other => panic!("expected order, got {other:?}"),
        }

        // Merge fills do not recurse into more scale-ins.
        let merge_fill = Fill {
            reason: "MERGE".to_string(),
            ..fill
        };
        assert!(strategy.on_fill(&merge_fill).unwrap().is_none());

        // A take-profit exit cancels the resting scale-in.
        let trade = Trade {
            entry_time: bar().timestamp,
            exit_time: bar().timestamp,
            side: Side::Long,
            entry_price: 100.0,
            exit_price: 105.0,
            size_usd: 10_000.0,
            pnl_usd: 500.0,
            pnl_pct: 0.05,
            fees: 3.0,
            reason: ExitReason::TakeProfitGap,
            symbol: "ETH".to_string(),
            is_partial: false,
            group: None,
        };
        let exit_fill = Fill {
            is_entry: false,
            reason: "TAKE_PROFIT_GAP".to_string(),
            ..merge_fill
        };
        assert_eq!(
            strategy.on_exit(&exit_fill, &trade).unwrap(),
            Some(OrderRequest::CancelPendingLimits)
        );
    }
}
