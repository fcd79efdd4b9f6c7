//! Momentum oscillators: RSI, MACD, Stochastic.

use super::moving::Ema;
use super::{Indicator, IndicatorValue, Source};
use crate::types::Bar;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// RSI smoothing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RsiMode {
    /// Wilder's smoothing: `avg = (avg * (p - 1) + x) / p` after an SMA seed.
    #[default]
    Wilder,
    /// Plain rolling arithmetic average of gains and losses.
    Simple,
}

/// Relative Strength Index, 0..100.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    mode: RsiMode,
    source: Source,
    prev_price: Option<f64>,
    avg_gain: f64,
    avg_loss: f64,
    count: usize,
    seed_gains: Vec<f64>,
    seed_losses: Vec<f64>,
    gains: VecDeque<f64>,
    losses: VecDeque<f64>,
}

impl Rsi {
    pub fn new(period: usize, mode: RsiMode, source: Source) -> Self {
        let period = period.max(1);
        Self {
            period,
            mode,
            source,
            prev_price: None,
            avg_gain: 0.0,
            avg_loss: 0.0,
            count: 0,
            seed_gains: Vec::with_capacity(period),
            seed_losses: Vec::with_capacity(period),
            gains: VecDeque::with_capacity(period),
            losses: VecDeque::with_capacity(period),
        }
    }

    fn rsi_from(avg_gain: f64, avg_loss: f64) -> f64 {
        if avg_loss == 0.0 {
            return 100.0;
        }
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

impl Indicator for Rsi {
    fn update(&mut self, bar: &Bar) {
        let price = self.source.select(bar);
        let Some(prev) = self.prev_price.replace(price) else {
            return;
        };
        let change = price - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        self.count += 1;

        match self.mode {
            RsiMode::Wilder => {
                if self.count <= self.period {
                    self.seed_gains.push(gain);
                    self.seed_losses.push(loss);
                    if self.count == self.period {
                        self.avg_gain =
                            self.seed_gains.iter().sum::<f64>() / self.period as f64;
                        self.avg_loss =
                            self.seed_losses.iter().sum::<f64>() / self.period as f64;
                    }
                } else {
                    let p = self.period as f64;
                    self.avg_gain = (self.avg_gain * (p - 1.0) + gain) / p;
                    self.avg_loss = (self.avg_loss * (p - 1.0) + loss) / p;
                }
            }
            RsiMode::Simple => {
                self.gains.push_back(gain);
                self.losses.push_back(loss);
                if self.gains.len() > self.period {
                    self.gains.pop_front();
                    self.losses.pop_front();
                }
            }
        }
    }

    fn value(&self) -> Option<IndicatorValue> {
        if !self.ready() {
            return None;
        }
        let (avg_gain, avg_loss) = match self.mode {
            RsiMode::Wilder => (self.avg_gain, self.avg_loss),
            RsiMode::Simple => (
                self.gains.iter().sum::<f64>() / self.period as f64,
                self.losses.iter().sum::<f64>() / self.period as f64,
            ),
        };
        Some(IndicatorValue::scalar(Self::rsi_from(avg_gain, avg_loss)))
    }

    fn ready(&self) -> bool {
        self.count >= self.period
    }

    fn reset(&mut self) {
        self.prev_price = None;
        self.avg_gain = 0.0;
        self.avg_loss = 0.0;
        self.count = 0;
        self.seed_gains.clear();
        self.seed_losses.clear();
        self.gains.clear();
        self.losses.clear();
    }
}

/// MACD: `macd = EMA(fast) - EMA(slow)`, `signal = EMA(macd, signal_period)`,
/// `hist = macd - signal`. Record fields: `macd`, `signal`, `hist`.
#[derive(Debug, Clone)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
    signal_period: usize,
    signal_count: usize,
}

impl Macd {
    pub fn new(fast_period: usize, slow_period: usize, signal_period: usize, source: Source) -> Self {
        Self {
            fast: Ema::new(fast_period, source),
            slow: Ema::new(slow_period, source),
            signal: Ema::new(signal_period, source),
            signal_period: signal_period.max(1),
            signal_count: 0,
        }
    }

    fn macd_line(&self) -> Option<f64> {
        match (self.fast.current(), self.slow.current()) {
            (Some(fast), Some(slow)) => Some(fast - slow),
            _ => None,
        }
    }
}

impl Indicator for Macd {
    fn update(&mut self, bar: &Bar) {
        self.fast.update(bar);
        self.slow.update(bar);
        // The signal EMA consumes MACD values, not prices.
        if let Some(macd) = self.macd_line() {
            self.signal.push(macd);
            self.signal_count += 1;
        }
    }

    fn value(&self) -> Option<IndicatorValue> {
        if !self.ready() {
            return None;
        }
        let macd = self.macd_line()?;
        let signal = self.signal.current()?;
        Some(IndicatorValue::record([
            ("macd", macd),
            ("signal", signal),
            ("hist", macd - signal),
        ]))
    }

    fn ready(&self) -> bool {
        self.signal_count >= self.signal_period && self.signal.current().is_some()
    }

    fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.signal.reset();
        self.signal_count = 0;
    }
}

/// Stochastic oscillator. Record fields: `k`, `d`.
///
/// `raw_k = 100 * (close - llow) / (hhigh - llow)` over `k_period`,
/// `k = SMA(raw_k, smooth_k)`, `d = SMA(k, d_period)`. Not ready until the
/// %D window is full.
#[derive(Debug, Clone)]
pub struct Stochastic {
    k_period: usize,
    d_period: usize,
    smooth_k: usize,
    highs: VecDeque<f64>,
    lows: VecDeque<f64>,
    raw_k: VecDeque<f64>,
    k_values: VecDeque<f64>,
}

impl Stochastic {
    pub fn new(k_period: usize, d_period: usize, smooth_k: usize) -> Self {
        let k_period = k_period.max(1);
        let d_period = d_period.max(1);
        let smooth_k = smooth_k.max(1);
        Self {
            k_period,
            d_period,
            smooth_k,
            highs: VecDeque::with_capacity(k_period),
            lows: VecDeque::with_capacity(k_period),
            raw_k: VecDeque::with_capacity(smooth_k),
            k_values: VecDeque::with_capacity(d_period),
        }
    }
}

impl Indicator for Stochastic {
    fn update(&mut self, bar: &Bar) {
        self.highs.push_back(bar.high);
        self.lows.push_back(bar.low);
        if self.highs.len() > self.k_period {
            self.highs.pop_front();
            self.lows.pop_front();
        }
        if self.highs.len() < self.k_period {
            return;
        }

        let highest = self.highs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let lowest = self.lows.iter().copied().fold(f64::INFINITY, f64::min);
        let raw = if highest == lowest {
            50.0
        } else {
            100.0 * (bar.close - lowest) / (highest - lowest)
        };

        self.raw_k.push_back(raw);
        if self.raw_k.len() > self.smooth_k {
            self.raw_k.pop_front();
        }
        if self.raw_k.len() < self.smooth_k {
            return;
        }

        let k = self.raw_k.iter().sum::<f64>() / self.smooth_k as f64;
        self.k_values.push_back(k);
        if self.k_values.len() > self.d_period {
            self.k_values.pop_front();
        }
    }

    fn value(&self) -> Option<IndicatorValue> {
        if !self.ready() {
            return None;
        }
        let k = *self.k_values.back()?;
        let d = self.k_values.iter().sum::<f64>() / self.d_period as f64;
        Some(IndicatorValue::record([("k", k), ("d", d)]))
    }

    fn ready(&self) -> bool {
        self.k_values.len() >= self.d_period
    }

    fn reset(&mut self) {
        self.highs.clear();
        self.lows.clear();
        self.raw_k.clear();
        self.k_values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar::new(base + Duration::minutes(i as i64), c, c, c, c, 1.0))
            .collect()
    }

    #[test]
    fn test_rsi_all_gains_is_100() {
        let mut rsi = Rsi::new(5, RsiMode::Wilder, Source::Close);
        for bar in bars_from_closes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]) {
            rsi.update(&bar);
        }
        assert_eq!(rsi.value(), Some(IndicatorValue::Scalar(100.0)));
    }

    #[test]
    fn test_rsi_warmup_needs_period_deltas() {
        let mut rsi = Rsi::new(3, RsiMode::Wilder, Source::Close);
        let bars = bars_from_closes(&[1.0, 2.0, 3.0, 4.0]);
        // 4 bars = 3 deltas: ready exactly at the last one.
        for (i, bar) in bars.iter().enumerate() {
            rsi.update(bar);
            assert_eq!(rsi.ready(), i >= 3);
        }
    }

    #[test]
    fn test_rsi_simple_mode_rolling() {
        let mut rsi = Rsi::new(3, RsiMode::Simple, Source::Close);
        for bar in bars_from_closes(&[10.0, 11.0, 10.0, 12.0]) {
            rsi.update(&bar);
        }
        // Last 3 deltas: +1, -1, +2 -> avg gain 1.0, avg loss 1/3.
        let value = rsi.value().unwrap().as_scalar().unwrap();
        let expected = 100.0 - 100.0 / (1.0 + 3.0);
        assert!((value - expected).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_balanced_moves_near_50() {
        let mut rsi = Rsi::new(4, RsiMode::Wilder, Source::Close);
        for bar in bars_from_closes(&[10.0, 11.0, 10.0, 11.0, 10.0]) {
            rsi.update(&bar);
        }
        let value = rsi.value().unwrap().as_scalar().unwrap();
        assert!((value - 50.0).abs() < 10.0);
    }

    #[test]
    fn test_macd_hist_consistency() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.3).sin()).collect();
        let mut macd = Macd::new(5, 10, 4, Source::Close);
        for bar in bars_from_closes(&closes) {
            macd.update(&bar);
        }
        let value = macd.value().expect("macd warmed up");
        let line = value.field("macd").unwrap();
        let signal = value.field("signal").unwrap();
        let hist = value.field("hist").unwrap();
        assert!((hist - (line - signal)).abs() < 1e-12);
    }

    #[test]
    fn test_macd_not_ready_before_signal_window() {
        let mut macd = Macd::new(3, 5, 4, Source::Close);
        // 5 bars: slow EMA just seeded, only 1 macd value so far.
        for bar in bars_from_closes(&[1.0, 2.0, 3.0, 4.0, 5.0]) {
            macd.update(&bar);
        }
        assert!(!macd.ready());
        // 3 more macd values complete the signal window.
        for bar in bars_from_closes(&[6.0, 7.0, 8.0]) {
            macd.update(&bar);
        }
        assert!(macd.ready());
    }

    #[test]
    fn test_stochastic_top_of_range() {
        let mut stoch = Stochastic::new(3, 2, 1);
        // Monotonically rising closes: %K pinned at 100.
        for bar in bars_from_closes(&[1.0, 2.0, 3.0, 4.0, 5.0]) {
            stoch.update(&bar);
        }
        let value = stoch.value().unwrap();
        assert!((value.field("k").unwrap() - 100.0).abs() < 1e-9);
        assert!((value.field("d").unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_stochastic_flat_range_is_50() {
        let mut stoch = Stochastic::new(3, 1, 1);
        for bar in bars_from_closes(&[5.0, 5.0, 5.0, 5.0]) {
            stoch.update(&bar);
        }
        assert_eq!(
            stoch.value().unwrap().field("k"),
            Some(50.0)
        );
    }

    #[test]
    fn test_stochastic_warmup_includes_d_window() {
        let mut stoch = Stochastic::new(3, 3, 2);
        let bars = bars_from_closes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        // k needs 3 bars, smoothing needs 2 k values, d needs 3 smoothed k.
        // First raw_k at bar 3, first k at bar 4, d full at bar 6 (0-based 5).
        for (i, bar) in bars.iter().enumerate() {
            stoch.update(bar);
            assert_eq!(stoch.ready(), i >= 5, "bar {i}");
        }
    }
}
