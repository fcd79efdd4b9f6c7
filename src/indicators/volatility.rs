//! Volatility indicators: ATR, CHOP, Bollinger Bands.

use super::{Indicator, IndicatorValue, Source};
use crate::types::Bar;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// ATR smoothing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AtrMode {
    /// Rolling mean of the true range.
    #[default]
    Sma,
    /// Wilder's smoothing after an SMA seed.
    Wilder,
}

/// Average True Range.
///
/// `TR = max(high - low, |high - prev_close|, |low - prev_close|)`; the
/// first bar's TR is its plain range.
#[derive(Debug, Clone)]
pub struct Atr {
    period: usize,
    mode: AtrMode,
    prev_close: Option<f64>,
    window: VecDeque<f64>,
    wilder: Option<f64>,
}

impl Atr {
    pub fn new(period: usize, mode: AtrMode) -> Self {
        let period = period.max(1);
        Self {
            period,
            mode,
            prev_close: None,
            window: VecDeque::with_capacity(period),
            wilder: None,
        }
    }

    /// Current ATR as a plain number (used by CHOP).
    pub fn current(&self) -> Option<f64> {
        match self.mode {
            AtrMode::Sma => {
                if self.window.len() >= self.period {
                    Some(self.window.iter().sum::<f64>() / self.period as f64)
                } else {
                    None
                }
            }
            AtrMode::Wilder => self.wilder,
        }
    }
}

impl Indicator for Atr {
    fn update(&mut self, bar: &Bar) {
        let tr = match self.prev_close {
            Some(prev) => (bar.high - bar.low)
                .max((bar.high - prev).abs())
                .max((bar.low - prev).abs()),
            None => bar.high - bar.low,
        };
        self.prev_close = Some(bar.close);

        match self.mode {
            AtrMode::Sma => {
                self.window.push_back(tr);
                if self.window.len() > self.period {
                    self.window.pop_front();
                }
            }
            AtrMode::Wilder => match self.wilder {
                Some(prev) => {
                    let p = self.period as f64;
                    self.wilder = Some((prev * (p - 1.0) + tr) / p);
                }
                None => {
                    self.window.push_back(tr);
                    if self.window.len() >= self.period {
                        self.wilder =
                            Some(self.window.iter().sum::<f64>() / self.period as f64);
                        self.window.clear();
                    }
                }
            },
        }
    }

    fn value(&self) -> Option<IndicatorValue> {
        self.current().map(IndicatorValue::scalar)
    }

    fn ready(&self) -> bool {
        self.current().is_some()
    }

    fn reset(&mut self) {
        self.prev_close = None;
        self.window.clear();
        self.wilder = None;
    }
}

/// Choppiness filter: `ATR(period) / close`, as a ratio.
///
/// High values flag ranging markets, low values trending ones.
#[derive(Debug, Clone)]
pub struct Chop {
    atr: Atr,
    last_close: Option<f64>,
}

impl Chop {
    pub fn new(period: usize, atr_mode: AtrMode) -> Self {
        Self {
            atr: Atr::new(period, atr_mode),
            last_close: None,
        }
    }
}

impl Indicator for Chop {
    fn update(&mut self, bar: &Bar) {
        self.atr.update(bar);
        self.last_close = Some(bar.close);
    }

    fn value(&self) -> Option<IndicatorValue> {
        let atr = self.atr.current()?;
        let close = self.last_close.filter(|c| *c > 0.0)?;
        Some(IndicatorValue::scalar(atr / close))
    }

    fn ready(&self) -> bool {
        self.value().is_some()
    }

    fn reset(&mut self) {
        self.atr.reset();
        self.last_close = None;
    }
}

/// Bollinger Bands. Record fields: `upper`, `middle`, `lower`, `bandwidth`,
/// `pct_b`.
#[derive(Debug, Clone)]
pub struct Bollinger {
    period: usize,
    num_std: f64,
    source: Source,
    window: VecDeque<f64>,
    sum: f64,
    sum_sq: f64,
}

impl Bollinger {
    pub fn new(period: usize, num_std: f64, source: Source) -> Self {
        let period = period.max(1);
        Self {
            period,
            num_std,
            source,
            window: VecDeque::with_capacity(period),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }
}

impl Indicator for Bollinger {
    fn update(&mut self, bar: &Bar) {
        let price = self.source.select(bar);
        self.window.push_back(price);
        self.sum += price;
        self.sum_sq += price * price;
        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }
    }

    fn value(&self) -> Option<IndicatorValue> {
        if !self.ready() {
            return None;
        }
        let n = self.period as f64;
        let mean = self.sum / n;
        let variance = (self.sum_sq / n - mean * mean).max(0.0);
        let std = variance.sqrt();

        let upper = mean + self.num_std * std;
        let lower = mean - self.num_std * std;
        let bandwidth = if mean > 0.0 { (upper - lower) / mean } else { 0.0 };
        let price = *self.window.back()?;
        let pct_b = if upper == lower {
            0.5
        } else {
            (price - lower) / (upper - lower)
        };

        Some(IndicatorValue::record([
            ("upper", upper),
            ("middle", mean),
            ("lower", lower),
            ("bandwidth", bandwidth),
            ("pct_b", pct_b),
        ]))
    }

    fn ready(&self) -> bool {
        self.window.len() >= self.period
    }

    fn reset(&mut self) {
        self.window.clear();
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }
}
