//! Moving averages: SMA and EMA.

use super::{Indicator, IndicatorValue, Source};
use crate::types::Bar;
use std::collections::VecDeque;

/// Simple moving average over the last `period` source values.
#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
    source: Source,
    window: VecDeque<f64>,
    sum: f64,
}

impl Sma {
    pub fn new(period: usize, source: Source) -> Self {
        Self {
            period: period.max(1),
            source,
            window: VecDeque::with_capacity(period.max(1)),
            sum: 0.0,
        }
    }
}

impl Indicator for Sma {
    fn update(&mut self, bar: &Bar) {
        let price = self.source.select(bar);
        self.window.push_back(price);
        self.sum += price;
        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
    }

    fn value(&self) -> Option<IndicatorValue> {
        if self.ready() {
            Some(IndicatorValue::scalar(self.sum / self.period as f64))
        } else {
            None
        }
    }

    fn ready(&self) -> bool {
        self.window.len() >= self.period
    }

    fn reset(&mut self) {
        self.window.clear();
        self.sum = 0.0;
    }
}

/// Exponential moving average with `alpha = 2 / (period + 1)`.
///
/// Seeded with the SMA of the first `period` values, then recursive.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    source: Source,
    multiplier: f64,
    seed_sum: f64,
    count: usize,
    ema: Option<f64>,
}

impl Ema {
    pub fn new(period: usize, source: Source) -> Self {
        let period = period.max(1);
        Self {
            period,
            source,
            multiplier: 2.0 / (period as f64 + 1.0),
            seed_sum: 0.0,
            count: 0,
            ema: None,
        }
    }

    /// Feed a raw value directly (used by MACD's signal line).
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        match self.ema {
            Some(prev) => {
                self.ema = Some((value - prev) * self.multiplier + prev);
            }
            None => {
                self.seed_sum += value;
                if self.count >= self.period {
                    self.ema = Some(self.seed_sum / self.period as f64);
                }
            }
        }
    }

    /// Current value regardless of the bar-level `Indicator` wrapper.
    pub fn current(&self) -> Option<f64> {
        self.ema
    }
}

impl Indicator for Ema {
    fn update(&mut self, bar: &Bar) {
        self.push(self.source.select(bar));
    }

    fn value(&self) -> Option<IndicatorValue> {
        self.ema.map(IndicatorValue::scalar)
    }

    fn ready(&self) -> bool {
        self.ema.is_some()
    }

    fn reset(&mut self) {
        self.seed_sum = 0.0;
        self.count = 0;
        self.ema = None;
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
    fn test_sma_rolling_window() {
        let mut sma = Sma::new(3, Source::Close);
        for bar in bars_from_closes(&[1.0, 2.0, 3.0, 4.0, 5.0]) {
            sma.update(&bar);
        }
        // Last three: 3, 4, 5
        assert_eq!(sma.value(), Some(IndicatorValue::Scalar(4.0)));
    }

    #[test]
    fn test_sma_warmup() {
        let mut sma = Sma::new(5, Source::Close);
        for bar in bars_from_closes(&[1.0, 2.0, 3.0, 4.0]) {
            sma.update(&bar);
            assert!(!sma.ready());
            assert!(sma.value().is_none());
        }
    }

    #[test]
    fn test_sma_source_selection() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bar = Bar::new(base, 10.0, 20.0, 5.0, 15.0, 1.0);
        let mut sma = Sma::new(1, Source::High);
        sma.update(&bar);
        assert_eq!(sma.value(), Some(IndicatorValue::Scalar(20.0)));
    }

    #[test]
    fn test_ema_seeds_with_sma() {
        let mut ema = Ema::new(3, Source::Close);
        for bar in bars_from_closes(&[3.0, 6.0, 9.0]) {
            ema.update(&bar);
        }
        // Seed = SMA(3, 6, 9) = 6
        assert_eq!(ema.value(), Some(IndicatorValue::Scalar(6.0)));

        // Next value: alpha = 0.5; 6 + (10 - 6) * 0.5 = 8
        ema.update(&bars_from_closes(&[0.0, 0.0, 0.0, 10.0])[3]);
        assert_eq!(ema.value(), Some(IndicatorValue::Scalar(8.0)));
    }

    #[test]
    fn test_ema_warmup_length() {
        let mut ema = Ema::new(5, Source::Close);
        for (i, bar) in bars_from_closes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .iter()
            .enumerate()
        {
            ema.update(bar);
            assert_eq!(ema.ready(), i >= 4);
        }
    }

    #[test]
    fn test_ema_reset() {
        let mut ema = Ema::new(2, Source::Close);
        for bar in bars_from_closes(&[1.0, 2.0, 3.0]) {
            ema.update(&bar);
        }
        assert!(ema.ready());
        ema.reset();
        assert!(!ema.ready());
        assert!(ema.value().is_none());
    }
}
