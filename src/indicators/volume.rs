//! Volume-based indicators: VWAP and OBV.

use super::{Indicator, IndicatorValue};
use crate::types::Bar;

/// Volume Weighted Average Price with a daily reset at midnight UTC.
///
/// The first bar at or after midnight resets the accumulators and then
/// contributes its own volume to the new day.
#[derive(Debug, Clone, Default)]
pub struct Vwap {
    cum_vol: f64,
    cum_tp_vol: f64,
    current_day: Option<i64>,
    value: Option<f64>,
}

impl Vwap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Indicator for Vwap {
    fn update(&mut self, bar: &Bar) {
        let day = bar.timestamp.timestamp().div_euclid(86_400);
        if self.current_day.is_some_and(|d| d != day) {
            self.cum_vol = 0.0;
            self.cum_tp_vol = 0.0;
        }
        self.current_day = Some(day);

        self.cum_tp_vol += bar.typical_price() * bar.volume;
        self.cum_vol += bar.volume;

        if self.cum_vol > 0.0 {
            self.value = Some(self.cum_tp_vol / self.cum_vol);
        }
    }

    fn value(&self) -> Option<IndicatorValue> {
        self.value.map(IndicatorValue::scalar)
    }

    fn ready(&self) -> bool {
        self.value.is_some()
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// On-Balance Volume: running volume total signed by close-to-close moves.
#[derive(Debug, Clone, Default)]
pub struct Obv {
    prev_close: Option<f64>,
    obv: f64,
    seen: bool,
}

impl Obv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Indicator for Obv {
    fn update(&mut self, bar: &Bar) {
        if let Some(prev) = self.prev_close {
            if bar.close > prev {
                self.obv += bar.volume;
            } else if bar.close < prev {
                self.obv -= bar.volume;
            }
        }
        self.prev_close = Some(bar.close);
        self.seen = true;
    }

    fn value(&self) -> Option<IndicatorValue> {
        if self.seen {
            Some(IndicatorValue::scalar(self.obv))
        } else {
            None
        }
    }

    fn ready(&self) -> bool {
        self.seen
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(hour: u32, min: u32, close: f64, volume: f64) -> Bar {
        Bar::new(
            Utc.with_ymd_and_hms(2024, 6, 1, hour, min, 0).unwrap(),
            close,
            close,
            close,
            close,
            volume,
        )
    }

    #[test]
    fn test_vwap_weighted_average() {
        let mut vwap = Vwap::new();
        vwap.update(&bar(10, 0, 100.0, 10.0));
        vwap.update(&bar(10, 1, 200.0, 30.0));
        // (100*10 + 200*30) / 40 = 175
        assert_eq!(vwap.value(), Some(IndicatorValue::Scalar(175.0)));
    }

    #[test]
    fn test_vwap_resets_at_midnight_utc() {
        let mut vwap = Vwap::new();
        vwap.update(&bar(23, 59, 100.0, 1_000.0));

        // First bar of the next day: accumulators reset before its volume
        // is added, so only this bar counts.
        let next_day = Bar::new(
            Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap(),
            300.0,
            300.0,
            300.0,
            300.0,
            5.0,
        );
        vwap.update(&next_day);
        assert_eq!(vwap.value(), Some(IndicatorValue::Scalar(300.0)));
    }

    #[test]
    fn test_vwap_zero_volume_keeps_warming() {
        let mut vwap = Vwap::new();
        vwap.update(&bar(10, 0, 100.0, 0.0));
        assert!(vwap.value().is_none());
    }

    #[test]
    fn test_obv_signed_accumulation() {
        let mut obv = Obv::new();
        obv.update(&bar(10, 0, 100.0, 5.0));
        assert_eq!(obv.value(), Some(IndicatorValue::Scalar(0.0)));

        obv.update(&bar(10, 1, 101.0, 7.0)); // up: +7
        obv.update(&bar(10, 2, 100.5, 3.0)); // down: -3
        obv.update(&bar(10, 3, 100.5, 9.0)); // flat: unchanged
        assert_eq!(obv.value(), Some(IndicatorValue::Scalar(4.0)));
    }

    #[test]
    fn test_obv_reset() {
        let mut obv = Obv::new();
        obv.update(&bar(10, 0, 100.0, 5.0));
        obv.update(&bar(10, 1, 101.0, 5.0));
        obv.reset();
        assert!(obv.value().is_none());
    }
}
