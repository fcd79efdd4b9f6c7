//! Incremental resampling of a 1m bar stream into higher timeframes.
//!
//! Buckets are aligned to the Unix epoch (UTC), so boundaries are
//! reproducible regardless of where the stream starts. A completed bucket
//! is emitted when a bar arrives that belongs to a later bucket; the
//! in-progress bucket is never visible to consumers.

use crate::types::{Bar, Timeframe};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
struct Bucket {
    id: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    symbol: String,
}

/// Folds 1m bars into bars of one higher timeframe.
#[derive(Debug, Clone)]
pub struct Resampler {
    timeframe: Timeframe,
    bucket: Option<Bucket>,
}

impl Resampler {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            bucket: None,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Epoch-aligned bucket index for a timestamp.
    fn bucket_id(&self, timestamp: DateTime<Utc>) -> i64 {
        timestamp.timestamp().div_euclid(self.timeframe.seconds())
    }

    /// The aligned start timestamp of a bucket.
    fn bucket_start(&self, id: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(id * self.timeframe.seconds(), 0)
            .expect("bucket start within chrono range")
    }

    /// Feed one 1m bar. Returns the completed higher-TF bar when this bar
    /// crosses into a new bucket, otherwise `None`.
    pub fn push(&mut self, bar: &Bar) -> Option<Bar> {
        let id = self.bucket_id(bar.timestamp);

        let completed = match &self.bucket {
            Some(bucket) if bucket.id != id => {
                let done = bucket.clone();
                self.bucket = None;
                Some(Bar {
                    timestamp: self.bucket_start(done.id),
                    open: done.open,
                    high: done.high,
                    low: done.low,
                    close: done.close,
                    volume: done.volume,
                    symbol: done.symbol,
                    timeframe: self.timeframe,
                })
            }
            _ => None,
        };

        match &mut self.bucket {
            Some(bucket) => {
                bucket.high = bucket.high.max(bar.high);
                bucket.low = bucket.low.min(bar.low);
                bucket.close = bar.close;
                bucket.volume += bar.volume;
            }
            None => {
                self.bucket = Some(Bucket {
                    id,
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                    symbol: bar.symbol.clone(),
                });
            }
        }

        completed
    }

    pub fn reset(&mut self) {
        self.bucket = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn minute_bars(start_hour: u32, start_min: u32, count: usize) -> Vec<Bar> {
        let base = Utc
            .with_ymd_and_hms(2024, 6, 1, start_hour, start_min, 0)
            .unwrap();
        (0..count)
            .map(|i| {
                let px = i as f64;
                Bar::new(base + Duration::minutes(i as i64), px, px, px, px, 1.0)
            })
            .collect()
    }

    #[test]
    fn test_fifteen_minute_bucket_alignment() {
        // Eighteen 1m bars from 10:00; the 16th bar (10:15) closes the
        // first bucket [10:00, 10:15).
        let mut resampler = Resampler::new(Timeframe::Minute15);
        let bars = minute_bars(10, 0, 18);

        let mut completed = Vec::new();
        for bar in &bars {
            if let Some(done) = resampler.push(bar) {
                completed.push(done);
            }
        }

        assert_eq!(completed.len(), 1);
        let done = &completed[0];
        assert_eq!(
            done.timestamp,
            Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(done.open, 0.0);
        assert_eq!(done.high, 14.0);
        assert_eq!(done.low, 0.0);
        assert_eq!(done.close, 14.0);
        assert_eq!(done.volume, 15.0);
        assert_eq!(done.timeframe, Timeframe::Minute15);
    }

    #[test]
    fn test_alignment_independent_of_start() {
        // Starting mid-bucket at 10:07 still aligns the first emitted
        // bucket to the epoch grid: [10:00, 10:15) with only 8 bars.
        let mut resampler = Resampler::new(Timeframe::Minute15);
        let bars = minute_bars(10, 7, 10);

        let mut completed = Vec::new();
        for bar in &bars {
            if let Some(done) = resampler.push(bar) {
                completed.push(done);
            }
        }

        assert_eq!(completed.len(), 1);
        assert_eq!(
            completed[0].timestamp,
            Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(completed[0].volume, 8.0);
    }

    #[test]
    fn test_in_progress_bucket_never_emitted() {
        let mut resampler = Resampler::new(Timeframe::Hour1);
        for bar in minute_bars(10, 0, 59) {
            assert!(resampler.push(&bar).is_none());
        }
    }

    #[test]
    fn test_ohlcv_folding() {
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let mut resampler = Resampler::new(Timeframe::Minute5);
        let bars = vec![
            Bar::new(base, 10.0, 12.0, 9.0, 11.0, 100.0),
            Bar::new(base + Duration::minutes(1), 11.0, 15.0, 10.0, 14.0, 50.0),
            Bar::new(base + Duration::minutes(2), 14.0, 14.5, 8.0, 9.0, 25.0),
            Bar::new(base + Duration::minutes(3), 9.0, 10.0, 8.5, 9.5, 25.0),
            Bar::new(base + Duration::minutes(4), 9.5, 11.0, 9.0, 10.5, 10.0),
            Bar::new(base + Duration::minutes(5), 10.5, 11.0, 10.0, 10.8, 1.0),
        ];

        let mut completed = None;
        for bar in &bars {
            if let Some(done) = resampler.push(bar) {
                completed = Some(done);
            }
        }

        let done = completed.expect("5m bucket should close");
        assert_eq!(done.open, 10.0);
        assert_eq!(done.high, 15.0);
        assert_eq!(done.low, 8.0);
        assert_eq!(done.close, 10.5);
        assert_eq!(done.volume, 210.0);
    }

    #[test]
    fn test_daily_bucket_crosses_midnight() {
        let mut resampler = Resampler::new(Timeframe::Day1);
        let before = Bar::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 0).unwrap(),
            1.0,
            1.0,
            1.0,
            1.0,
            1.0,
        );
        let after = Bar::new(
            Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap(),
            2.0,
            2.0,
            2.0,
            2.0,
            1.0,
        );

        assert!(resampler.push(&before).is_none());
        let done = resampler.push(&after).expect("daily bucket closes");
        assert_eq!(
            done.timestamp,
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_reset_clears_state() {
        let mut resampler = Resampler::new(Timeframe::Minute5);
        for bar in minute_bars(10, 0, 3) {
            resampler.push(&bar);
        }
        resampler.reset();
        // After reset the next bar starts a fresh bucket; nothing emitted.
        assert!(resampler.push(&minute_bars(11, 0, 1)[0]).is_none());
    }
}
