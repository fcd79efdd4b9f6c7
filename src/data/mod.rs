//! Data providers: lazy, restartable bar streams feeding the engine.

pub mod loader;
pub mod validation;

pub use loader::{load_bars, load_csv, load_parquet, LoaderConfig};
pub use validation::{validate_bars, DataIssue, Severity, ValidationPolicy};

use crate::error::Result;
use crate::types::{Bar, Timeframe};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Something that yields bars in non-decreasing timestamp order.
///
/// `reset()` rewinds to the beginning; a reset followed by a full run must
/// reproduce the exact same bar sequence.
pub trait DataProvider: Send {
    /// The next bar, or `None` at end of stream.
    fn next_bar(&mut self) -> Option<Bar>;

    /// Rewind to the first bar.
    fn reset(&mut self);

    /// Symbol served by this provider.
    fn symbol(&self) -> &str;

    /// Base timeframe of the stream.
    fn timeframe(&self) -> Timeframe;

    /// Number of bars, when known up front.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// In-memory provider over a pre-loaded bar vector.
#[derive(Debug, Clone)]
pub struct SliceProvider {
    bars: Vec<Bar>,
    cursor: usize,
    symbol: String,
    timeframe: Timeframe,
}

impl SliceProvider {
    /// Wrap pre-loaded bars, tagging each with `symbol`.
    pub fn new(mut bars: Vec<Bar>, symbol: impl Into<String>) -> Self {
        let symbol = symbol.into();
        for bar in &mut bars {
            if bar.symbol.is_empty() {
                bar.symbol = symbol.clone();
            }
        }
        let timeframe = bars
            .first()
            .map(|b| b.timeframe)
            .unwrap_or(Timeframe::Minute1);
        Self {
            bars,
            cursor: 0,
            symbol,
            timeframe,
        }
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }
}

impl DataProvider for SliceProvider {
    fn next_bar(&mut self) -> Option<Bar> {
        let bar = self.bars.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(bar)
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.bars.len())
    }
}

/// CSV/Parquet-backed provider. Data is decoded eagerly at construction
/// and replayed from memory.
#[derive(Debug, Clone)]
pub struct CsvProvider {
    inner: SliceProvider,
}

impl CsvProvider {
    /// Load from a CSV or Parquet file (decided by extension). An empty
    /// `symbol_name` infers the symbol from the file stem, e.g.
    /// `ETH_1m.csv` -> `ETH`.
    pub fn new(path: impl AsRef<Path>, symbol_name: &str, config: &LoaderConfig) -> Result<Self> {
        let path = path.as_ref();
        let symbol = if symbol_name.is_empty() {
            infer_symbol(path)
        } else {
            symbol_name.to_string()
        };
        let bars = load_bars(path, config)?;
        Ok(Self {
            inner: SliceProvider::new(bars, symbol),
        })
    }
}

fn infer_symbol(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    stem.split('_').next().unwrap_or(stem).to_string()
}

impl DataProvider for CsvProvider {
    fn next_bar(&mut self) -> Option<Bar> {
        self.inner.next_bar()
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn symbol(&self) -> &str {
        self.inner.symbol()
    }

    fn timeframe(&self) -> Timeframe {
        self.inner.timeframe()
    }

    fn len_hint(&self) -> Option<usize> {
        self.inner.len_hint()
    }
}

/// Wraps a provider and sleeps between bars proportionally to their
/// timestamp gaps, simulating real-time delivery for visualization.
///
/// Speed 0 disables throttling; 1 is real time; 60 plays a 1m bar per
/// second. Sleeping happens strictly in the producer path.
pub struct ReplayProvider<P: DataProvider> {
    inner: P,
    speed: f64,
    prev_ts: Option<chrono::DateTime<chrono::Utc>>,
}

impl<P: DataProvider> ReplayProvider<P> {
    pub fn new(inner: P, speed: f64) -> Self {
        Self {
            inner,
            speed,
            prev_ts: None,
        }
    }
}

impl<P: DataProvider> DataProvider for ReplayProvider<P> {
    fn next_bar(&mut self) -> Option<Bar> {
        let bar = self.inner.next_bar()?;
        if self.speed > 0.0 {
            if let Some(prev) = self.prev_ts {
                let gap = (bar.timestamp - prev).num_milliseconds();
                if gap > 0 {
                    let delay = gap as f64 / self.speed;
                    debug!(delay_ms = delay, "replay throttle");
                    std::thread::sleep(Duration::from_millis(delay as u64));
                }
            }
        }
        self.prev_ts = Some(bar.timestamp);
        Some(bar)
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.prev_ts = None;
    }

    fn symbol(&self) -> &str {
        self.inner.symbol()
    }

    fn timeframe(&self) -> Timeframe {
        self.inner.timeframe()
    }

    fn len_hint(&self) -> Option<usize> {
        self.inner.len_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn sample_bars(count: usize) -> Vec<Bar> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..count)
            .map(|i| {
                let px = 100.0 + i as f64;
                Bar::new(
                    base + ChronoDuration::minutes(i as i64),
                    px,
                    px,
                    px,
                    px,
                    1.0,
                )
            })
            .collect()
    }

    #[test]
    fn test_slice_provider_tags_and_iterates() {
        let mut provider = SliceProvider::new(sample_bars(3), "ETH");
        assert_eq!(provider.symbol(), "ETH");
        assert_eq!(provider.len_hint(), Some(3));

        let first = provider.next_bar().unwrap();
        assert_eq!(first.symbol, "ETH");
        assert!(provider.next_bar().is_some());
        assert!(provider.next_bar().is_some());
        assert!(provider.next_bar().is_none());
    }

    #[test]
    fn test_slice_provider_reset_replays_identically() {
        let mut provider = SliceProvider::new(sample_bars(5), "ETH");
        let first_pass: Vec<Bar> = std::iter::from_fn(|| provider.next_bar()).collect();
        provider.reset();
        let second_pass: Vec<Bar> = std::iter::from_fn(|| provider.next_bar()).collect();
        assert_eq!(first_pass, second_pass);
    }

    #[test]
    fn test_replay_provider_instant_mode() {
        let inner = SliceProvider::new(sample_bars(3), "ETH");
        let mut replay = ReplayProvider::new(inner, 0.0);
        let mut count = 0;
        while replay.next_bar().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(replay.symbol(), "ETH");
    }

    #[test]
    fn test_infer_symbol_from_stem() {
        assert_eq!(infer_symbol(Path::new("/data/ETH_1m.csv")), "ETH");
        assert_eq!(infer_symbol(Path::new("BTC.parquet")), "BTC");
    }
}
