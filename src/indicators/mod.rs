//! Streaming technical indicators and the per-symbol indicator manager.
//!
//! Indicators consume completed bars of a single timeframe in chronological
//! order through [`Indicator::update`]; after each update, [`Indicator::value`]
//! is either `None` (warmup incomplete) or a concrete output. The
//! [`IndicatorManager`] owns all configured indicators plus one resampler
//! per non-1m timeframe and routes each incoming 1m bar accordingly, so
//! higher-timeframe indicators only ever see closed buckets.

pub mod momentum;
pub mod moving;
pub mod resampler;
pub mod volatility;
pub mod volume;

pub use momentum::{Macd, Rsi, RsiMode, Stochastic};
pub use moving::{Ema, Sma};
pub use resampler::Resampler;
pub use volatility::{Atr, AtrMode, Bollinger, Chop};
pub use volume::{Obv, Vwap};

use crate::types::{Bar, Timeframe};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single indicator output: a scalar, or a named record for indicators
/// with several outputs (Bollinger, MACD, Stochastic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndicatorValue {
    Scalar(f64),
    Record(BTreeMap<String, f64>),
}

impl IndicatorValue {
    pub fn scalar(value: f64) -> Self {
        IndicatorValue::Scalar(value)
    }

    pub fn record<const N: usize>(fields: [(&str, f64); N]) -> Self {
        IndicatorValue::Record(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    /// The scalar payload, if this is a scalar value.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            IndicatorValue::Scalar(v) => Some(*v),
            IndicatorValue::Record(_) => None,
        }
    }

    /// A named field of a record value.
    pub fn field(&self, name: &str) -> Option<f64> {
        match self {
            IndicatorValue::Scalar(_) => None,
            IndicatorValue::Record(map) => map.get(name).copied(),
        }
    }
}

impl fmt::Display for IndicatorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorValue::Scalar(v) => write!(f, "{v:.6}"),
            IndicatorValue::Record(map) => {
                let fields: Vec<String> =
                    map.iter().map(|(k, v)| format!("{k}={v:.6}")).collect();
                write!(f, "{{{}}}", fields.join(", "))
            }
        }
    }
}

/// Current values of every configured indicator, `None` while warming up.
pub type IndicatorValues = BTreeMap<String, Option<IndicatorValue>>;

/// Price field an indicator reads from each bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[default]
    Close,
    Open,
    High,
    Low,
}

impl Source {
    pub fn select(&self, bar: &Bar) -> f64 {
        match self {
            Source::Close => bar.close,
            Source::Open => bar.open,
            Source::High => bar.high,
            Source::Low => bar.low,
        }
    }
}

/// Stateful streaming operator over completed bars of one timeframe.
pub trait Indicator: Send {
    /// Process a new completed bar.
    fn update(&mut self, bar: &Bar);

    /// Current output, or `None` while warmup is incomplete.
    fn value(&self) -> Option<IndicatorValue>;

    /// True once enough bars have been processed for a valid output.
    fn ready(&self) -> bool;

    /// Clear all internal state.
    fn reset(&mut self);
}

fn default_period() -> usize {
    14
}
fn default_bb_period() -> usize {
    20
}
fn default_num_std() -> f64 {
    2.0
}
fn default_fast_period() -> usize {
    12
}
fn default_slow_period() -> usize {
    26
}
fn default_signal_period() -> usize {
    9
}
fn default_d_period() -> usize {
    3
}
fn default_smooth_k() -> usize {
    3
}

/// Declarative configuration for one indicator instance.
///
/// Deserializes from maps like
/// `{"type": "ema", "timeframe": "1h", "period": 35, "source": "close"}`.
/// Unknown `type` values are rejected at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IndicatorSpec {
    Sma {
        #[serde(default = "default_period")]
        period: usize,
        #[serde(default)]
        source: Source,
        #[serde(default)]
        timeframe: Timeframe,
    },
    Ema {
        #[serde(default = "default_period")]
        period: usize,
        #[serde(default)]
        source: Source,
        #[serde(default)]
        timeframe: Timeframe,
    },
    Rsi {
        #[serde(default = "default_period")]
        period: usize,
        #[serde(default)]
        mode: RsiMode,
        #[serde(default)]
        source: Source,
        #[serde(default)]
        timeframe: Timeframe,
    },
    Atr {
        #[serde(default = "default_period")]
        period: usize,
        #[serde(default)]
        mode: AtrMode,
        #[serde(default)]
        timeframe: Timeframe,
    },
    Chop {
        #[serde(default = "default_period")]
        period: usize,
        #[serde(default)]
        atr_mode: AtrMode,
        #[serde(default)]
        timeframe: Timeframe,
    },
    #[serde(alias = "bb")]
    Bollinger {
        #[serde(default = "default_bb_period")]
        period: usize,
        #[serde(default = "default_num_std")]
        num_std: f64,
        #[serde(default)]
        source: Source,
        #[serde(default)]
        timeframe: Timeframe,
    },
    Macd {
        #[serde(default = "default_fast_period")]
        fast_period: usize,
        #[serde(default = "default_slow_period")]
        slow_period: usize,
        #[serde(default = "default_signal_period")]
        signal_period: usize,
        #[serde(default)]
        source: Source,
        #[serde(default)]
        timeframe: Timeframe,
    },
    #[serde(alias = "stoch")]
    Stochastic {
        #[serde(default = "default_period")]
        k_period: usize,
        #[serde(default = "default_d_period")]
        d_period: usize,
        #[serde(default = "default_smooth_k")]
        smooth_k: usize,
        #[serde(default)]
        timeframe: Timeframe,
    },
    Vwap {
        #[serde(default)]
        timeframe: Timeframe,
    },
    Obv {
        #[serde(default)]
        timeframe: Timeframe,
    },
}

impl IndicatorSpec {
    /// The timeframe this indicator consumes.
    pub fn timeframe(&self) -> Timeframe {
        match self {
            IndicatorSpec::Sma { timeframe, .. }
            | IndicatorSpec::Ema { timeframe, .. }
            | IndicatorSpec::Rsi { timeframe, .. }
            | IndicatorSpec::Atr { timeframe, .. }
            | IndicatorSpec::Chop { timeframe, .. }
            | IndicatorSpec::Bollinger { timeframe, .. }
            | IndicatorSpec::Macd { timeframe, .. }
            | IndicatorSpec::Stochastic { timeframe, .. }
            | IndicatorSpec::Vwap { timeframe }
            | IndicatorSpec::Obv { timeframe } => *timeframe,
        }
    }

    /// Instantiate the indicator this spec describes.
    pub fn build(&self) -> Box<dyn Indicator> {
        match self {
            IndicatorSpec::Sma { period, source, .. } => Box::new(Sma::new(*period, *source)),
            IndicatorSpec::Ema { period, source, .. } => Box::new(Ema::new(*period, *source)),
            IndicatorSpec::Rsi {
                period,
                mode,
                source,
                ..
            } => Box::new(Rsi::new(*period, *mode, *source)),
            IndicatorSpec::Atr { period, mode, .. } => Box::new(Atr::new(*period, *mode)),
            IndicatorSpec::Chop {
                period, atr_mode, ..
            } => Box::new(Chop::new(*period, *atr_mode)),
            IndicatorSpec::Bollinger {
                period,
                num_std,
                source,
                ..
            } => Box::new(Bollinger::new(*period, *num_std, *source)),
            IndicatorSpec::Macd {
                fast_period,
                slow_period,
                signal_period,
                source,
                ..
            } => Box::new(Macd::new(*fast_period, *slow_period, *signal_period, *source)),
            IndicatorSpec::Stochastic {
                k_period,
                d_period,
                smooth_k,
                ..
            } => Box::new(Stochastic::new(*k_period, *d_period, *smooth_k)),
            IndicatorSpec::Vwap { .. } => Box::new(Vwap::new()),
            IndicatorSpec::Obv { .. } => Box::new(Obv::new()),
        }
    }
}

struct Slot {
    name: String,
    timeframe: Timeframe,
    indicator: Box<dyn Indicator>,
}

/// Owns all configured indicators and per-timeframe resamplers for one
/// symbol, routing each 1m bar to the right consumers.
///
/// Determinism: the values visible after `update(bar_t)` are a pure
/// function of the bars fed in so far. Iteration order is the sorted
/// indicator-name order.
pub struct IndicatorManager {
    slots: Vec<Slot>,
    resamplers: Vec<Resampler>,
}

impl IndicatorManager {
    /// Build from a name -> spec map. One resampler is created per distinct
    /// non-1m timeframe.
    pub fn new(config: &BTreeMap<String, IndicatorSpec>) -> Self {
        let mut slots = Vec::with_capacity(config.len());
        let mut timeframes: Vec<Timeframe> = Vec::new();

        for (name, spec) in config {
            let tf = spec.timeframe();
            if tf != Timeframe::Minute1 && !timeframes.contains(&tf) {
                timeframes.push(tf);
            }
            slots.push(Slot {
                name: name.clone(),
                timeframe: tf,
                indicator: spec.build(),
            });
        }
        timeframes.sort_by_key(|tf| tf.minutes());

        Self {
            slots,
            resamplers: timeframes.into_iter().map(Resampler::new).collect(),
        }
    }

    /// Create a manager with no indicators.
    pub fn empty() -> Self {
        Self {
            slots: Vec::new(),
            resamplers: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Route one 1m bar: update 1m indicators directly, feed each
    /// resampler, and forward any completed higher-TF bar to the
    /// indicators on that timeframe.
    pub fn update(&mut self, bar: &Bar) {
        for slot in &mut self.slots {
            if slot.timeframe == Timeframe::Minute1 {
                slot.indicator.update(bar);
            }
        }
        for resampler in &mut self.resamplers {
            if let Some(completed) = resampler.push(bar) {
                let tf = resampler.timeframe();
                for slot in &mut self.slots {
                    if slot.timeframe == tf {
                        slot.indicator.update(&completed);
                    }
                }
            }
        }
    }

    /// Snapshot of every configured indicator's current value.
    pub fn values(&self) -> IndicatorValues {
        self.slots
            .iter()
            .map(|slot| (slot.name.clone(), slot.indicator.value()))
            .collect()
    }

    /// A single indicator's current value.
    pub fn get(&self, name: &str) -> Option<IndicatorValue> {
        self.slots
            .iter()
            .find(|slot| slot.name == name)
            .and_then(|slot| slot.indicator.value())
    }

    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.indicator.reset();
        }
        for resampler in &mut self.resamplers {
            resampler.reset();
        }
    }
}
