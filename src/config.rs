//! Engine configuration, with TOML file support for reproducible runs.

use crate::error::{BacktestError, Result};
use crate::indicators::IndicatorSpec;
use crate::sizing::PositionSizer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn default_initial_equity() -> f64 {
    10_000.0
}
fn default_size_usd() -> f64 {
    10_000.0
}
fn default_max_positions() -> usize {
    1
}
fn default_slippage() -> f64 {
    0.0002
}
fn default_taker_fee() -> f64 {
    0.00015
}
fn default_true() -> bool {
    true
}

/// Per-symbol overrides for the multi-asset engine. Unset fields inherit
/// the top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SymbolOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_size_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_positions: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_signal_on_close: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub same_direction_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indicators: Option<BTreeMap<String, IndicatorSpec>>,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Starting equity.
    #[serde(default = "default_initial_equity")]
    pub initial_equity: f64,
    /// Position size when the order and sizer specify none.
    #[serde(default = "default_size_usd")]
    pub default_size_usd: f64,
    /// Max concurrent positions per symbol.
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    /// Per-side slippage as a decimal.
    #[serde(default = "default_slippage")]
    pub slippage: f64,
    /// Per-side taker fee as a decimal.
    #[serde(default = "default_taker_fee")]
    pub taker_fee: f64,
    /// Per-side maker fee as a decimal.
    #[serde(default)]
    pub maker_fee: f64,
    /// Indicator name -> spec, forwarded to the indicator manager.
    #[serde(default)]
    pub indicators: BTreeMap<String, IndicatorSpec>,
    /// Skip the signal phase on bars where a position closed.
    #[serde(default = "default_true")]
    pub skip_signal_on_close: bool,
    /// Silently drop orders opposite to an open same-symbol position.
    #[serde(default = "default_true")]
    pub same_direction_only: bool,
    /// Portfolio-level cap on the sum of open position sizes
    /// (multi-asset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_exposure_usd: Option<f64>,
    /// Per-symbol overrides (multi-asset).
    #[serde(default)]
    pub symbol_configs: BTreeMap<String, SymbolOverrides>,
    /// Position sizer; supersedes `default_size_usd` when present.
    #[serde(skip)]
    pub sizer: Option<Arc<dyn PositionSizer>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_equity: default_initial_equity(),
            default_size_usd: default_size_usd(),
            max_positions: default_max_positions(),
            slippage: default_slippage(),
            taker_fee: default_taker_fee(),
            maker_fee: 0.0,
            indicators: BTreeMap::new(),
            skip_signal_on_close: true,
            same_direction_only: true,
            max_total_exposure_usd: None,
            symbol_configs: BTreeMap::new(),
            sizer: None,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a TOML file.
    pub fn from_toml_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BacktestError::ConfigError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Attach a position sizer.
    pub fn with_sizer(mut self, sizer: Arc<dyn PositionSizer>) -> Self {
        self.sizer = Some(sizer);
        self
    }

    /// Fail fast on inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if !(self.initial_equity > 0.0) {
            return Err(BacktestError::ConfigError(format!(
                "initial_equity must be positive, got {}",
                self.initial_equity
            )));
        }
        if !(self.default_size_usd > 0.0) {
            return Err(BacktestError::ConfigError(format!(
                "default_size_usd must be positive, got {}",
                self.default_size_usd
            )));
        }
        if self.max_positions == 0 {
            return Err(BacktestError::ConfigError(
                "max_positions must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("slippage", self.slippage),
            ("taker_fee", self.taker_fee),
            ("maker_fee", self.maker_fee),
        ] {
            if !(value >= 0.0) || !value.is_finite() {
                return Err(BacktestError::ConfigError(format!(
                    "{name} must be a non-negative finite number, got {value}"
                )));
            }
        }
        if let Some(cap) = self.max_total_exposure_usd {
            if !(cap > 0.0) {
                return Err(BacktestError::ConfigError(format!(
                    "max_total_exposure_usd must be positive, got {cap}"
                )));
            }
        }
        for (symbol, overrides) in &self.symbol_configs {
            if let Some(size) = overrides.default_size_usd {
                if !(size > 0.0) {
                    return Err(BacktestError::ConfigError(format!(
                        "symbol_configs.{symbol}.default_size_usd must be positive"
                    )));
                }
            }
            if overrides.max_positions == Some(0) {
                return Err(BacktestError::ConfigError(format!(
                    "symbol_configs.{symbol}.max_positions must be at least 1"
                )));
            }
        }
        Ok(())
    }

    /// The effective configuration for one symbol: the base with that
    /// symbol's overrides applied.
    pub fn resolve_for(&self, symbol: &str) -> EngineConfig {
        let mut resolved = self.clone();
        if let Some(overrides) = self.symbol_configs.get(symbol) {
            if let Some(size) = overrides.default_size_usd {
                resolved.default_size_usd = size;
            }
            if let Some(max) = overrides.max_positions {
                resolved.max_positions = max;
            }
            if let Some(skip) = overrides.skip_signal_on_close {
                resolved.skip_signal_on_close = skip;
            }
            if let Some(same) = overrides.same_direction_only {
                resolved.same_direction_only = same;
            }
            if let Some(indicators) = &overrides.indicators {
                resolved.indicators = indicators.clone();
            }
        }
        resolved
    }
}
