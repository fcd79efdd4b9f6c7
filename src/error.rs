//! Error types for the backtest engine.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for the backtest engine.
#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("Data error: {0}")]
    DataError(String),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParseError(#[from] chrono::ParseError),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Strategy error at {timestamp}: {message}")]
    StrategyError {
        timestamp: DateTime<Utc>,
        message: String,
    },

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("No data loaded")]
    NoData,

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl BacktestError {
    /// Wrap a strategy callback failure with the bar it occurred on.
    pub fn strategy(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        BacktestError::StrategyError {
            timestamp,
            message: message.into(),
        }
    }
}

/// Result type alias for backtest operations.
pub type Result<T> = std::result::Result<T, BacktestError>;
