//! Bar-stream quality checks.

use crate::types::{Bar, Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What to do when a malformed bar is encountered during loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationPolicy {
    /// Stop on the first bad row.
    FailFast,
    /// Drop bad rows and log a warning.
    #[default]
    FilterWarn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

/// A single data quality issue found during validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataIssue {
    pub severity: Severity,
    /// Short identifier: `"duplicates"`, `"monotonic"`, `"ohlc"`, `"gaps"`.
    pub check: &'static str,
    pub message: String,
    pub index: Option<usize>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl DataIssue {
    fn new(
        severity: Severity,
        check: &'static str,
        message: String,
        index: usize,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            severity,
            check,
            message,
            index: Some(index),
            timestamp: Some(timestamp),
        }
    }
}

impl fmt::Display for DataIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.severity, self.check, self.message)
    }
}

/// Run all quality checks over a bar stream. Gaps larger than
/// `max_gap_ratio` times the expected interval produce warnings.
pub fn validate_bars(bars: &[Bar], timeframe: Timeframe, max_gap_ratio: f64) -> Vec<DataIssue> {
    let mut issues = Vec::new();
    if bars.is_empty() {
        issues.push(DataIssue {
            severity: Severity::Warning,
            check: "empty",
            message: "Bar stream is empty".to_string(),
            index: None,
            timestamp: None,
        });
        return issues;
    }

    for (i, bar) in bars.iter().enumerate() {
        if !bar.validate() {
            issues.push(DataIssue::new(
                Severity::Error,
                "ohlc",
                format!("Inconsistent OHLCV values: {bar:?}"),
                i,
                bar.timestamp,
            ));
        }
    }

    let expected = timeframe.seconds();
    for (i, window) in bars.windows(2).enumerate() {
        let prev = &window[0];
        let curr = &window[1];
        let gap = (curr.timestamp - prev.timestamp).num_seconds();

        if gap == 0 {
            issues.push(DataIssue::new(
                Severity::Error,
                "duplicates",
                format!("Duplicate timestamp {}", curr.timestamp),
                i + 1,
                curr.timestamp,
            ));
        } else if gap < 0 {
            issues.push(DataIssue::new(
                Severity::Error,
                "monotonic",
                format!(
                    "Timestamps not increasing: {} after {}",
                    curr.timestamp, prev.timestamp
                ),
                i + 1,
                curr.timestamp,
            ));
        } else if gap as f64 > expected as f64 * max_gap_ratio {
            issues.push(DataIssue::new(
                Severity::Warning,
                "gaps",
                format!(
                    "Gap of {gap}s (expected {expected}s) before {}",
                    curr.timestamp
                ),
                i + 1,
                curr.timestamp,
            ));
        }
    }

    issues
}
