//! CSV and Parquet decoding into bar vectors.
//!
//! Both loaders accept a configurable timestamp column name (with common
//! aliases as fallback), optional start/end filters, and a validation
//! policy: stop on the first bad row, or filter it out with a warning.

use crate::data::validation::ValidationPolicy;
use crate::error::{BacktestError, Result};
use crate::types::Bar;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use csv::ReaderBuilder;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info, warn};

const TIMESTAMP_ALIASES: &[&str] = &[
    "timestamp",
    "date",
    "time",
    "datetime",
    "Date",
    "Timestamp",
    "Time",
    "Datetime",
];
const OPEN_ALIASES: &[&str] = &["open", "Open", "o", "O"];
const HIGH_ALIASES: &[&str] = &["high", "High", "h", "H"];
const LOW_ALIASES: &[&str] = &["low", "Low", "l", "L"];
const CLOSE_ALIASES: &[&str] = &["close", "Close", "c", "C", "adj_close", "Adj Close"];
const VOLUME_ALIASES: &[&str] = &["volume", "Volume", "v", "V", "vol", "Vol"];

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Timestamp column name; aliases are tried when it is absent.
    pub timestamp_col: String,
    /// Explicit date format for string timestamps.
    pub date_format: Option<String>,
    /// Inclusive start filter.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive end filter.
    pub end: Option<DateTime<Utc>>,
    /// CSV delimiter.
    pub delimiter: u8,
    /// What to do with malformed rows.
    pub policy: ValidationPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            timestamp_col: "timestamp".to_string(),
            date_format: None,
            start: None,
            end: None,
            delimiter: b',',
            policy: ValidationPolicy::FilterWarn,
        }
    }
}

/// Parse a date string, trying the explicit format first and then a ladder
/// of common formats, finishing with Unix epoch seconds/milliseconds.
fn parse_datetime(s: &str, format: Option<&str>) -> Result<DateTime<Utc>> {
    if let Some(fmt) = format {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap()));
        }
    }

    let datetime_formats = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y/%m/%d %H:%M:%S",
        "%d-%m-%Y %H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
        "%m/%d/%Y %H:%M:%S",
    ];
    for fmt in &datetime_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
    }

    let date_formats = ["%Y-%m-%d", "%Y/%m/%d", "%d-%m-%Y", "%d/%m/%Y", "%m/%d/%Y"];
    for fmt in &date_formats {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap()));
        }
    }

    if let Ok(ts) = s.parse::<i64>() {
        let parsed = if ts > 1_000_000_000_000 {
            DateTime::from_timestamp_millis(ts)
        } else {
            DateTime::from_timestamp(ts, 0)
        };
        if let Some(dt) = parsed {
            return Ok(dt);
        }
    }

    Err(BacktestError::DataError(format!(
        "Could not parse date: '{s}'"
    )))
}

fn find_header<'a>(
    headers: &csv::StringRecord,
    preferred: &str,
    aliases: &'a [&str],
) -> Option<usize> {
    headers
        .iter()
        .position(|h| h == preferred)
        .or_else(|| headers.iter().position(|h| aliases.contains(&h)))
}

/// Finalize a loaded bar list: range-filter, sort, dedup, report.
fn finalize(mut bars: Vec<Bar>, config: &LoaderConfig, skipped: usize) -> Result<Vec<Bar>> {
    if let Some(start) = config.start {
        bars.retain(|b| b.timestamp >= start);
    }
    if let Some(end) = config.end {
        bars.retain(|b| b.timestamp <= end);
    }

    bars.sort_by_key(|b| b.timestamp);
    let before = bars.len();
    bars.dedup_by_key(|b| b.timestamp);
    if bars.len() < before {
        warn!("Removed {} duplicate timestamps", before - bars.len());
    }
    if skipped > 0 {
        warn!("Skipped {skipped} invalid rows");
    }

    if bars.is_empty() {
        return Err(BacktestError::NoData);
    }
    info!(
        "Loaded {} bars from {} to {}",
        bars.len(),
        bars.first().map(|b| b.timestamp.to_string()).unwrap_or_default(),
        bars.last().map(|b| b.timestamp.to_string()).unwrap_or_default()
    );
    Ok(bars)
}

fn handle_bad_row(
    policy: ValidationPolicy,
    skipped: &mut usize,
    row: usize,
    message: String,
) -> Result<()> {
    match policy {
        ValidationPolicy::FailFast => Err(BacktestError::DataError(format!(
            "row {row}: {message}"
        ))),
        ValidationPolicy::FilterWarn => {
            debug!("Skipping row {row}: {message}");
            *skipped += 1;
            Ok(())
        }
    }
}

/// Load OHLCV bars from a CSV file.
pub fn load_csv(path: impl AsRef<Path>, config: &LoaderConfig) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    info!("Loading data from: {}", path.display());

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(config.delimiter)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let ts_idx = find_header(&headers, &config.timestamp_col, TIMESTAMP_ALIASES)
        .ok_or_else(|| {
            BacktestError::DataError(format!(
                "No timestamp column '{}' (or known alias) in {}",
                config.timestamp_col,
                path.display()
            ))
        })?;
    let open_idx = find_header(&headers, "open", OPEN_ALIASES)
        .ok_or_else(|| BacktestError::DataError("No open column found".to_string()))?;
    let high_idx = find_header(&headers, "high", HIGH_ALIASES)
        .ok_or_else(|| BacktestError::DataError("No high column found".to_string()))?;
    let low_idx = find_header(&headers, "low", LOW_ALIASES)
        .ok_or_else(|| BacktestError::DataError("No low column found".to_string()))?;
    let close_idx = find_header(&headers, "close", CLOSE_ALIASES)
        .ok_or_else(|| BacktestError::DataError("No close column found".to_string()))?;
    let volume_idx = find_header(&headers, "volume", VOLUME_ALIASES);

    let mut bars = Vec::new();
    let mut skipped = 0;

    for (row_num, record) in reader.records().enumerate() {
        let row = row_num + 1;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                handle_bad_row(config.policy, &mut skipped, row, e.to_string())?;
                continue;
            }
        };

        let field = |idx: usize| record.get(idx).unwrap_or("").trim();
        let timestamp = match parse_datetime(field(ts_idx), config.date_format.as_deref()) {
            Ok(ts) => ts,
            Err(e) => {
                handle_bad_row(config.policy, &mut skipped, row, e.to_string())?;
                continue;
            }
        };

        let parse_f64 = |idx: usize| field(idx).parse::<f64>().ok();
        let values = (
            parse_f64(open_idx),
            parse_f64(high_idx),
            parse_f64(low_idx),
            parse_f64(close_idx),
        );
        let (open, high, low, close) = match values {
            (Some(o), Some(h), Some(l), Some(c)) => (o, h, l, c),
            _ => {
                handle_bad_row(
                    config.policy,
                    &mut skipped,
                    row,
                    "missing or non-numeric OHLC value".to_string(),
                )?;
                continue;
            }
        };
        let volume = volume_idx.and_then(parse_f64).unwrap_or(0.0);

        let bar = Bar::new(timestamp, open, high, low, close, volume);
        if !bar.validate() {
            handle_bad_row(
                config.policy,
                &mut skipped,
                row,
                format!("invalid bar data: {bar:?}"),
            )?;
            continue;
        }
        bars.push(bar);
    }

    finalize(bars, config, skipped)
}

/// Load OHLCV bars from a Parquet file.
///
/// Handles Arrow timestamp columns (s/ms/us/ns), Int64 epoch values
/// (seconds or milliseconds), and string timestamps; numeric columns may
/// be Float64 or Int64.
pub fn load_parquet(path: impl AsRef<Path>, config: &LoaderConfig) -> Result<Vec<Bar>> {
    use arrow::array::RecordBatchReader;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    let path = path.as_ref();
    info!("Loading Parquet data from: {}", path.display());

    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| BacktestError::DataError(format!("Failed to open parquet file: {e}")))?;
    let reader = builder
        .build()
        .map_err(|e| BacktestError::DataError(format!("Failed to build parquet reader: {e}")))?;

    let schema = reader.schema();
    let find_column = |preferred: &str, aliases: &[&str]| -> Option<usize> {
        schema
            .index_of(preferred)
            .ok()
            .or_else(|| aliases.iter().find_map(|name| schema.index_of(name).ok()))
    };

    let ts_idx = find_column(&config.timestamp_col, TIMESTAMP_ALIASES).ok_or_else(|| {
        BacktestError::DataError(format!(
            "No timestamp column '{}' (or known alias) in parquet file",
            config.timestamp_col
        ))
    })?;
    let open_idx = find_column("open", OPEN_ALIASES)
        .ok_or_else(|| BacktestError::DataError("No open column found".to_string()))?;
    let high_idx = find_column("high", HIGH_ALIASES)
        .ok_or_else(|| BacktestError::DataError("No high column found".to_string()))?;
    let low_idx = find_column("low", LOW_ALIASES)
        .ok_or_else(|| BacktestError::DataError("No low column found".to_string()))?;
    let close_idx = find_column("close", CLOSE_ALIASES)
        .ok_or_else(|| BacktestError::DataError("No close column found".to_string()))?;
    let volume_idx = find_column("volume", VOLUME_ALIASES);

    let mut bars = Vec::new();
    let mut skipped = 0;
    let mut row_num = 0;

    for batch_result in reader {
        let batch = batch_result
            .map_err(|e| BacktestError::DataError(format!("Failed to read parquet batch: {e}")))?;

        let ts_col = batch.column(ts_idx);
        let open_col = batch.column(open_idx);
        let high_col = batch.column(high_idx);
        let low_col = batch.column(low_idx);
        let close_col = batch.column(close_idx);
        let volume_col = volume_idx.map(|idx| batch.column(idx));

        for i in 0..batch.num_rows() {
            row_num += 1;
            let timestamp = match arrow_timestamp(ts_col.as_ref(), i, config.date_format.as_deref())
            {
                Ok(ts) => ts,
                Err(e) => {
                    handle_bad_row(config.policy, &mut skipped, row_num, e.to_string())?;
                    continue;
                }
            };

            let values = (
                arrow_f64(open_col.as_ref(), i),
                arrow_f64(high_col.as_ref(), i),
                arrow_f64(low_col.as_ref(), i),
                arrow_f64(close_col.as_ref(), i),
            );
            let (open, high, low, close) = match values {
                (Some(o), Some(h), Some(l), Some(c)) => (o, h, l, c),
                _ => {
                    handle_bad_row(
                        config.policy,
                        &mut skipped,
                        row_num,
                        "missing OHLC values".to_string(),
                    )?;
                    continue;
                }
            };
            let volume = volume_col
                .and_then(|col| arrow_f64(col.as_ref(), i))
                .unwrap_or(0.0);

            let bar = Bar::new(timestamp, open, high, low, close, volume);
            if !bar.validate() {
                handle_bad_row(
                    config.policy,
                    &mut skipped,
                    row_num,
                    format!("invalid bar data: {bar:?}"),
                )?;
                continue;
            }
            bars.push(bar);
        }
    }

    finalize(bars, config, skipped)
}

/// Read one f64 value from an Arrow column (Float64 or Int64).
fn arrow_f64(array: &dyn arrow::array::Array, idx: usize) -> Option<f64> {
    use arrow::array::{Array, Float64Array, Int64Array};

    if array.is_null(idx) {
        return None;
    }
    if let Some(f) = array.as_any().downcast_ref::<Float64Array>() {
        return Some(f.value(idx));
    }
    if let Some(i) = array.as_any().downcast_ref::<Int64Array>() {
        return Some(i.value(idx) as f64);
    }
    None
}

/// Read one timestamp from an Arrow column of any supported type.
fn arrow_timestamp(
    array: &dyn arrow::array::Array,
    idx: usize,
    date_format: Option<&str>,
) -> Result<DateTime<Utc>> {
    use arrow::array::{
        Array, Int64Array, StringArray, TimestampMicrosecondArray, TimestampMillisecondArray,
        TimestampNanosecondArray, TimestampSecondArray,
    };

    if array.is_null(idx) {
        return Err(BacktestError::DataError(format!(
            "Null timestamp at index {idx}"
        )));
    }

    if let Some(arr) = array.as_any().downcast_ref::<TimestampMillisecondArray>() {
        let millis = arr.value(idx);
        return DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| BacktestError::DataError(format!("Invalid timestamp millis: {millis}")));
    }
    if let Some(arr) = array.as_any().downcast_ref::<TimestampMicrosecondArray>() {
        let micros = arr.value(idx);
        return DateTime::from_timestamp(micros / 1_000_000, ((micros % 1_000_000) * 1000) as u32)
            .ok_or_else(|| BacktestError::DataError(format!("Invalid timestamp micros: {micros}")));
    }
    if let Some(arr) = array.as_any().downcast_ref::<TimestampNanosecondArray>() {
        let nanos = arr.value(idx);
        return DateTime::from_timestamp(nanos / 1_000_000_000, (nanos % 1_000_000_000) as u32)
            .ok_or_else(|| BacktestError::DataError(format!("Invalid timestamp nanos: {nanos}")));
    }
    if let Some(arr) = array.as_any().downcast_ref::<TimestampSecondArray>() {
        let secs = arr.value(idx);
        return DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| BacktestError::DataError(format!("Invalid timestamp seconds: {secs}")));
    }
    if let Some(arr) = array.as_any().downcast_ref::<Int64Array>() {
        let val = arr.value(idx);
        let parsed = if val > 1_000_000_000_000 {
            DateTime::from_timestamp_millis(val)
        } else {
            DateTime::from_timestamp(val, 0)
        };
        return parsed
            .ok_or_else(|| BacktestError::DataError(format!("Invalid epoch timestamp: {val}")));
    }
    if let Some(arr) = array.as_any().downcast_ref::<StringArray>() {
        return parse_datetime(arr.value(idx), date_format);
    }

    Err(BacktestError::DataError(format!(
        "Unsupported timestamp column type: {:?}",
        array.data_type()
    )))
}

/// Load bars from a file, choosing the decoder by extension
/// (`.csv` vs `.parquet`/`.pq`).
pub fn load_bars(path: impl AsRef<Path>, config: &LoaderConfig) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => load_csv(path, config),
        "parquet" | "pq" => load_parquet(path, config),
        other => Err(BacktestError::DataError(format!(
            "Unknown file format '.{other}'. Supported: .csv, .parquet, .pq"
        ))),
    }
}
