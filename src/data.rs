//! CSV loading for replays
//!
//! Sample files carry `timestamp_ms,price[,volume]` rows; candle files carry
//! `datetime,open,high,low,close,volume` rows with the datetime in RFC 3339
//! or `%Y-%m-%d %H:%M:%S` (UTC).

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

use crate::{Candle, Millis, Sample};

#[derive(Debug, Deserialize)]
struct SampleRow {
    timestamp_ms: Millis,
    price: f64,
    #[serde(default)]
    volume: Option<f64>,
}

/// Load price samples. Rows are returned as written; the engine rejects
/// invalid ones itself.
pub fn load_samples_csv(path: impl AsRef<Path>) -> Result<Vec<Sample>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open sample file {}", path.display()))?;

    let mut samples = Vec::new();
    for (row_idx, result) in reader.deserialize::<SampleRow>().enumerate() {
        let row = result.with_context(|| format!("Failed to read sample row {}", row_idx + 1))?;
        samples.push(Sample {
            price: row.price,
            timestamp: row.timestamp_ms,
            volume: row.volume,
        });
    }

    info!("Loaded {} samples from {}", samples.len(), path.display());
    Ok(samples)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .or_else(|_| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
        .with_context(|| format!("Failed to parse datetime: {}", s))
}

fn field(record: &csv::StringRecord, idx: usize, name: &str) -> Result<f64> {
    record
        .get(idx)
        .with_context(|| format!("Missing {} column", name))?
        .trim()
        .parse()
        .with_context(|| format!("Failed to parse {}", name))
}

/// Load OHLCV candles, oldest first. Malformed candles are skipped with a
/// warning.
pub fn load_candles_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open candle file {}", path.display()))?;

    let mut candles = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read candle row {}", row_idx + 1))?;

        let datetime = parse_datetime(record.get(0).context("Missing datetime column")?.trim())?;
        let candle = Candle {
            datetime,
            open: field(&record, 1, "open")?,
            high: field(&record, 2, "high")?,
            low: field(&record, 3, "low")?,
            close: field(&record, 4, "close")?,
            volume: field(&record, 5, "volume")?,
        };

        if let Err(e) = candle.validate() {
            warn!(row = row_idx + 1, error = %e, "Skipping malformed candle");
            continue;
        }
        candles.push(candle);
    }

    candles.sort_by_key(|c| c.datetime);
    info!("Loaded {} candles from {}", candles.len(), path.display());
    Ok(candles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("crypto_alerts_{}_{}", std::process::id(), name));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_samples_with_optional_volume() {
        let path = temp_file(
            "samples.csv",
            "timestamp_ms,price,volume\n0,100.5,2.0\n1000,101.0,\n2000,99.5,0.5\n",
        );
        let samples = load_samples_csv(&path).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].volume, Some(2.0));
        assert_eq!(samples[1].volume, None);
        assert_eq!(samples[2].timestamp, 2000);
        assert_eq!(samples[2].price, 99.5);
    }

    #[test]
    fn test_load_samples_without_volume_column() {
        let path = temp_file("samples_no_volume.csv", "timestamp_ms,price\n0,100\n60000,101\n");
        let samples = load_samples_csv(&path).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.volume.is_none()));
    }

    #[test]
    fn test_load_samples_rejects_garbage() {
        let path = temp_file("samples_bad.csv", "timestamp_ms,price\nabc,100\n");
        assert!(load_samples_csv(&path).is_err());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_candles_skips_malformed() {
        let path = temp_file(
            "candles.csv",
            "datetime,open,high,low,close,volume\n\
             2024-01-02 00:00:00,100,110,95,105,10\n\
             2024-01-01T00:00:00Z,100,90,95,105,10\n\
             2024-01-01 00:00:00,100,102,98,101,5\n",
        );
        let candles = load_candles_csv(&path).unwrap();
        fs::remove_file(&path).ok();

        // high below low is dropped; the rest come back sorted
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 101.0);
        assert_eq!(candles[1].close, 105.0);
    }
}
