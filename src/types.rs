//! Core data types shared by the alert engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-relative monotonic time in milliseconds
pub type Millis = u64;

/// Identifier handed out for every emitted alert
pub type AlertId = u64;

pub const SECOND_MS: Millis = 1_000;
pub const MINUTE_MS: Millis = 60_000;
pub const HOUR_MS: Millis = 3_600_000;

/// Reasons a sample is rejected before it touches engine state
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleError {
    #[error("price is not finite: {0}")]
    NonFinitePrice(f64),

    #[error("price must be positive: {0}")]
    NonPositivePrice(f64),

    #[error("price {price} outside sanity range [{min}, {max}]")]
    PriceOutOfRange { price: f64, min: f64, max: f64 },

    #[error("volume must be finite and >= 0: {0}")]
    InvalidVolume(f64),

    #[error("timestamp {timestamp} precedes last accepted sample at {last}")]
    TimestampRegression { timestamp: Millis, last: Millis },
}

/// Validation errors for candle data
#[derive(Debug, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be finite and positive: high={high}, low={low}, close={close}")]
    NonPositivePrice { high: f64, low: f64, close: f64 },
}

/// A single price observation for the tracked instrument
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub price: f64,
    /// Volume traded since the previous sample, when the feed reports it
    #[serde(default)]
    pub volume: Option<f64>,
    pub timestamp: Millis,
}

impl Sample {
    pub fn new(price: f64, timestamp: Millis) -> Self {
        Self {
            price,
            volume: None,
            timestamp,
        }
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Check price and volume against the sanity range
    pub fn validate(&self, min_price: f64, max_price: f64) -> Result<(), SampleError> {
        if !self.price.is_finite() {
            return Err(SampleError::NonFinitePrice(self.price));
        }
        if self.price <= 0.0 {
            return Err(SampleError::NonPositivePrice(self.price));
        }
        if self.price < min_price || self.price > max_price {
            return Err(SampleError::PriceOutOfRange {
                price: self.price,
                min: min_price,
                max: max_price,
            });
        }
        if let Some(volume) = self.volume {
            if !volume.is_finite() || volume < 0.0 {
                return Err(SampleError::InvalidVolume(volume));
            }
        }
        Ok(())
    }
}

/// OHLCV candlestick data, as returned by the candle feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Validate the fields the engine relies on
    pub fn validate(&self) -> Result<(), CandleValidationError> {
        let prices_ok = [self.high, self.low, self.close]
            .iter()
            .all(|p| p.is_finite() && *p > 0.0);
        if !prices_ok {
            return Err(CandleValidationError::NonPositivePrice {
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        if self.close < self.low || self.close > self.high {
            return Err(CandleValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Instrument symbol using Arc<str> for cheap cloning into alert text
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a price move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Direction of a signed return; zero and non-finite have none
    pub fn of(ret: f64) -> Option<Direction> {
        if !ret.is_finite() || ret == 0.0 {
            None
        } else if ret > 0.0 {
            Some(Direction::Up)
        } else {
            Some(Direction::Down)
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Direction::Up => "UP",
            Direction::Down => "DOWN",
        }
    }

    pub fn color(&self) -> ColorTag {
        match self {
            Direction::Up => ColorTag::Green,
            Direction::Down => ColorTag::Red,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Medium-term trend classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrendState {
    Up,
    Down,
    #[default]
    Sideways,
}

impl TrendState {
    /// Sideways agrees with either direction
    pub fn agrees_with(&self, direction: Direction) -> bool {
        match self {
            TrendState::Sideways => true,
            TrendState::Up => direction == Direction::Up,
            TrendState::Down => direction == Direction::Down,
        }
    }
}

impl std::fmt::Display for TrendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrendState::Up => "UP",
            TrendState::Down => "DOWN",
            TrendState::Sideways => "SIDEWAYS",
        };
        f.write_str(s)
    }
}

/// How an alert kind is gated before delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertClass {
    /// Regime change: bypasses the secondary throttle, keeps its own cooldown
    Primary,
    /// Regime context: throttled and coalesced
    Secondary,
    /// Governed by a per-kind cooldown and hourly cap
    Independent,
}

/// Every alert the engine can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    Spike1m,
    Move5m,
    Move30m,
    Confluence,
    BreakoutUp,
    BreakoutDown,
    Compression,
    MeanTouch,
    AnchorContext,
    TrendChange,
    AnchorTakeProfit,
    AnchorMaxLoss,
}

impl AlertKind {
    pub const ALL: [AlertKind; 12] = [
        AlertKind::Spike1m,
        AlertKind::Move5m,
        AlertKind::Move30m,
        AlertKind::Confluence,
        AlertKind::BreakoutUp,
        AlertKind::BreakoutDown,
        AlertKind::Compression,
        AlertKind::MeanTouch,
        AlertKind::AnchorContext,
        AlertKind::TrendChange,
        AlertKind::AnchorTakeProfit,
        AlertKind::AnchorMaxLoss,
    ];

    pub fn class(&self) -> AlertClass {
        match self {
            AlertKind::BreakoutUp | AlertKind::BreakoutDown => AlertClass::Primary,
            AlertKind::Compression
            | AlertKind::MeanTouch
            | AlertKind::AnchorContext
            | AlertKind::TrendChange => AlertClass::Secondary,
            AlertKind::Spike1m
            | AlertKind::Move5m
            | AlertKind::Move30m
            | AlertKind::Confluence
            | AlertKind::AnchorTakeProfit
            | AlertKind::AnchorMaxLoss => AlertClass::Independent,
        }
    }

    /// Static coalescing priority; higher wins
    pub fn priority(&self) -> u8 {
        match self {
            AlertKind::BreakoutUp | AlertKind::BreakoutDown => 5,
            AlertKind::TrendChange => 4,
            AlertKind::AnchorContext => 3,
            AlertKind::MeanTouch => 2,
            AlertKind::Compression => 1,
            _ => 0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AlertKind::Spike1m => "1m spike",
            AlertKind::Move5m => "5m move",
            AlertKind::Move30m => "30m move",
            AlertKind::Confluence => "confluence",
            AlertKind::BreakoutUp => "breakout",
            AlertKind::BreakoutDown => "breakdown",
            AlertKind::Compression => "range compression",
            AlertKind::MeanTouch => "mean touch",
            AlertKind::AnchorContext => "anchor outside range",
            AlertKind::TrendChange => "trend change",
            AlertKind::AnchorTakeProfit => "take profit",
            AlertKind::AnchorMaxLoss => "max loss",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Color hint passed through to the notifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorTag {
    Green,
    Red,
    Blue,
    Yellow,
    Purple,
    Orange,
}

impl ColorTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColorTag::Green => "green",
            ColorTag::Red => "red",
            ColorTag::Blue => "blue",
            ColorTag::Yellow => "yellow",
            ColorTag::Purple => "purple",
            ColorTag::Orange => "orange",
        }
    }
}

impl std::fmt::Display for ColorTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert content produced by a detector, before the engine stamps it
#[derive(Debug, Clone, PartialEq)]
pub struct AlertDraft {
    pub kind: AlertKind,
    pub title: String,
    pub message: String,
    pub color: Option<ColorTag>,
}

impl AlertDraft {
    pub fn new(kind: AlertKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            color: None,
        }
    }

    pub fn with_color(mut self, color: ColorTag) -> Self {
        self.color = Some(color);
        self
    }
}

/// An alert ready for delivery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: AlertId,
    pub kind: AlertKind,
    pub class: AlertClass,
    pub title: String,
    pub message: String,
    pub color: Option<ColorTag>,
    pub price: f64,
    pub timestamp: Millis,
}
