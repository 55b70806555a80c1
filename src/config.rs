//! Configuration management
//!
//! Handles loading, validating and atomically saving the JSON settings file.
//! Every section carries serde defaults so a partial file is enough; the
//! instrument label can be overridden from the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::{AlertKind, Millis, Symbol};

/// Errors raised while loading or saving settings
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("inconsistent config: {0}")]
    Inconsistent(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_instrument")]
    pub instrument: Symbol,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub sanity: SanityConfig,
    #[serde(default)]
    pub volatility: VolatilityConfig,
    #[serde(default)]
    pub trend: TrendConfig,
    #[serde(default)]
    pub timeframes: TimeframeConfig,
    #[serde(default)]
    pub regime: RegimeConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub anchor: AnchorConfig,
    #[serde(default)]
    pub auto_anchor: AutoAnchorConfig,
}

fn default_instrument() -> Symbol {
    Symbol::new("BTCUSDT")
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            instrument: default_instrument(),
            history: HistoryConfig::default(),
            sanity: SanityConfig::default(),
            volatility: VolatilityConfig::default(),
            trend: TrendConfig::default(),
            timeframes: TimeframeConfig::default(),
            regime: RegimeConfig::default(),
            throttle: ThrottleConfig::default(),
            anchor: AnchorConfig::default(),
            auto_anchor: AutoAnchorConfig::default(),
        }
    }
}

impl Settings {
    /// Load configuration from JSON file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut settings: Settings =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        if let Ok(instrument) = std::env::var("CRYPTO_ALERTS_INSTRUMENT") {
            settings.instrument = Symbol::new(instrument);
        }

        settings.validate().context("Config rejected")?;
        Ok(settings)
    }

    /// Reject clamp relationships the engine cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        let v = &self.volatility;
        ensure(v.window_minutes > 0, "volatility.window_minutes must be > 0")?;
        ensure(
            v.baseline_std_pct > 0.0,
            "volatility.baseline_std_pct must be > 0",
        )?;
        ensure(
            v.min_multiplier > 0.0 && v.min_multiplier <= 1.0,
            "volatility.min_multiplier must be in (0, 1]",
        )?;
        ensure(
            v.max_multiplier >= 1.0,
            "volatility.max_multiplier must be >= 1",
        )?;
        ensure(
            v.min_multiplier < v.max_multiplier,
            "volatility.min_multiplier must be < max_multiplier",
        )?;

        ensure(self.trend.threshold_pct > 0.0, "trend.threshold_pct must be > 0")?;

        let t = &self.timeframes;
        ensure(
            t.spike_1m_pct > 0.0 && t.move_5m_pct > 0.0 && t.move_30m_pct > 0.0,
            "timeframe thresholds must be > 0",
        )?;
        ensure(
            t.confirm_5m_for_1m_pct >= 0.0
                && t.confirm_30m_for_5m_pct >= 0.0
                && t.confirm_5m_for_30m_pct >= 0.0,
            "confirmation thresholds must be >= 0",
        )?;
        ensure(
            t.volume_ema_period > 0,
            "timeframes.volume_ema_period must be > 0",
        )?;
        ensure(
            t.volume_multiplier > 0.0,
            "timeframes.volume_multiplier must be > 0",
        )?;

        let r = &self.regime;
        ensure(r.window_ms > 0, "regime.window_ms must be > 0")?;
        ensure(
            r.breakout_margin_pct >= 0.0 && r.breakout_reset_margin_pct >= 0.0,
            "breakout margins must be >= 0",
        )?;
        ensure(
            r.compress_threshold_pct < r.compress_reset_pct,
            "regime.compress_threshold_pct must be < compress_reset_pct",
        )?;
        ensure(
            r.mean_touch_band_pct > 0.0 && r.mean_touch_band_pct < r.mean_min_distance_pct,
            "regime.mean_touch_band_pct must be in (0, mean_min_distance_pct)",
        )?;
        ensure(
            r.anchor_outside_margin_pct >= 0.0,
            "regime.anchor_outside_margin_pct must be >= 0",
        )?;

        let a = &self.anchor;
        ensure(a.take_profit_pct > 0.0, "anchor.take_profit_pct must be > 0")?;
        ensure(a.max_loss_pct < 0.0, "anchor.max_loss_pct must be < 0")?;
        ensure(
            [
                a.uptrend_take_profit_mult,
                a.uptrend_max_loss_mult,
                a.downtrend_take_profit_mult,
                a.downtrend_max_loss_mult,
            ]
            .iter()
            .all(|m| m.is_finite() && *m > 0.0),
            "anchor trend multipliers must be > 0",
        )?;

        let aa = &self.auto_anchor;
        ensure(
            aa.base_weight_4h >= 0.0 && aa.base_weight_4h <= aa.max_weight_4h && aa.max_weight_4h <= 1.0,
            "auto_anchor weights must satisfy 0 <= base_weight_4h <= max_weight_4h <= 1",
        )?;
        ensure(aa.pivot_pct > 0.0, "auto_anchor.pivot_pct must be > 0")?;
        ensure(
            aa.ema_period_4h > 0
                && aa.ema_period_1d > 0
                && aa.candles_4h >= aa.ema_period_4h
                && aa.candles_1d >= aa.ema_period_1d,
            "auto_anchor candle counts must cover their EMA periods",
        )?;
        ensure(
            aa.breaker_failure_threshold > 0,
            "auto_anchor.breaker_failure_threshold must be > 0",
        )?;
        ensure(
            aa.force_interval_ms >= aa.interval_ms,
            "auto_anchor.force_interval_ms must be >= interval_ms",
        )?;

        let s = &self.sanity;
        ensure(
            s.min_price >= 0.0 && s.min_price < s.max_price,
            "sanity.min_price must be >= 0 and < max_price",
        )?;

        ensure(
            self.history.resolution_ms > 0,
            "history.resolution_ms must be > 0",
        )?;

        Ok(())
    }

    /// Longest look-back any component needs from the price history
    pub fn history_retention_ms(&self) -> Millis {
        self.regime
            .window_ms
            .max(self.trend.long_window_ms)
            .max(self.trend.short_window_ms)
            .max(30 * crate::MINUTE_MS)
    }
}

fn ensure(condition: bool, message: &str) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Inconsistent(message.to_string()))
    }
}

/// Price history resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Samples closer together than this share one history bucket
    pub resolution_ms: Millis,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            resolution_ms: 1_000,
        }
    }
}

/// Sanity bounds applied to every sample
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanityConfig {
    pub min_price: f64,
    pub max_price: f64,
}

impl Default for SanityConfig {
    fn default() -> Self {
        SanityConfig {
            min_price: 0.0,
            max_price: 1e9,
        }
    }
}

/// Volatility-adaptive threshold scaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatilityConfig {
    /// Number of 1-minute returns kept (capped at 240)
    pub window_minutes: usize,
    /// Standard deviation of 1-minute returns (in %) considered "normal"
    pub baseline_std_pct: f64,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        VolatilityConfig {
            window_minutes: 60,
            baseline_std_pct: 0.12,
            min_multiplier: 0.7,
            max_multiplier: 1.6,
        }
    }
}

/// Trend detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Long-window return (in %) needed to call a trend
    pub threshold_pct: f64,
    pub long_window_ms: Millis,
    pub short_window_ms: Millis,
    /// Minimum time between trend change notifications
    pub change_cooldown_ms: Millis,
}

impl Default for TrendConfig {
    fn default() -> Self {
        TrendConfig {
            threshold_pct: 1.3,
            long_window_ms: 2 * crate::HOUR_MS,
            short_window_ms: 30 * crate::MINUTE_MS,
            change_cooldown_ms: 10 * crate::MINUTE_MS,
        }
    }
}

/// Multi-timeframe spike/move detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeframeConfig {
    pub spike_1m_pct: f64,
    pub move_5m_pct: f64,
    pub move_30m_pct: f64,

    /// Same-direction 5m return required to confirm a 1m spike
    pub confirm_5m_for_1m_pct: f64,
    /// Same-direction 30m return required to confirm a 5m move
    pub confirm_30m_for_5m_pct: f64,
    /// Same-direction 5m return required to confirm a 30m move
    pub confirm_5m_for_30m_pct: f64,

    /// Fail closed when the feed carries no volume
    pub require_volume_confirmation: bool,
    pub volume_ema_period: usize,
    pub volume_multiplier: f64,
    pub min_range_1m_pct: f64,
    pub min_range_5m_pct: f64,
    pub min_range_30m_pct: f64,

    /// Max distance between the 1m and 5m events of a confluence
    pub confluence_window_ms: Millis,
    /// Cross-kind cooldown shared by all volume-confirmed alerts
    pub volume_event_cooldown_ms: Millis,

    pub cooldown_1m_ms: Millis,
    pub cooldown_5m_ms: Millis,
    pub cooldown_30m_ms: Millis,
    pub cooldown_confluence_ms: Millis,
    pub max_per_hour_1m: u32,
    pub max_per_hour_5m: u32,
    pub max_per_hour_30m: u32,
    pub max_per_hour_confluence: u32,
}

impl Default for TimeframeConfig {
    fn default() -> Self {
        TimeframeConfig {
            spike_1m_pct: 0.5,
            move_5m_pct: 1.0,
            move_30m_pct: 2.0,
            confirm_5m_for_1m_pct: 0.3,
            confirm_30m_for_5m_pct: 0.5,
            confirm_5m_for_30m_pct: 0.5,
            require_volume_confirmation: false,
            volume_ema_period: 20,
            volume_multiplier: 1.5,
            min_range_1m_pct: 0.2,
            min_range_5m_pct: 0.4,
            min_range_30m_pct: 0.8,
            confluence_window_ms: 5 * crate::MINUTE_MS,
            volume_event_cooldown_ms: 2 * crate::MINUTE_MS,
            cooldown_1m_ms: 5 * crate::MINUTE_MS,
            cooldown_5m_ms: 15 * crate::MINUTE_MS,
            cooldown_30m_ms: 30 * crate::MINUTE_MS,
            cooldown_confluence_ms: 15 * crate::MINUTE_MS,
            max_per_hour_1m: 6,
            max_per_hour_5m: 4,
            max_per_hour_30m: 2,
            max_per_hour_confluence: 3,
        }
    }
}

/// Long-window regime detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    pub window_ms: Millis,
    pub breakout_margin_pct: f64,
    /// Distance back inside the range that re-arms a breakout
    pub breakout_reset_margin_pct: f64,
    pub breakout_cooldown_ms: Millis,
    pub compress_threshold_pct: f64,
    pub compress_reset_pct: f64,
    pub mean_min_distance_pct: f64,
    pub mean_touch_band_pct: f64,
    pub anchor_outside_margin_pct: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        RegimeConfig {
            window_ms: 2 * crate::HOUR_MS,
            breakout_margin_pct: 0.15,
            breakout_reset_margin_pct: 0.10,
            breakout_cooldown_ms: 30 * crate::MINUTE_MS,
            compress_threshold_pct: 0.8,
            compress_reset_pct: 1.1,
            mean_min_distance_pct: 0.6,
            mean_touch_band_pct: 0.1,
            anchor_outside_margin_pct: 0.5,
        }
    }
}

/// Cooldown applied to one secondary kind when no pair rule matches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindCooldown {
    pub kind: AlertKind,
    pub cooldown_ms: Millis,
}

/// Cooldown between a previous secondary alert and the next one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRule {
    pub previous: AlertKind,
    pub next: AlertKind,
    pub cooldown_ms: Millis,
}

/// Secondary alert throttling and coalescing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub global_secondary_cooldown_ms: Millis,
    pub coalesce_window_ms: Millis,
    /// Fallback for kinds without an entry in `kind_cooldowns`
    pub default_kind_cooldown_ms: Millis,
    pub kind_cooldowns: Vec<KindCooldown>,
    pub pair_rules: Vec<PairRule>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            global_secondary_cooldown_ms: 2 * crate::MINUTE_MS,
            coalesce_window_ms: 30 * crate::SECOND_MS,
            default_kind_cooldown_ms: 15 * crate::MINUTE_MS,
            kind_cooldowns: vec![
                KindCooldown {
                    kind: AlertKind::Compression,
                    cooldown_ms: 30 * crate::MINUTE_MS,
                },
                KindCooldown {
                    kind: AlertKind::AnchorContext,
                    cooldown_ms: 30 * crate::MINUTE_MS,
                },
                KindCooldown {
                    kind: AlertKind::TrendChange,
                    cooldown_ms: 10 * crate::MINUTE_MS,
                },
            ],
            pair_rules: vec![
                PairRule {
                    previous: AlertKind::Compression,
                    next: AlertKind::MeanTouch,
                    cooldown_ms: 10 * crate::MINUTE_MS,
                },
                PairRule {
                    previous: AlertKind::MeanTouch,
                    next: AlertKind::Compression,
                    cooldown_ms: 10 * crate::MINUTE_MS,
                },
                PairRule {
                    previous: AlertKind::AnchorContext,
                    next: AlertKind::MeanTouch,
                    cooldown_ms: 5 * crate::MINUTE_MS,
                },
            ],
        }
    }
}

/// Anchor take-profit / max-loss bands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    pub take_profit_pct: f64,
    /// Negative percentage
    pub max_loss_pct: f64,
    pub trend_adaptive: bool,
    pub uptrend_take_profit_mult: f64,
    pub uptrend_max_loss_mult: f64,
    pub downtrend_take_profit_mult: f64,
    pub downtrend_max_loss_mult: f64,
    /// Retry spacing for band alerts whose delivery failed
    pub retry_cooldown_ms: Millis,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        AnchorConfig {
            take_profit_pct: 5.0,
            max_loss_pct: -3.0,
            trend_adaptive: true,
            uptrend_take_profit_mult: 1.3,
            uptrend_max_loss_mult: 1.2,
            downtrend_take_profit_mult: 0.8,
            downtrend_max_loss_mult: 0.8,
            retry_cooldown_ms: crate::MINUTE_MS,
        }
    }
}

/// Auto-anchor recomputation from 4h / 1d EMAs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoAnchorConfig {
    pub enabled: bool,
    pub interval_ms: Millis,
    /// Commit regardless of delta after this long without a commit
    pub force_interval_ms: Millis,
    pub min_delta_pct: f64,
    pub ema_period_4h: usize,
    pub ema_period_1d: usize,
    pub candles_4h: usize,
    pub candles_1d: usize,
    pub base_weight_4h: f64,
    pub max_weight_4h: f64,
    /// EMA divergence (in %) at which the 4h weight saturates
    pub pivot_pct: f64,
    pub fetch_timeout_ms: Millis,
    /// Consecutive failed fetches before fetching pauses
    pub breaker_failure_threshold: u32,
    /// How long fetching pauses once the breaker opens
    pub breaker_open_ms: Millis,
}

impl Default for AutoAnchorConfig {
    fn default() -> Self {
        AutoAnchorConfig {
            enabled: false,
            interval_ms: 15 * crate::MINUTE_MS,
            force_interval_ms: 6 * crate::HOUR_MS,
            min_delta_pct: 0.5,
            ema_period_4h: 20,
            ema_period_1d: 20,
            candles_4h: 60,
            candles_1d: 60,
            base_weight_4h: 0.5,
            max_weight_4h: 0.8,
            pivot_pct: 5.0,
            fetch_timeout_ms: 10 * crate::SECOND_MS,
            breaker_failure_threshold: 3,
            breaker_open_ms: crate::HOUR_MS,
        }
    }
}

/// Load/save contract for settings; implementations must be atomic
pub trait ConfigStore {
    fn load(&self) -> Result<Settings, ConfigError>;
    fn save(&self, settings: &Settings) -> Result<(), ConfigError>;
}

/// Settings stored as a JSON file; saves go through a temp file and rename
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> ConfigError {
        ConfigError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<Settings, ConfigError> {
        let contents = fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        let settings: Settings = serde_json::from_str(&contents)?;
        settings.validate()?;
        Ok(settings)
    }

    fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        settings.validate()?;
        let json = serde_json::to_string_pretty(settings)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }
}
