//! Anchor (entry price) tracking
//!
//! Holds the reference price, the min/max seen since it was set, and the
//! one-shot take-profit / max-loss flags. Bands adapt to the current trend.
//! The auto-anchor is a blend of 4h and 1d EMAs, committed only when it moved
//! enough or has gone stale.

use tracing::{debug, info, warn};

use crate::config::{AnchorConfig, AutoAnchorConfig};
use crate::detector::{fmt_price, AlertLimiter};
use crate::indicators::{last_ema, pct_change};
use crate::{AlertDraft, AlertKind, Candle, ColorTag, Millis, Symbol, TrendState};

/// Clamp range for the effective max-loss band (percent)
pub const MAX_LOSS_CLAMP: (f64, f64) = (-6.0, -1.0);
/// Clamp range for the effective take-profit band (percent)
pub const TAKE_PROFIT_CLAMP: (f64, f64) = (2.0, 10.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorSource {
    Manual,
    Auto,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnchorState {
    pub price: f64,
    pub source: AnchorSource,
    pub set_at: Millis,
    pub since_max: f64,
    pub since_min: f64,
    pub take_profit_sent: bool,
    pub max_loss_sent: bool,
    /// Bumped on every new anchor so late delivery reports can be matched
    pub generation: u64,
}

/// Take-profit / max-loss percentages in effect
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorBands {
    pub take_profit_pct: f64,
    pub max_loss_pct: f64,
}

/// Trend-scaled, clamped bands
pub fn effective_bands(trend: TrendState, config: &AnchorConfig) -> AnchorBands {
    let (tp_mult, ml_mult) = match (config.trend_adaptive, trend) {
        (true, TrendState::Up) => (config.uptrend_take_profit_mult, config.uptrend_max_loss_mult),
        (true, TrendState::Down) => (config.downtrend_take_profit_mult, config.downtrend_max_loss_mult),
        _ => (1.0, 1.0),
    };

    AnchorBands {
        take_profit_pct: (config.take_profit_pct * tp_mult).clamp(TAKE_PROFIT_CLAMP.0, TAKE_PROFIT_CLAMP.1),
        max_loss_pct: (config.max_loss_pct * ml_mult).clamp(MAX_LOSS_CLAMP.0, MAX_LOSS_CLAMP.1),
    }
}

/// Weighted blend of the 4h and 1d EMAs. The 4h weight grows with their
/// divergence and saturates at `pivot_pct`.
pub fn blend_auto_anchor(ema_4h: f64, ema_1d: f64, config: &AutoAnchorConfig) -> Option<f64> {
    if !(ema_4h.is_finite() && ema_1d.is_finite()) || ema_4h <= 0.0 || ema_1d <= 0.0 {
        return None;
    }
    let divergence = (ema_4h - ema_1d).abs() / ema_1d * 100.0;
    let t = (divergence / config.pivot_pct).min(1.0);
    let weight_4h = config.base_weight_4h + (config.max_weight_4h - config.base_weight_4h) * t;
    let value = weight_4h * ema_4h + (1.0 - weight_4h) * ema_1d;
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Auto-anchor value from fetched candles; invalid candles are skipped
pub fn compute_auto_anchor(candles_4h: &[Candle], candles_1d: &[Candle], config: &AutoAnchorConfig) -> Option<f64> {
    let closes = |candles: &[Candle]| -> Vec<f64> {
        candles.iter().filter(|c| c.is_valid()).map(|c| c.close).collect()
    };
    let ema_4h = last_ema(&closes(candles_4h), config.ema_period_4h)?;
    let ema_1d = last_ema(&closes(candles_1d), config.ema_period_1d)?;
    blend_auto_anchor(ema_4h, ema_1d, config)
}

/// Interval-gated recomputation bookkeeping
#[derive(Debug, Clone, Default)]
pub struct AutoAnchorState {
    pub last_value: Option<f64>,
    pub last_update: Option<Millis>,
    last_attempt: Option<Millis>,
    in_flight: bool,
}

impl AutoAnchorState {
    pub fn is_due(&self, now: Millis, config: &AutoAnchorConfig, force: bool) -> bool {
        if !config.enabled || self.in_flight {
            return false;
        }
        force
            || self
                .last_attempt
                .map_or(true, |t| now.saturating_sub(t) >= config.interval_ms)
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn mark_attempt(&mut self, now: Millis) {
        self.last_attempt = Some(now);
        self.in_flight = true;
    }

    pub fn finish_attempt(&mut self) {
        self.in_flight = false;
    }

    /// Commit past the minimum delta, or unconditionally once stale
    pub fn should_commit(&self, value: f64, now: Millis, config: &AutoAnchorConfig) -> bool {
        let Some(last) = self.last_value else {
            return true;
        };
        let stale = self
            .last_update
            .map_or(true, |t| now.saturating_sub(t) >= config.force_interval_ms);
        let moved = pct_change(last, value).is_some_and(|d| d.abs() >= config.min_delta_pct);
        moved || stale
    }

    pub fn commit(&mut self, value: f64, now: Millis) {
        self.last_value = Some(value);
        self.last_update = Some(now);
    }
}

/// What happened to a computed auto-anchor value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AutoAnchorOutcome {
    /// Committed and now the active anchor
    Applied(f64),
    /// Committed, but a manual anchor stays in effect
    Recorded(f64),
    /// Below the minimum delta and not stale
    Skipped,
}

#[derive(Debug, Clone)]
pub struct AnchorTracker {
    config: AnchorConfig,
    state: Option<AnchorState>,
    last_valid_price: Option<f64>,
    generation: u64,
    auto: AutoAnchorState,
}

impl AnchorTracker {
    pub fn new(config: &AnchorConfig) -> Self {
        Self {
            config: config.clone(),
            state: None,
            last_valid_price: None,
            generation: 0,
            auto: AutoAnchorState::default(),
        }
    }

    pub fn reconfigure(&mut self, config: &AnchorConfig) {
        self.config = config.clone();
    }

    pub fn state(&self) -> Option<&AnchorState> {
        self.state.as_ref()
    }

    pub fn price(&self) -> Option<f64> {
        self.state.as_ref().map(|s| s.price)
    }

    pub fn auto(&self) -> &AutoAnchorState {
        &self.auto
    }

    pub fn auto_mut(&mut self) -> &mut AutoAnchorState {
        &mut self.auto
    }

    /// Set a new anchor. An invalid or missing price falls back to the last
    /// valid sample; returns the anchor actually set.
    pub fn set_anchor(&mut self, price: Option<f64>, now: Millis, source: AnchorSource) -> Option<f64> {
        let price = match price.filter(|p| p.is_finite() && *p > 0.0) {
            Some(p) => p,
            None => {
                let fallback = self.last_valid_price?;
                debug!(fallback, "Anchor price missing or invalid, using last price");
                fallback
            }
        };

        self.generation += 1;
        self.state = Some(AnchorState {
            price,
            source,
            set_at: now,
            since_max: price,
            since_min: price,
            take_profit_sent: false,
            max_loss_sent: false,
            generation: self.generation,
        });
        info!(price, source = ?source, "Anchor set");
        Some(price)
    }

    pub fn clear_anchor(&mut self) {
        if self.state.take().is_some() {
            info!("Anchor cleared");
        }
    }

    /// Record an accepted sample price
    pub fn update_min_max(&mut self, price: f64) {
        self.last_valid_price = Some(price);
        if let Some(state) = self.state.as_mut() {
            state.since_max = state.since_max.max(price);
            state.since_min = state.since_min.min(price);
        }
    }

    /// One-shot band alerts for the current anchor
    pub fn check_alerts(
        &mut self,
        now: Millis,
        price: f64,
        trend: TrendState,
        symbol: &Symbol,
        limiter: &mut AlertLimiter,
    ) -> Vec<AlertDraft> {
        let bands = effective_bands(trend, &self.config);
        let Some(state) = self.state.as_mut() else {
            return Vec::new();
        };
        let Some(pnl) = pct_change(state.price, price) else {
            return Vec::new();
        };

        let mut drafts = Vec::new();

        if !state.take_profit_sent
            && pnl >= bands.take_profit_pct
            && limiter.try_acquire(AlertKind::AnchorTakeProfit, now).is_ok()
        {
            state.take_profit_sent = true;
            info!(pnl, band = bands.take_profit_pct, "Take-profit band reached");
            drafts.push(
                AlertDraft::new(
                    AlertKind::AnchorTakeProfit,
                    format!("{} take profit {:+.2}%", symbol, pnl),
                    format!(
                        "Price {} vs anchor {} (band {:+.2}%, trend {}, high since anchor {})",
                        fmt_price(price),
                        fmt_price(state.price),
                        bands.take_profit_pct,
                        trend,
                        fmt_price(state.since_max)
                    ),
                )
                .with_color(ColorTag::Green),
            );
        }

        if !state.max_loss_sent
            && pnl <= bands.max_loss_pct
            && limiter.try_acquire(AlertKind::AnchorMaxLoss, now).is_ok()
        {
            state.max_loss_sent = true;
            warn!(pnl, band = bands.max_loss_pct, "Max-loss band reached");
            drafts.push(
                AlertDraft::new(
                    AlertKind::AnchorMaxLoss,
                    format!("{} max loss {:+.2}%", symbol, pnl),
                    format!(
                        "Price {} vs anchor {} (band {:+.2}%, trend {}, low since anchor {})",
                        fmt_price(price),
                        fmt_price(state.price),
                        bands.max_loss_pct,
                        trend,
                        fmt_price(state.since_min)
                    ),
                )
                .with_color(ColorTag::Red),
            );
        }

        drafts
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Re-arm a band whose alert was not delivered, if the anchor is unchanged
    pub fn rearm_band(&mut self, kind: AlertKind, generation: u64) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        if state.generation != generation {
            return;
        }
        match kind {
            AlertKind::AnchorTakeProfit => state.take_profit_sent = false,
            AlertKind::AnchorMaxLoss => state.max_loss_sent = false,
            _ => {}
        }
    }

    /// Apply a freshly computed auto-anchor value. A manual anchor stays in
    /// effect; the value is still recorded for the next comparison.
    pub fn apply_auto_anchor(&mut self, value: f64, now: Millis, config: &AutoAnchorConfig) -> AutoAnchorOutcome {
        if !self.auto.should_commit(value, now, config) {
            debug!(value, last = ?self.auto.last_value, "Auto-anchor change below minimum delta");
            return AutoAnchorOutcome::Skipped;
        }
        self.auto.commit(value, now);

        let manual = matches!(
            self.state.as_ref().map(|s| s.source),
            Some(AnchorSource::Manual)
        );
        if manual {
            info!(value, "Auto-anchor recorded, manual anchor kept");
            return AutoAnchorOutcome::Recorded(value);
        }

        self.set_anchor(Some(value), now, AnchorSource::Auto);
        AutoAnchorOutcome::Applied(value)
    }
}
