//! Long-window regime detection
//!
//! Watches the rolling high/low/average over the regime window for five
//! conditions. Breakouts are PRIMARY: they bypass the secondary throttle,
//! flush any pending secondary first, and keep their own cooldown. The other
//! conditions (plus trend changes) are SECONDARY: they pass the throttle
//! matrix and then wait in a single-slot coalescer.

pub mod conditions;
pub mod throttle;

pub use conditions::{AnchorContextArm, AnchorSide, BreakoutArm, CompressionArm, MeanTouchArm};
pub use throttle::{Coalescer, Offer, PendingAlert, ThrottleBlock, ThrottleMatrix, ThrottleState};

use tracing::{debug, info};

use crate::config::{RegimeConfig, ThrottleConfig};
use crate::detector::fmt_price;
use crate::history::WindowStats;
use crate::trend::TrendChange;
use crate::{AlertDraft, AlertKind, ColorTag, Millis, Symbol, TrendState};

/// Everything the regime detector reads for one tick
#[derive(Debug, Clone, Copy)]
pub struct RegimeInputs<'a> {
    pub now: Millis,
    pub price: f64,
    pub symbol: &'a Symbol,
    /// `None` until the history spans the regime window
    pub stats: Option<WindowStats>,
    pub anchor: Option<f64>,
    pub trend_change: Option<TrendChange>,
}

/// Counters for secondary alerts that never made it out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegimeCounters {
    pub throttled: u64,
    pub coalesced_away: u64,
    pub dropped_at_flush: u64,
}

#[derive(Debug, Clone)]
pub struct RegimeDetector {
    config: RegimeConfig,
    matrix: ThrottleMatrix,
    throttle: ThrottleState,
    coalescer: Coalescer,
    breakout_up: BreakoutArm,
    breakout_down: BreakoutArm,
    compression: CompressionArm,
    mean_touch: MeanTouchArm,
    anchor_context: AnchorContextArm,
    counters: RegimeCounters,
}

impl RegimeDetector {
    pub fn new(config: &RegimeConfig, throttle: &ThrottleConfig) -> Self {
        Self {
            config: config.clone(),
            matrix: ThrottleMatrix::from_config(throttle),
            throttle: ThrottleState::default(),
            coalescer: Coalescer::new(throttle.coalesce_window_ms),
            breakout_up: BreakoutArm::default(),
            breakout_down: BreakoutArm::default(),
            compression: CompressionArm::default(),
            mean_touch: MeanTouchArm::default(),
            anchor_context: AnchorContextArm::default(),
            counters: RegimeCounters::default(),
        }
    }

    pub fn reconfigure(&mut self, config: &RegimeConfig, throttle: &ThrottleConfig) {
        self.config = config.clone();
        self.matrix = ThrottleMatrix::from_config(throttle);
        self.coalescer.set_window(throttle.coalesce_window_ms);
    }

    pub fn counters(&self) -> RegimeCounters {
        self.counters
    }

    pub fn pending(&self) -> Option<&PendingAlert> {
        self.coalescer.pending()
    }

    pub fn throttle_state(&self) -> &ThrottleState {
        &self.throttle
    }

    pub fn breakout_up_armed(&self) -> bool {
        self.breakout_up.is_armed()
    }

    pub fn breakout_down_armed(&self) -> bool {
        self.breakout_down.is_armed()
    }

    pub fn compression_armed(&self) -> bool {
        self.compression.is_armed()
    }

    /// A new anchor gets a fresh anchor-context arm
    pub fn rearm_anchor_context(&mut self) {
        self.anchor_context.rearm();
    }

    pub fn evaluate(&mut self, inputs: &RegimeInputs<'_>) -> Vec<AlertDraft> {
        let now = inputs.now;
        let mut drafts = Vec::new();

        if let Some(flushed) = self.flush_expired(now) {
            drafts.push(flushed);
        }

        if let Some(stats) = inputs.stats {
            self.evaluate_breakouts(inputs, &stats, &mut drafts);
            self.evaluate_secondaries(inputs, &stats);
        }

        if let Some(change) = inputs.trend_change {
            let draft = trend_change_draft(inputs, change);
            self.offer_secondary(draft, now);
        }

        // covers a zero-length coalescing window
        if let Some(flushed) = self.flush_expired(now) {
            drafts.push(flushed);
        }

        drafts
    }

    fn evaluate_breakouts(&mut self, inputs: &RegimeInputs<'_>, stats: &WindowStats, drafts: &mut Vec<AlertDraft>) {
        let cfg = &self.config;
        let (now, price) = (inputs.now, inputs.price);

        let up = self.breakout_up.check_up(
            price,
            stats,
            cfg.breakout_margin_pct,
            cfg.breakout_reset_margin_pct,
            now,
            cfg.breakout_cooldown_ms,
        );
        let down = self.breakout_down.check_down(
            price,
            stats,
            cfg.breakout_margin_pct,
            cfg.breakout_reset_margin_pct,
            now,
            cfg.breakout_cooldown_ms,
        );

        for (hit, kind) in [(up, AlertKind::BreakoutUp), (down, AlertKind::BreakoutDown)] {
            if !hit {
                continue;
            }
            if let Some(flushed) = self.flush(now) {
                drafts.push(flushed);
            }
            match kind {
                AlertKind::BreakoutUp => self.breakout_up.fire(now),
                _ => self.breakout_down.fire(now),
            }
            info!(kind = ?kind, price, high = stats.high, low = stats.low, "Regime breakout");
            drafts.push(breakout_draft(inputs, kind, stats));
        }
    }

    fn evaluate_secondaries(&mut self, inputs: &RegimeInputs<'_>, stats: &WindowStats) {
        let now = inputs.now;
        let cfg = self.config.clone();

        if self
            .compression
            .check(stats.range_pct, cfg.compress_threshold_pct, cfg.compress_reset_pct)
        {
            let draft = AlertDraft::new(
                AlertKind::Compression,
                format!("{} range compression {:.2}%", inputs.symbol, stats.range_pct),
                format!(
                    "Range {} - {} over the regime window is below {:.2}%",
                    fmt_price(stats.low),
                    fmt_price(stats.high),
                    cfg.compress_threshold_pct
                ),
            )
            .with_color(ColorTag::Yellow);
            if self.offer_secondary(draft, now) {
                self.compression.disarm();
            }
        }

        if let Some(distance) = self.mean_touch.check(
            inputs.price,
            stats.average,
            cfg.mean_min_distance_pct,
            cfg.mean_touch_band_pct,
        ) {
            let draft = AlertDraft::new(
                AlertKind::MeanTouch,
                format!("{} back at the mean {}", inputs.symbol, fmt_price(stats.average)),
                format!(
                    "Price {} is {:.2}% from the regime average",
                    fmt_price(inputs.price),
                    distance
                ),
            )
            .with_color(ColorTag::Blue);
            if self.offer_secondary(draft, now) {
                self.mean_touch.disarm();
            }
        }

        if let Some(anchor) = inputs.anchor {
            if let Some(side) = self
                .anchor_context
                .check(anchor, stats, cfg.anchor_outside_margin_pct)
            {
                let where_ = match side {
                    AnchorSide::Above => "above",
                    AnchorSide::Below => "below",
                };
                let draft = AlertDraft::new(
                    AlertKind::AnchorContext,
                    format!("{} anchor {} {} the range", inputs.symbol, fmt_price(anchor), where_),
                    format!(
                        "Regime range {} - {}, price {}",
                        fmt_price(stats.low),
                        fmt_price(stats.high),
                        fmt_price(inputs.price)
                    ),
                )
                .with_color(ColorTag::Purple);
                if self.offer_secondary(draft, now) {
                    self.anchor_context.disarm();
                }
            }
        }
    }

    /// Throttle, then coalesce. Returns false when the throttle blocked it.
    /// The caller disarms on true; an alert lost to coalescing stays handled,
    /// one dropped at flush re-arms its condition.
    fn offer_secondary(&mut self, draft: AlertDraft, now: Millis) -> bool {
        let kind = draft.kind;
        if let Err(block) = self.throttle.check(&self.matrix, kind, now) {
            debug!(kind = ?kind, block = ?block, "Secondary alert throttled");
            self.counters.throttled += 1;
            return false;
        }
        match self.coalescer.offer(draft, now) {
            Offer::Queued => {}
            Offer::Replaced { .. } | Offer::Dropped { .. } => self.counters.coalesced_away += 1,
        }
        true
    }

    fn rearm(&mut self, kind: AlertKind) {
        match kind {
            AlertKind::Compression => self.compression.rearm(),
            AlertKind::MeanTouch => self.mean_touch.rearm(),
            AlertKind::AnchorContext => self.anchor_context.rearm(),
            _ => {}
        }
    }

    fn flush_expired(&mut self, now: Millis) -> Option<AlertDraft> {
        let pending = self.coalescer.take_expired(now)?;
        self.release(pending, now)
    }

    /// Emit the pending secondary now, if the throttle still allows it
    pub fn flush(&mut self, now: Millis) -> Option<AlertDraft> {
        let pending = self.coalescer.take()?;
        self.release(pending, now)
    }

    fn release(&mut self, pending: PendingAlert, now: Millis) -> Option<AlertDraft> {
        if let Err(block) = self.throttle.check(&self.matrix, pending.kind, now) {
            debug!(kind = ?pending.kind, block = ?block, "Pending secondary dropped at flush");
            self.counters.dropped_at_flush += 1;
            self.rearm(pending.kind);
            return None;
        }
        self.throttle.record(pending.kind, now);
        info!(kind = ?pending.kind, waited_ms = now.saturating_sub(pending.created_at), "Secondary alert released");
        Some(pending.draft)
    }
}

fn breakout_draft(inputs: &RegimeInputs<'_>, kind: AlertKind, stats: &WindowStats) -> AlertDraft {
    let (edge, color) = match kind {
        AlertKind::BreakoutUp => (stats.high, ColorTag::Green),
        _ => (stats.low, ColorTag::Red),
    };
    AlertDraft::new(
        kind,
        format!("{} {} {}", inputs.symbol, kind.label(), fmt_price(inputs.price)),
        format!(
            "Price left the regime range {} - {} (edge {})",
            fmt_price(stats.low),
            fmt_price(stats.high),
            fmt_price(edge)
        ),
    )
    .with_color(color)
}

fn trend_change_draft(inputs: &RegimeInputs<'_>, change: TrendChange) -> AlertDraft {
    let color = match change.to {
        TrendState::Up => ColorTag::Green,
        TrendState::Down => ColorTag::Red,
        TrendState::Sideways => ColorTag::Orange,
    };
    AlertDraft::new(
        AlertKind::TrendChange,
        format!("{} trend {} -> {}", inputs.symbol, change.from, change.to),
        format!("Price {}", fmt_price(inputs.price)),
    )
    .with_color(color)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KindCooldown;
    use crate::{HOUR_MS, MINUTE_MS};

    fn stats(high: f64, low: f64, average: f64) -> WindowStats {
        WindowStats {
            high,
            low,
            average,
            range_pct: (high - low) / low * 100.0,
        }
    }

    fn detector() -> RegimeDetector {
        RegimeDetector::new(&RegimeConfig::default(), &ThrottleConfig::default())
    }

    fn inputs(symbol: &Symbol, now: Millis, price: f64, stats: Option<WindowStats>) -> RegimeInputs<'_> {
        RegimeInputs {
            now,
            price,
            symbol,
            stats,
            anchor: None,
            trend_change: None,
        }
    }

    #[test]
    fn test_secondary_waits_for_coalesce_window() {
        let symbol = Symbol::new("BTCUSDT");
        let mut rd = detector();
        // range 0.5% < 0.8% → compression
        let s = stats(100.25, 99.75, 100.0);

        assert!(rd.evaluate(&inputs(&symbol, 0, 100.0, Some(s))).is_empty());
        assert_eq!(rd.pending().map(|p| p.kind), Some(AlertKind::Compression));

        let out = rd.evaluate(&inputs(&symbol, 30_000, 100.0, Some(s)));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, AlertKind::Compression);
        assert_eq!(rd.throttle_state().last_kind(), Some(AlertKind::Compression));
    }

    #[test]
    fn test_breakout_flushes_pending_first() {
        let symbol = Symbol::new("BTCUSDT");
        let mut rd = detector();
        let s = stats(100.25, 99.75, 100.0);

        rd.evaluate(&inputs(&symbol, 0, 100.0, Some(s)));
        assert!(rd.pending().is_some());

        let out = rd.evaluate(&inputs(&symbol, 5_000, 100.5, Some(s)));
        let kinds: Vec<_> = out.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![AlertKind::Compression, AlertKind::BreakoutUp]);
        assert!(!rd.breakout_up_armed());
    }

    #[test]
    fn test_trend_change_outranks_pending() {
        let symbol = Symbol::new("BTCUSDT");
        let mut rd = detector();
        let s = stats(100.25, 99.75, 100.0);
        rd.evaluate(&inputs(&symbol, 0, 100.0, Some(s)));

        let mut with_change = inputs(&symbol, 10_000, 100.0, Some(s));
        with_change.trend_change = Some(TrendChange {
            from: TrendState::Sideways,
            to: TrendState::Up,
        });
        rd.evaluate(&with_change);
        assert_eq!(rd.pending().map(|p| p.kind), Some(AlertKind::TrendChange));
        assert_eq!(rd.counters().coalesced_away, 1);

        let out = rd.evaluate(&inputs(&symbol, 30_000, 100.0, Some(s)));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, AlertKind::TrendChange);
    }

    #[test]
    fn test_flush_drops_when_throttled() {
        let symbol = Symbol::new("BTCUSDT");
        let mut rd = RegimeDetector::new(
            &RegimeConfig::default(),
            &ThrottleConfig {
                coalesce_window_ms: 0,
                ..ThrottleConfig::default()
            },
        );

        // zero window: released on the same tick
        let s = stats(100.25, 99.75, 100.0);
        let out = rd.evaluate(&inputs(&symbol, 0, 100.0, Some(s)));
        assert_eq!(out.len(), 1);

        // a trend change 1 minute later hits the global cooldown
        let mut with_change = inputs(&symbol, MINUTE_MS, 100.0, None);
        with_change.trend_change = Some(TrendChange {
            from: TrendState::Sideways,
            to: TrendState::Down,
        });
        assert!(rd.evaluate(&with_change).is_empty());
        assert_eq!(rd.counters().throttled, 1);
        assert!(rd.flush(MINUTE_MS).is_none());
    }

    #[test]
    fn test_condition_rearms_when_dropped_at_flush() {
        let symbol = Symbol::new("BTCUSDT");
        let mut rd = detector();
        let narrow = stats(100.25, 99.75, 100.0);
        let wide = stats(100.75, 99.25, 100.0);

        rd.evaluate(&inputs(&symbol, 0, 100.0, Some(narrow)));
        assert_eq!(rd.evaluate(&inputs(&symbol, 30_000, 100.0, Some(narrow))).len(), 1);
        assert!(!rd.compression_armed());

        // widen past the reset level, then squeeze again after the kind cooldown
        rd.evaluate(&inputs(&symbol, 35 * MINUTE_MS, 100.0, Some(wide)));
        assert!(rd.compression_armed());
        rd.evaluate(&inputs(&symbol, 40 * MINUTE_MS, 100.0, Some(narrow)));
        assert_eq!(rd.pending().map(|p| p.kind), Some(AlertKind::Compression));
        assert!(!rd.compression_armed());

        // a longer kind cooldown arrives before the window elapses
        rd.reconfigure(
            &RegimeConfig::default(),
            &ThrottleConfig {
                kind_cooldowns: vec![KindCooldown {
                    kind: AlertKind::Compression,
                    cooldown_ms: 2 * HOUR_MS,
                }],
                ..ThrottleConfig::default()
            },
        );
        let out = rd.evaluate(&inputs(&symbol, 40 * MINUTE_MS + 30_000, 100.0, None));
        assert!(out.is_empty());
        assert_eq!(rd.counters().dropped_at_flush, 1);
        assert!(rd.compression_armed());
    }

    #[test]
    fn test_no_conditions_without_history() {
        let symbol = Symbol::new("BTCUSDT");
        let mut rd = detector();
        assert!(rd.evaluate(&inputs(&symbol, 0, 100.0, None)).is_empty());
        assert!(rd.pending().is_none());
    }
}
