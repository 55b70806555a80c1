//! Alert engine
//!
//! `AlertEngine` owns every piece of detector state and turns one sample into
//! zero or more alerts. It performs no I/O: the caller delivers the alerts and
//! reports each outcome back through [`AlertEngine::report_delivery`].
//!
//! Per tick the data flows one way:
//! sample → volatility/trend → multi-timeframe → regime → anchor.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::anchor::{compute_auto_anchor, AnchorSource, AnchorTracker, AutoAnchorOutcome};
use crate::config::{ConfigError, Settings};
use crate::detector::{AlertLimiter, MultiTimeframeDetector, TimeframeInputs};
use crate::feed::FeedError;
use crate::history::{MinuteBars, PriceHistory, WindowStats};
use crate::regime::{RegimeDetector, RegimeInputs};
use crate::trend::TrendDetector;
use crate::volatility::{EffectiveThresholds, VolatilityTracker};
use crate::{Alert, AlertDraft, AlertId, AlertKind, Candle, Millis, Sample, SampleError, TrendState, MINUTE_MS};

/// Running counters, cheap to copy out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub ticks_processed: u64,
    pub ticks_rejected: u64,
    pub alerts_emitted: u64,
    pub deliveries_ok: u64,
    pub deliveries_failed: u64,
    /// Held back by a per-kind cooldown or hourly cap
    pub suppressed_by_limiter: u64,
    /// Secondary alerts blocked by the throttle matrix
    pub throttled: u64,
    /// Secondary alerts lost to a higher-priority pending one
    pub coalesced_away: u64,
    /// Pending secondaries dropped because the throttle closed before flush
    pub dropped_at_flush: u64,
}

/// Derived values of the last accepted tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickSnapshot {
    pub timestamp: Millis,
    pub price: f64,
    pub ret_1m: Option<f64>,
    pub ret_5m: Option<f64>,
    pub ret_30m: Option<f64>,
    pub ret_trend_long: Option<f64>,
    pub thresholds: EffectiveThresholds,
    pub trend: TrendState,
    pub regime: Option<WindowStats>,
}

/// Candle counts for an auto-anchor fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoAnchorRequest {
    pub candles_4h: usize,
    pub candles_1d: usize,
    pub timeout_ms: Millis,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    kind: AlertKind,
    emitted_at: Millis,
    anchor_generation: Option<u64>,
}

/// All mutable engine state
#[derive(Debug, Clone)]
pub struct EngineState {
    history: PriceHistory,
    bars: MinuteBars,
    volatility: VolatilityTracker,
    trend: TrendDetector,
    detector: MultiTimeframeDetector,
    regime: RegimeDetector,
    anchor: AnchorTracker,
    limiter: AlertLimiter,
    last_timestamp: Option<Millis>,
    last_price: Option<f64>,
    next_id: AlertId,
    in_flight: HashMap<AlertId, InFlight>,
    stats: EngineStats,
    snapshot: Option<TickSnapshot>,
}

impl EngineState {
    fn new(settings: &Settings) -> Self {
        Self {
            history: PriceHistory::new(settings.history.resolution_ms, settings.history_retention_ms()),
            bars: MinuteBars::new(settings.timeframes.volume_ema_period),
            volatility: VolatilityTracker::new(&settings.volatility),
            trend: TrendDetector::new(&settings.trend),
            detector: MultiTimeframeDetector::new(&settings.timeframes),
            regime: RegimeDetector::new(&settings.regime, &settings.throttle),
            anchor: AnchorTracker::new(&settings.anchor),
            limiter: AlertLimiter::from_settings(settings),
            last_timestamp: None,
            last_price: None,
            next_id: 1,
            in_flight: HashMap::new(),
            stats: EngineStats::default(),
            snapshot: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertEngine {
    settings: Settings,
    state: EngineState,
}

impl AlertEngine {
    pub fn new(settings: Settings) -> Self {
        let state = EngineState::new(&settings);
        Self { settings, state }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn stats(&self) -> EngineStats {
        let regime = self.state.regime.counters();
        EngineStats {
            suppressed_by_limiter: self.state.limiter.suppressed(),
            throttled: regime.throttled,
            coalesced_away: regime.coalesced_away,
            dropped_at_flush: regime.dropped_at_flush,
            ..self.state.stats
        }
    }

    pub fn last_snapshot(&self) -> Option<&TickSnapshot> {
        self.state.snapshot.as_ref()
    }

    pub fn anchor(&self) -> &AnchorTracker {
        &self.state.anchor
    }

    pub fn detector(&self) -> &MultiTimeframeDetector {
        &self.state.detector
    }

    pub fn regime(&self) -> &RegimeDetector {
        &self.state.regime
    }

    pub fn trend(&self) -> TrendState {
        self.state.trend.current()
    }

    /// Alerts emitted but not yet reported
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.len()
    }

    fn validate(&self, sample: &Sample) -> Result<(), SampleError> {
        sample.validate(self.settings.sanity.min_price, self.settings.sanity.max_price)?;
        if let Some(last) = self.state.last_timestamp {
            if sample.timestamp < last {
                return Err(SampleError::TimestampRegression {
                    timestamp: sample.timestamp,
                    last,
                });
            }
        }
        Ok(())
    }

    /// Process one sample. Invalid samples touch no detector state; they only
    /// flush the pending secondary alert.
    pub fn tick(&mut self, sample: Sample) -> Vec<Alert> {
        if let Err(e) = self.validate(&sample) {
            warn!(error = %e, "Sample rejected");
            self.state.stats.ticks_rejected += 1;
            let now = self
                .state
                .last_timestamp
                .map_or(sample.timestamp, |last| last.max(sample.timestamp));
            return self.flush_pending(now);
        }

        let now = sample.timestamp;
        let price = sample.price;
        let s = &mut self.state;
        let cfg = &self.settings;

        s.last_timestamp = Some(now);
        s.last_price = Some(price);
        s.stats.ticks_processed += 1;

        // regime statistics exclude the current sample so it can break out
        let regime_stats = s.history.window_stats(now, cfg.regime.window_ms);
        s.history.push(now, price);

        let ret_1m = s.history.return_pct(now, MINUTE_MS, price);
        let ret_5m = s.history.return_pct(now, 5 * MINUTE_MS, price);
        let ret_30m = s.history.return_pct(now, 30 * MINUTE_MS, price);
        let ret_long = s.history.return_pct(now, cfg.trend.long_window_ms, price);
        let ret_short = s.history.return_pct(now, cfg.trend.short_window_ms, price);

        for ret in s.bars.push(now, price, sample.volume) {
            s.volatility.update_window(ret);
        }
        let t = &cfg.timeframes;
        let thresholds = s
            .volatility
            .effective_thresholds(t.spike_1m_pct, t.move_5m_pct, t.move_30m_pct);

        s.trend.update(ret_long, ret_short);
        let trend = s.trend.current();
        let trend_change = s.trend.check_trend_change(now);

        let mut drafts = s.detector.evaluate(
            &TimeframeInputs {
                now,
                price,
                symbol: &cfg.instrument,
                ret_1m,
                ret_5m,
                ret_30m,
                thresholds,
                trend,
                bars: &s.bars,
            },
            &mut s.limiter,
        );

        drafts.extend(s.regime.evaluate(&RegimeInputs {
            now,
            price,
            symbol: &cfg.instrument,
            stats: regime_stats,
            anchor: s.anchor.price(),
            trend_change,
        }));

        s.anchor.update_min_max(price);
        drafts.extend(
            s.anchor
                .check_alerts(now, price, trend, &cfg.instrument, &mut s.limiter),
        );

        s.snapshot = Some(TickSnapshot {
            timestamp: now,
            price,
            ret_1m,
            ret_5m,
            ret_30m,
            ret_trend_long: ret_long,
            thresholds,
            trend,
            regime: regime_stats,
        });

        self.stamp(drafts, now)
    }

    fn stamp(&mut self, drafts: Vec<AlertDraft>, now: Millis) -> Vec<Alert> {
        let price = self.state.last_price.unwrap_or(0.0);
        let generation = self.state.anchor.generation();

        drafts
            .into_iter()
            .map(|draft| {
                let id = self.state.next_id;
                self.state.next_id += 1;
                self.state.stats.alerts_emitted += 1;

                let anchor_generation = matches!(
                    draft.kind,
                    AlertKind::AnchorTakeProfit | AlertKind::AnchorMaxLoss
                )
                .then_some(generation);
                self.state.in_flight.insert(
                    id,
                    InFlight {
                        kind: draft.kind,
                        emitted_at: now,
                        anchor_generation,
                    },
                );

                info!(id, kind = ?draft.kind, title = %draft.title, "Alert emitted");
                Alert {
                    id,
                    kind: draft.kind,
                    class: draft.kind.class(),
                    title: draft.title,
                    message: draft.message,
                    color: draft.color,
                    price,
                    timestamp: now,
                }
            })
            .collect()
    }

    /// Settle an emitted alert. Success advances the hourly counter; failure
    /// keeps only the cooldown and re-arms a one-shot anchor band.
    /// Returns false for unknown or already reported ids.
    pub fn report_delivery(&mut self, id: AlertId, delivered: bool) -> bool {
        let Some(entry) = self.state.in_flight.remove(&id) else {
            debug!(id, "Delivery report for unknown alert");
            return false;
        };

        self.state
            .limiter
            .record_delivery(entry.kind, entry.emitted_at, delivered);

        if delivered {
            self.state.stats.deliveries_ok += 1;
        } else {
            self.state.stats.deliveries_failed += 1;
            warn!(id, kind = ?entry.kind, "Alert delivery failed");
            if let Some(generation) = entry.anchor_generation {
                self.state.anchor.rearm_band(entry.kind, generation);
            }
        }
        true
    }

    /// Emit the pending secondary alert, if any and still allowed
    pub fn flush_pending(&mut self, now: Millis) -> Vec<Alert> {
        match self.state.regime.flush(now) {
            Some(draft) => self.stamp(vec![draft], now),
            None => Vec::new(),
        }
    }

    /// Set a manual anchor; `None` or an invalid price uses the last sample
    pub fn set_anchor(&mut self, price: Option<f64>, now: Millis) -> Option<f64> {
        let set = self.state.anchor.set_anchor(price, now, AnchorSource::Manual);
        if set.is_some() {
            self.state.regime.rearm_anchor_context();
        }
        set
    }

    pub fn clear_anchor(&mut self) {
        self.state.anchor.clear_anchor();
    }

    /// Swap in new settings, keeping runtime state
    pub fn reload(&mut self, settings: Settings) -> Result<(), ConfigError> {
        settings.validate()?;

        let s = &mut self.state;
        s.history
            .reconfigure(settings.history.resolution_ms, settings.history_retention_ms());
        s.bars
            .set_volume_ema_period(settings.timeframes.volume_ema_period);
        s.volatility.reconfigure(&settings.volatility);
        s.trend.reconfigure(&settings.trend);
        s.detector.reconfigure(&settings.timeframes);
        s.regime.reconfigure(&settings.regime, &settings.throttle);
        s.anchor.reconfigure(&settings.anchor);
        s.limiter.apply_settings(&settings);

        info!(instrument = %settings.instrument, "Settings reloaded");
        self.settings = settings;
        Ok(())
    }

    pub fn auto_anchor_due(&self, now: Millis, force: bool) -> bool {
        self.state
            .anchor
            .auto()
            .is_due(now, &self.settings.auto_anchor, force)
    }

    /// Start an auto-anchor recomputation when one is due
    pub fn begin_auto_anchor(&mut self, now: Millis, force: bool) -> Option<AutoAnchorRequest> {
        let cfg = &self.settings.auto_anchor;
        let auto = self.state.anchor.auto_mut();
        if !auto.is_due(now, cfg, force) {
            return None;
        }
        auto.mark_attempt(now);
        debug!(force, "Auto-anchor recomputation started");
        Some(AutoAnchorRequest {
            candles_4h: cfg.candles_4h,
            candles_1d: cfg.candles_1d,
            timeout_ms: cfg.fetch_timeout_ms,
        })
    }

    /// Finish a recomputation started by [`begin_auto_anchor`](Self::begin_auto_anchor).
    /// A failed fetch or unusable candles skip the cycle.
    pub fn complete_auto_anchor(
        &mut self,
        now: Millis,
        fetched: Result<(Vec<Candle>, Vec<Candle>), FeedError>,
    ) -> Option<AutoAnchorOutcome> {
        self.state.anchor.auto_mut().finish_attempt();

        let (candles_4h, candles_1d) = match fetched {
            Ok(candles) => candles,
            Err(e) => {
                warn!(error = %e, "Auto-anchor fetch failed, skipping cycle");
                return None;
            }
        };

        let cfg = &self.settings.auto_anchor;
        let Some(value) = compute_auto_anchor(&candles_4h, &candles_1d, cfg) else {
            warn!(
                candles_4h = candles_4h.len(),
                candles_1d = candles_1d.len(),
                "Not enough candles for auto-anchor, skipping cycle"
            );
            return None;
        };

        let outcome = self.state.anchor.apply_auto_anchor(value, now, cfg);
        if matches!(outcome, AutoAnchorOutcome::Applied(_)) {
            self.state.regime.rearm_anchor_context();
        }
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SECOND_MS;

    fn engine() -> AlertEngine {
        AlertEngine::new(Settings::default())
    }

    #[test]
    fn test_invalid_sample_leaves_state_untouched() {
        let mut e = engine();
        e.tick(Sample::new(100.0, 0));
        assert!(e.tick(Sample::new(f64::NAN, SECOND_MS)).is_empty());
        assert!(e.tick(Sample::new(-1.0, SECOND_MS)).is_empty());
        assert!(e.tick(Sample::new(100.0, 0).with_volume(f64::INFINITY)).is_empty());

        let stats = e.stats();
        assert_eq!(stats.ticks_processed, 1);
        assert_eq!(stats.ticks_rejected, 3);
        assert_eq!(e.last_snapshot().unwrap().timestamp, 0);
    }

    #[test]
    fn test_invalid_sample_flushes_pending_secondary() {
        let mut settings = Settings::default();
        settings.regime.window_ms = 10 * MINUTE_MS;
        let mut e = AlertEngine::new(settings);

        // a flat market queues a compression once the regime window is covered
        let mut t = 0;
        while e.regime().pending().is_none() {
            assert!(t <= 20 * MINUTE_MS);
            assert!(e.tick(Sample::new(100.0, t)).is_empty());
            t += 10 * SECOND_MS;
        }
        let queued_at = t - 10 * SECOND_MS;
        assert_eq!(e.regime().pending().unwrap().kind, AlertKind::Compression);

        let processed = e.stats().ticks_processed;
        let snapshot = e.last_snapshot().copied();
        let slot_1m = e.detector().slot_1m().copied();

        // still inside the coalescing window
        let alerts = e.tick(Sample::new(f64::NAN, queued_at + 5 * SECOND_MS));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Compression);
        assert!(e.regime().pending().is_none());

        let stats = e.stats();
        assert_eq!(stats.ticks_processed, processed);
        assert_eq!(stats.ticks_rejected, 1);
        assert_eq!(e.last_snapshot().copied(), snapshot);
        assert_eq!(e.detector().slot_1m().copied(), slot_1m);
    }

    #[test]
    fn test_timestamp_regression_rejected() {
        let mut e = engine();
        e.tick(Sample::new(100.0, 10 * SECOND_MS));
        e.tick(Sample::new(100.0, 5 * SECOND_MS));
        assert_eq!(e.stats().ticks_rejected, 1);
        // equal timestamps are fine
        e.tick(Sample::new(100.0, 10 * SECOND_MS));
        assert_eq!(e.stats().ticks_processed, 2);
    }

    #[test]
    fn test_alert_ids_increase_and_settle_once() {
        let mut e = engine();
        e.tick(Sample::new(100.0, 0));
        e.set_anchor(Some(100.0), 0);
        let first = e.tick(Sample::new(94.0, SECOND_MS));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, AlertKind::AnchorMaxLoss);
        assert_eq!(e.in_flight(), 1);

        assert!(e.report_delivery(first[0].id, true));
        assert!(!e.report_delivery(first[0].id, true));
        assert_eq!(e.in_flight(), 0);

        e.set_anchor(Some(100.0), 2 * MINUTE_MS);
        let second = e.tick(Sample::new(94.0, 2 * MINUTE_MS));
        assert!(second[0].id > first[0].id);
    }

    #[test]
    fn test_reload_rejects_inconsistent_settings() {
        let mut e = engine();
        let mut bad = Settings::default();
        bad.volatility.min_multiplier = 2.0;
        assert!(e.reload(bad).is_err());

        let mut good = Settings::default();
        good.timeframes.spike_1m_pct = 0.9;
        assert!(e.reload(good).is_ok());
        assert_eq!(e.settings().timeframes.spike_1m_pct, 0.9);
    }

    #[test]
    fn test_auto_anchor_fetch_failure_skips_cycle() {
        let mut settings = Settings::default();
        settings.auto_anchor.enabled = true;
        let mut e = AlertEngine::new(settings);

        assert!(e.begin_auto_anchor(0, false).is_some());
        // one fetch at a time
        assert!(e.begin_auto_anchor(0, true).is_none());

        let outcome = e.complete_auto_anchor(0, Err(FeedError::Timeout(10_000)));
        assert!(outcome.is_none());
        assert!(e.anchor().price().is_none());
        assert!(e.begin_auto_anchor(MINUTE_MS, true).is_some());
    }
}
