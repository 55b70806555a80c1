//! Multi-timeframe spike/move detection
//!
//! Evaluates three rules every tick:
//! - 1m spike, confirmed by a same-direction 5m return
//! - 5m move, confirmed by a same-direction 30m return
//! - 30m move, confirmed by a same-direction 5m return
//!
//! Qualifying 1m and 5m events are kept in one slot each. When a fresh
//! event lands and both slots agree with each other and with the trend, a
//! single confluence alert replaces the two individual ones. Repeats of the
//! individual kinds are gated by the limiter alone.

pub mod limits;

pub use limits::{AlertLimiter, LimitRule, Suppression};

use tracing::{debug, info};

use crate::config::TimeframeConfig;
use crate::history::{BarWindow, MinuteBars};
use crate::volatility::EffectiveThresholds;
use crate::{AlertDraft, AlertKind, Direction, Millis, Symbol, TrendState};

/// Most recent qualifying event of one timeframe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeframeEvent {
    pub direction: Direction,
    pub timestamp: Millis,
    pub magnitude: f64,
    pub used_in_confluence: bool,
    /// An individual alert was emitted for this event
    pub alerted: bool,
}

/// Slot holding at most one event
#[derive(Debug, Clone, Default)]
pub struct EventSlot {
    event: Option<TimeframeEvent>,
}

impl EventSlot {
    pub fn get(&self) -> Option<&TimeframeEvent> {
        self.event.as_ref()
    }

    /// Every qualifying detection replaces the slot with a fresh event
    pub fn record(&mut self, direction: Direction, now: Millis, magnitude: f64) {
        self.event = Some(TimeframeEvent {
            direction,
            timestamp: now,
            magnitude,
            used_in_confluence: false,
            alerted: false,
        });
    }

    fn get_mut(&mut self) -> Option<&mut TimeframeEvent> {
        self.event.as_mut()
    }
}

/// Everything the detector reads for one tick
#[derive(Debug, Clone, Copy)]
pub struct TimeframeInputs<'a> {
    pub now: Millis,
    pub price: f64,
    pub symbol: &'a Symbol,
    pub ret_1m: Option<f64>,
    pub ret_5m: Option<f64>,
    pub ret_30m: Option<f64>,
    pub thresholds: EffectiveThresholds,
    pub trend: TrendState,
    pub bars: &'a MinuteBars,
}

/// Primary return past its threshold, confirming return past its own, same sign
pub fn qualifies(primary: Option<f64>, threshold: f64, confirm: Option<f64>, confirm_threshold: f64) -> Option<Direction> {
    let (primary, confirm) = (primary?, confirm?);
    let direction = Direction::of(primary)?;
    let same_sign = Direction::of(confirm) == Some(direction);
    (primary.abs() >= threshold && confirm.abs() >= confirm_threshold && same_sign).then_some(direction)
}

/// Volume/range confirmation. Without volume data (or before the baseline
/// warms up) the outcome is the `require_volume_confirmation` policy.
pub fn volume_gate(window: Option<BarWindow>, min_range_pct: f64, volume_multiplier: f64, require_volume: bool) -> bool {
    let Some(window) = window else {
        return !require_volume;
    };
    match (window.volume, window.baseline) {
        (Some(volume), Some(baseline)) => {
            window.range_pct > min_range_pct && volume > volume_multiplier * baseline * window.bars as f64
        }
        _ => !require_volume,
    }
}

#[derive(Debug, Clone)]
pub struct MultiTimeframeDetector {
    config: TimeframeConfig,
    slot_1m: EventSlot,
    slot_5m: EventSlot,
    last_volume_event: Option<Millis>,
}

impl MultiTimeframeDetector {
    pub fn new(config: &TimeframeConfig) -> Self {
        Self {
            config: config.clone(),
            slot_1m: EventSlot::default(),
            slot_5m: EventSlot::default(),
            last_volume_event: None,
        }
    }

    pub fn reconfigure(&mut self, config: &TimeframeConfig) {
        self.config = config.clone();
    }

    pub fn slot_1m(&self) -> Option<&TimeframeEvent> {
        self.slot_1m.get()
    }

    pub fn slot_5m(&self) -> Option<&TimeframeEvent> {
        self.slot_5m.get()
    }

    fn gate(&self, bars: &MinuteBars, count: usize, min_range_pct: f64) -> bool {
        volume_gate(
            bars.window(count),
            min_range_pct,
            self.config.volume_multiplier,
            self.config.require_volume_confirmation,
        )
    }

    pub fn evaluate(&mut self, inputs: &TimeframeInputs<'_>, limiter: &mut AlertLimiter) -> Vec<AlertDraft> {
        let cfg = &self.config;
        let now = inputs.now;
        let thr = &inputs.thresholds;

        let spike = qualifies(inputs.ret_1m, thr.spike_1m, inputs.ret_5m, cfg.confirm_5m_for_1m_pct);
        let move_5m = qualifies(inputs.ret_5m, thr.move_5m, inputs.ret_30m, cfg.confirm_30m_for_5m_pct);
        let move_30m = qualifies(inputs.ret_30m, thr.move_30m, inputs.ret_5m, cfg.confirm_5m_for_30m_pct);

        let gate_1m = self.gate(inputs.bars, 1, cfg.min_range_1m_pct);
        let gate_5m = self.gate(inputs.bars, 5, cfg.min_range_5m_pct);
        let gate_30m = self.gate(inputs.bars, 30, cfg.min_range_30m_pct);

        let fresh_1m = match spike {
            Some(direction) if gate_1m => {
                let magnitude = inputs.ret_1m.map_or(0.0, f64::abs);
                self.slot_1m.record(direction, now, magnitude);
                true
            }
            Some(direction) => {
                debug!(?direction, "1m spike failed volume/range gate");
                false
            }
            None => false,
        };
        let fresh_5m = match move_5m {
            Some(direction) if gate_5m => {
                let magnitude = inputs.ret_5m.map_or(0.0, f64::abs);
                self.slot_5m.record(direction, now, magnitude);
                true
            }
            Some(direction) => {
                debug!(?direction, "5m move failed volume/range gate");
                false
            }
            None => false,
        };

        let mut drafts = Vec::new();

        if fresh_1m || fresh_5m {
            if let Some(draft) = self.check_confluence(inputs, gate_5m, limiter) {
                drafts.push(draft);
            }
        }

        if fresh_1m {
            if let Some(draft) = self.individual(AlertKind::Spike1m, inputs, limiter) {
                drafts.push(draft);
            }
        }
        if fresh_5m {
            if let Some(draft) = self.individual(AlertKind::Move5m, inputs, limiter) {
                drafts.push(draft);
            }
        }

        match move_30m {
            Some(direction) if gate_30m => {
                if limiter.try_acquire(AlertKind::Move30m, now).is_ok() {
                    self.last_volume_event = Some(now);
                    let ret = inputs.ret_30m.unwrap_or(0.0);
                    drafts.push(move_draft(AlertKind::Move30m, direction, ret, inputs));
                }
            }
            Some(direction) => debug!(?direction, "30m move failed volume/range gate"),
            None => {}
        }

        drafts
    }

    fn check_confluence(
        &mut self,
        inputs: &TimeframeInputs<'_>,
        gate_5m: bool,
        limiter: &mut AlertLimiter,
    ) -> Option<AlertDraft> {
        let now = inputs.now;
        let (e1, e5) = (*self.slot_1m.get()?, *self.slot_5m.get()?);

        let consumed = |e: &TimeframeEvent| e.used_in_confluence || e.alerted;
        if e1.direction != e5.direction || consumed(&e1) || consumed(&e5) {
            return None;
        }
        if e1.timestamp.abs_diff(e5.timestamp) > self.config.confluence_window_ms {
            return None;
        }
        if !inputs.trend.agrees_with(e1.direction) {
            debug!(direction = ?e1.direction, trend = %inputs.trend, "Confluence blocked by trend");
            return None;
        }
        if !gate_5m {
            return None;
        }
        if let Some(last) = self.last_volume_event {
            if now.saturating_sub(last) < self.config.volume_event_cooldown_ms {
                debug!("Confluence inside volume event cooldown");
                return None;
            }
        }
        limiter.try_acquire(AlertKind::Confluence, now).ok()?;
        limiter.start_cooldown(AlertKind::Spike1m, now);
        limiter.start_cooldown(AlertKind::Move5m, now);

        for ev in [self.slot_1m.get_mut(), self.slot_5m.get_mut()].into_iter().flatten() {
            ev.used_in_confluence = true;
        }
        self.last_volume_event = Some(now);

        info!(
            direction = ?e1.direction,
            mag_1m = e1.magnitude,
            mag_5m = e5.magnitude,
            "Confluence detected"
        );

        let direction = e1.direction;
        Some(
            AlertDraft::new(
                AlertKind::Confluence,
                format!("{} {} confluence {}", inputs.symbol, direction.label(), fmt_price(inputs.price)),
                format!(
                    "1m {:+.2}% and 5m {:+.2}% agree, trend {}",
                    signed(e1.magnitude, direction),
                    signed(e5.magnitude, direction),
                    inputs.trend
                ),
            )
            .with_color(direction.color()),
        )
    }

    fn individual(&mut self, kind: AlertKind, inputs: &TimeframeInputs<'_>, limiter: &mut AlertLimiter) -> Option<AlertDraft> {
        let (slot, ret) = match kind {
            AlertKind::Spike1m => (&mut self.slot_1m, inputs.ret_1m),
            _ => (&mut self.slot_5m, inputs.ret_5m),
        };
        let ev = slot.get_mut()?;
        if ev.used_in_confluence || ev.alerted {
            return None;
        }
        limiter.try_acquire(kind, inputs.now).ok()?;
        ev.alerted = true;
        let direction = ev.direction;
        self.last_volume_event = Some(inputs.now);
        Some(move_draft(kind, direction, ret.unwrap_or(0.0), inputs))
    }
}

fn move_draft(kind: AlertKind, direction: Direction, ret: f64, inputs: &TimeframeInputs<'_>) -> AlertDraft {
    AlertDraft::new(
        kind,
        format!("{} {} {} {:+.2}%", inputs.symbol, kind.label(), direction.label(), ret),
        format!(
            "Price {} (1m {}, 5m {}, 30m {}), vol factor {:.2}",
            fmt_price(inputs.price),
            fmt_ret(inputs.ret_1m),
            fmt_ret(inputs.ret_5m),
            fmt_ret(inputs.ret_30m),
            inputs.thresholds.vol_factor
        ),
    )
    .with_color(direction.color())
}

fn signed(magnitude: f64, direction: Direction) -> f64 {
    match direction {
        Direction::Up => magnitude,
        Direction::Down => -magnitude,
    }
}

fn fmt_ret(ret: Option<f64>) -> String {
    ret.map_or_else(|| "n/a".to_string(), |r| format!("{:+.2}%", r))
}

pub(crate) fn fmt_price(price: f64) -> String {
    if price >= 100.0 {
        format!("{:.2}", price)
    } else {
        format!("{:.4}", price)
    }
}
