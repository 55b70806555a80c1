//! Rolling price history and 1-minute bars
//!
//! `PriceHistory` keeps time-bucketed closes for the longest window any
//! component needs and answers look-back questions (returns, high/low/average).
//! `MinuteBars` aggregates samples into 1-minute OHLCV bars; completed bars feed
//! the volatility window and the volume EMA, and the most recent bars back the
//! volume/range confirmation gates.

use itertools::{Itertools, MinMaxResult};
use std::collections::VecDeque;
use tracing::debug;

use crate::indicators::{pct_change, range_pct, StreamingEma};
use crate::{Millis, MINUTE_MS};

/// Longest gap (in minutes) back-filled with flat bars
pub const MAX_GAP_FILL_MINUTES: u64 = 30;

/// Completed bars kept for the gates (the longest gate spans 30 bars)
const BAR_CAPACITY: usize = 30;

// =============================================================================
// Price history
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
struct Bucket {
    timestamp: Millis,
    high: f64,
    low: f64,
    close: f64,
}

/// High/low/average over a look-back window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub high: f64,
    pub low: f64,
    pub average: f64,
    pub range_pct: f64,
}

#[derive(Debug, Clone)]
pub struct PriceHistory {
    buckets: VecDeque<Bucket>,
    resolution_ms: Millis,
    retention_ms: Millis,
}

impl PriceHistory {
    pub fn new(resolution_ms: Millis, retention_ms: Millis) -> Self {
        let capacity = (retention_ms / resolution_ms.max(1)).min(16_384) as usize;
        Self {
            buckets: VecDeque::with_capacity(capacity + 1),
            resolution_ms: resolution_ms.max(1),
            retention_ms,
        }
    }

    pub fn reconfigure(&mut self, resolution_ms: Millis, retention_ms: Millis) {
        self.resolution_ms = resolution_ms.max(1);
        self.retention_ms = retention_ms;
    }

    pub fn push(&mut self, timestamp: Millis, price: f64) {
        match self.buckets.back_mut() {
            Some(last) if timestamp.saturating_sub(last.timestamp) < self.resolution_ms => {
                last.high = last.high.max(price);
                last.low = last.low.min(price);
                last.close = price;
            }
            _ => self.buckets.push_back(Bucket {
                timestamp,
                high: price,
                low: price,
                close: price,
            }),
        }
        self.prune(timestamp);
    }

    /// Drop buckets past retention, keeping one at or before the cutoff so a
    /// full-window look-back still has a reference price.
    fn prune(&mut self, now: Millis) {
        let cutoff = now.saturating_sub(self.retention_ms);
        while self.buckets.len() >= 2 && self.buckets[1].timestamp <= cutoff {
            self.buckets.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn latest(&self) -> Option<f64> {
        self.buckets.back().map(|b| b.close)
    }

    /// True once the oldest retained sample is at least `window` old
    pub fn covers(&self, now: Millis, window: Millis) -> bool {
        match self.buckets.front() {
            Some(front) => now >= window && front.timestamp <= now - window,
            None => false,
        }
    }

    pub fn price_at_or_before(&self, timestamp: Millis) -> Option<f64> {
        let idx = self.buckets.partition_point(|b| b.timestamp <= timestamp);
        idx.checked_sub(1).map(|i| self.buckets[i].close)
    }

    /// Signed return of `current` against the price `window` ago
    pub fn return_pct(&self, now: Millis, window: Millis, current: f64) -> Option<f64> {
        if !self.covers(now, window) {
            return None;
        }
        let reference = self.price_at_or_before(now - window)?;
        pct_change(reference, current)
    }

    /// High/low/average over the window; `None` until the window is covered
    pub fn window_stats(&self, now: Millis, window: Millis) -> Option<WindowStats> {
        if !self.covers(now, window) {
            return None;
        }

        let cutoff = now - window;
        let recent = || self.buckets.iter().filter(move |b| b.timestamp >= cutoff);

        let (low, high) = match recent().flat_map(|b| [b.low, b.high]).minmax() {
            MinMaxResult::NoElements => return None,
            MinMaxResult::OneElement(p) => (p, p),
            MinMaxResult::MinMax(lo, hi) => (lo, hi),
        };

        let (sum, count) = recent().fold((0.0, 0usize), |(sum, n), b| (sum + b.close, n + 1));
        let average = sum / count as f64;

        Some(WindowStats {
            high,
            low,
            average,
            range_pct: range_pct(high, low)?,
        })
    }
}

// =============================================================================
// Minute bars
// =============================================================================

/// One 1-minute OHLCV bar
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinuteBar {
    pub minute: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub has_volume: bool,
}

impl MinuteBar {
    fn open_at(minute: u64, price: f64, volume: Option<f64>) -> Self {
        Self {
            minute,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: volume.unwrap_or(0.0),
            has_volume: volume.is_some(),
        }
    }

    /// Flat bar carrying the previous close through a feed gap
    fn flat(minute: u64, close: f64, has_volume: bool) -> Self {
        Self {
            minute,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
            has_volume,
        }
    }

    fn absorb(&mut self, price: f64, volume: Option<f64>) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        if let Some(v) = volume {
            self.volume += v;
            self.has_volume = true;
        }
    }
}

/// Range and volume of the most recent bars, with the volume baseline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarWindow {
    pub bars: usize,
    pub range_pct: f64,
    /// `None` when no bar in the window carried volume
    pub volume: Option<f64>,
    /// Per-bar volume EMA; `None` until warmed up
    pub baseline: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct MinuteBars {
    forming: Option<MinuteBar>,
    completed: VecDeque<MinuteBar>,
    volume_ema: StreamingEma,
}

impl MinuteBars {
    pub fn new(volume_ema_period: usize) -> Self {
        Self {
            forming: None,
            completed: VecDeque::with_capacity(BAR_CAPACITY),
            volume_ema: StreamingEma::new(volume_ema_period),
        }
    }

    /// Restart the volume baseline if its period changed
    pub fn set_volume_ema_period(&mut self, period: usize) {
        if self.volume_ema.period() != period {
            self.volume_ema = StreamingEma::new(period);
        }
    }

    /// Feed a sample; returns the 1-minute close-to-close returns of every bar
    /// the sample completed (including flat gap bars).
    pub fn push(&mut self, timestamp: Millis, price: f64, volume: Option<f64>) -> Vec<f64> {
        let minute = timestamp / MINUTE_MS;

        let current = match self.forming.as_mut() {
            Some(bar) if minute <= bar.minute => {
                bar.absorb(price, volume);
                return Vec::new();
            }
            Some(bar) => *bar,
            None => {
                self.forming = Some(MinuteBar::open_at(minute, price, volume));
                return Vec::new();
            }
        };

        let mut returns = Vec::new();
        self.complete(current, &mut returns);

        let gap = minute - current.minute - 1;
        if gap > 0 {
            let filled = gap.min(MAX_GAP_FILL_MINUTES);
            debug!(gap_minutes = gap, filled, "Back-filling feed gap with flat bars");
            for m in (minute - filled)..minute {
                self.complete(MinuteBar::flat(m, current.close, current.has_volume), &mut returns);
            }
        }

        self.forming = Some(MinuteBar::open_at(minute, price, volume));
        returns
    }

    fn complete(&mut self, bar: MinuteBar, returns: &mut Vec<f64>) {
        if let Some(ret) = self.completed.back().and_then(|prev| pct_change(prev.close, bar.close)) {
            returns.push(ret);
        }
        if bar.has_volume {
            self.volume_ema.next(bar.volume);
        }
        if self.completed.len() == BAR_CAPACITY {
            self.completed.pop_front();
        }
        self.completed.push_back(bar);
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    pub fn volume_baseline(&self) -> Option<f64> {
        self.volume_ema.value()
    }

    /// The forming bar plus the preceding completed bars, `bars` in total.
    /// `None` until that many bars exist.
    pub fn window(&self, bars: usize) -> Option<BarWindow> {
        let forming = self.forming.as_ref()?;
        if bars == 0 || self.completed.len() + 1 < bars {
            return None;
        }

        let previous = self.completed.iter().rev().take(bars - 1);
        let in_window = || std::iter::once(forming).chain(previous.clone());

        let (low, high) = match in_window().flat_map(|b| [b.low, b.high]).minmax() {
            MinMaxResult::NoElements => return None,
            MinMaxResult::OneElement(p) => (p, p),
            MinMaxResult::MinMax(lo, hi) => (lo, hi),
        };

        let volume = in_window()
            .filter(|b| b.has_volume)
            .map(|b| b.volume)
            .fold(None, |acc: Option<f64>, v| Some(acc.unwrap_or(0.0) + v));

        Some(BarWindow {
            bars,
            range_pct: range_pct(high, low)?,
            volume,
            baseline: self.volume_ema.value(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn filled(prices: &[(Millis, f64)]) -> PriceHistory {
        let mut history = PriceHistory::new(1_000, 10 * MINUTE_MS);
        for &(ts, p) in prices {
            history.push(ts, p);
        }
        history
    }

    #[test]
    fn test_return_requires_coverage() {
        let history = filled(&[(0, 100.0), (30_000, 100.5)]);
        assert_eq!(history.return_pct(30_000, MINUTE_MS, 100.5), None);

        let history = filled(&[(0, 100.0), (30_000, 100.5), (60_000, 101.0)]);
        assert_relative_eq!(
            history.return_pct(60_000, MINUTE_MS, 101.0).unwrap(),
            1.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_buckets_merge_within_resolution() {
        let mut history = PriceHistory::new(1_000, MINUTE_MS);
        history.push(0, 100.0);
        history.push(400, 102.0);
        history.push(900, 99.0);
        assert_eq!(history.len(), 1);
        assert_eq!(history.latest(), Some(99.0));
    }

    #[test]
    fn test_prune_keeps_reference_point() {
        let mut history = PriceHistory::new(1_000, MINUTE_MS);
        for i in 0..=180 {
            history.push(i * 1_000, 100.0 + i as f64 * 0.01);
        }
        assert!(history.covers(180_000, MINUTE_MS));
        assert!(history.len() <= 62);
        assert!(history.return_pct(180_000, MINUTE_MS, 101.8).is_some());
    }

    #[test]
    fn test_window_stats() {
        let history = filled(&[(0, 100.0), (60_000, 102.0), (120_000, 98.0), (180_000, 100.0)]);
        let stats = history.window_stats(180_000, 3 * MINUTE_MS).unwrap();
        assert_relative_eq!(stats.high, 102.0);
        assert_relative_eq!(stats.low, 98.0);
        assert_relative_eq!(stats.average, 100.0);
        assert_relative_eq!(stats.range_pct, 4.0 / 98.0 * 100.0, epsilon = 1e-9);

        assert!(history.window_stats(180_000, 5 * MINUTE_MS).is_none());
    }

    #[test]
    fn test_minute_bars_emit_returns() {
        let mut bars = MinuteBars::new(3);
        assert!(bars.push(0, 100.0, Some(1.0)).is_empty());
        assert!(bars.push(30_000, 100.5, Some(1.0)).is_empty());

        // first completed bar has no predecessor
        assert!(bars.push(60_000, 101.0, Some(4.0)).is_empty());
        assert_eq!(bars.completed_len(), 1);

        let returns = bars.push(120_000, 101.0, None);
        assert_eq!(returns.len(), 1);
        assert_relative_eq!(returns[0], (101.0 - 100.5) / 100.5 * 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_gap_filled_with_flat_bars() {
        let mut bars = MinuteBars::new(3);
        bars.push(0, 100.0, None);
        bars.push(60_000, 100.0, None);
        // minutes 2..=4 missing
        let returns = bars.push(5 * MINUTE_MS, 101.0, None);
        assert_eq!(bars.completed_len(), 5);
        assert_eq!(returns.len(), 4);
        assert!(returns.iter().all(|r| r.abs() < 1e-12));
    }

    #[test]
    fn test_gap_fill_is_capped() {
        let mut bars = MinuteBars::new(3);
        bars.push(0, 100.0, None);
        let returns = bars.push(200 * MINUTE_MS, 100.0, None);
        assert_eq!(returns.len(), MAX_GAP_FILL_MINUTES as usize);
        assert_eq!(bars.completed_len(), BAR_CAPACITY);
    }

    #[test]
    fn test_window_volume_and_baseline() {
        let mut bars = MinuteBars::new(2);
        bars.push(0, 100.0, Some(10.0));
        bars.push(MINUTE_MS, 100.0, Some(10.0));
        bars.push(2 * MINUTE_MS, 100.0, Some(10.0));
        bars.push(2 * MINUTE_MS + 10_000, 100.3, Some(20.0));

        let window = bars.window(1).unwrap();
        assert_relative_eq!(window.volume.unwrap(), 30.0);
        assert_relative_eq!(window.range_pct, 0.3, epsilon = 1e-9);
        assert_relative_eq!(window.baseline.unwrap(), 10.0, epsilon = 1e-9);

        let window = bars.window(3).unwrap();
        assert_relative_eq!(window.volume.unwrap(), 50.0);
        assert!(bars.window(5).is_none());
    }

    #[test]
    fn test_window_without_volume() {
        let mut bars = MinuteBars::new(2);
        bars.push(0, 100.0, None);
        let window = bars.window(1).unwrap();
        assert_eq!(window.volume, None);
        assert_eq!(window.baseline, None);
    }
}
