//! Arm/disarm state for each regime condition
//!
//! A condition fires only while armed. Firing disarms it, and it re-arms only
//! after price retreats past a looser bound, so a price hovering at the
//! trigger level cannot flap.

use crate::history::WindowStats;
use crate::indicators::distance_pct;
use crate::Millis;

/// Breakout above the rolling high (or below the rolling low)
#[derive(Debug, Clone)]
pub struct BreakoutArm {
    armed: bool,
    last_fired: Option<Millis>,
}

impl Default for BreakoutArm {
    fn default() -> Self {
        Self {
            armed: true,
            last_fired: None,
        }
    }
}

impl BreakoutArm {
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    fn cooled_down(&self, now: Millis, cooldown_ms: Millis) -> bool {
        self.last_fired
            .map_or(true, |last| now.saturating_sub(last) >= cooldown_ms)
    }

    /// Upside: re-arm below `high × (1 − reset)`, hit above `high × (1 + margin)`
    pub fn check_up(&mut self, price: f64, stats: &WindowStats, margin_pct: f64, reset_pct: f64, now: Millis, cooldown_ms: Millis) -> bool {
        if !self.armed && price < stats.high * (1.0 - reset_pct / 100.0) {
            self.armed = true;
        }
        self.armed && price > stats.high * (1.0 + margin_pct / 100.0) && self.cooled_down(now, cooldown_ms)
    }

    /// Downside: re-arm above `low × (1 + reset)`, hit below `low × (1 − margin)`
    pub fn check_down(&mut self, price: f64, stats: &WindowStats, margin_pct: f64, reset_pct: f64, now: Millis, cooldown_ms: Millis) -> bool {
        if !self.armed && price > stats.low * (1.0 + reset_pct / 100.0) {
            self.armed = true;
        }
        self.armed && price < stats.low * (1.0 - margin_pct / 100.0) && self.cooled_down(now, cooldown_ms)
    }

    pub fn fire(&mut self, now: Millis) {
        self.armed = false;
        self.last_fired = Some(now);
    }
}

/// Rolling range squeezed below a threshold
#[derive(Debug, Clone)]
pub struct CompressionArm {
    armed: bool,
}

impl Default for CompressionArm {
    fn default() -> Self {
        Self { armed: true }
    }
}

impl CompressionArm {
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn check(&mut self, range_pct: f64, threshold_pct: f64, reset_pct: f64) -> bool {
        if !self.armed && range_pct > reset_pct {
            self.armed = true;
        }
        self.armed && range_pct < threshold_pct
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn rearm(&mut self) {
        self.armed = true;
    }
}

/// Price returning to the rolling average after being far from it
#[derive(Debug, Clone)]
pub struct MeanTouchArm {
    armed: bool,
    was_far: bool,
}

impl Default for MeanTouchArm {
    fn default() -> Self {
        Self {
            armed: true,
            was_far: false,
        }
    }
}

impl MeanTouchArm {
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn was_far(&self) -> bool {
        self.was_far
    }

    /// Returns the distance from the mean when the touch condition holds
    pub fn check(&mut self, price: f64, average: f64, min_distance_pct: f64, band_pct: f64) -> Option<f64> {
        let distance = distance_pct(price, average)?;

        if distance >= min_distance_pct {
            self.was_far = true;
        }
        if !self.armed && distance > 2.0 * band_pct {
            self.armed = true;
        }

        (self.armed && self.was_far && distance <= band_pct).then_some(distance)
    }

    pub fn disarm(&mut self) {
        self.armed = false;
        self.was_far = false;
    }

    /// Undo a disarm whose alert never went out
    pub fn rearm(&mut self) {
        self.armed = true;
        self.was_far = true;
    }
}

/// Where the anchor sits relative to the rolling range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorSide {
    Above,
    Below,
}

/// Anchor price outside the rolling range by a margin
#[derive(Debug, Clone)]
pub struct AnchorContextArm {
    armed: bool,
}

impl Default for AnchorContextArm {
    fn default() -> Self {
        Self { armed: true }
    }
}

impl AnchorContextArm {
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn check(&mut self, anchor: f64, stats: &WindowStats, margin_pct: f64) -> Option<AnchorSide> {
        if !self.armed && anchor >= stats.low && anchor <= stats.high {
            self.armed = true;
        }
        if !self.armed {
            return None;
        }

        if anchor > stats.high * (1.0 + margin_pct / 100.0) {
            Some(AnchorSide::Above)
        } else if anchor < stats.low * (1.0 - margin_pct / 100.0) {
            Some(AnchorSide::Below)
        } else {
            None
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// A new anchor starts with a fresh arm
    pub fn rearm(&mut self) {
        self.armed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(high: f64, low: f64) -> WindowStats {
        WindowStats {
            high,
            low,
            average: (high + low) / 2.0,
            range_pct: (high - low) / low * 100.0,
        }
    }

    #[test]
    fn test_breakout_hysteresis() {
        let s = stats(100.0, 98.0);
        let mut arm = BreakoutArm::default();

        // margin 0.15% → trigger above 100.15
        assert!(!arm.check_up(100.10, &s, 0.15, 0.10, 0, 0));
        assert!(arm.check_up(100.20, &s, 0.15, 0.10, 0, 0));
        arm.fire(0);

        // hovering around the trigger level does not re-fire
        for p in [100.10, 100.20, 99.95, 100.30] {
            assert!(!arm.check_up(p, &s, 0.15, 0.10, 1, 0));
        }
        // back below 99.90 re-arms
        assert!(!arm.check_up(99.80, &s, 0.15, 0.10, 2, 0));
        assert!(arm.is_armed());
        assert!(arm.check_up(100.20, &s, 0.15, 0.10, 3, 0));
    }

    #[test]
    fn test_breakout_cooldown() {
        let s = stats(100.0, 98.0);
        let mut arm = BreakoutArm::default();
        assert!(arm.check_down(97.5, &s, 0.15, 0.10, 0, 1_000));
        arm.fire(0);
        assert!(!arm.check_down(98.5, &s, 0.15, 0.10, 10, 1_000));
        assert!(arm.is_armed());
        assert!(!arm.check_down(97.5, &s, 0.15, 0.10, 500, 1_000));
        assert!(arm.check_down(97.5, &s, 0.15, 0.10, 1_000, 1_000));
    }

    #[test]
    fn test_compression_rearm() {
        let mut arm = CompressionArm::default();
        assert!(arm.check(0.5, 0.8, 1.1));
        arm.disarm();
        assert!(!arm.check(0.5, 0.8, 1.1));
        assert!(!arm.check(1.0, 0.8, 1.1));
        assert!(!arm.check(1.2, 0.8, 1.1));
        assert!(arm.check(0.7, 0.8, 1.1));
    }

    #[test]
    fn test_mean_touch_needs_excursion() {
        let mut arm = MeanTouchArm::default();
        assert!(arm.check(100.05, 100.0, 0.6, 0.1).is_none());
        assert!(arm.check(100.7, 100.0, 0.6, 0.1).is_none());
        assert!(arm.was_far());
        assert!(arm.check(100.05, 100.0, 0.6, 0.1).is_some());
        arm.disarm();
        assert!(!arm.was_far());
        // re-armed past twice the band but still needs a fresh excursion
        assert!(arm.check(100.25, 100.0, 0.6, 0.1).is_none());
        assert!(arm.is_armed());
        assert!(arm.check(100.05, 100.0, 0.6, 0.1).is_none());
    }

    #[test]
    fn test_anchor_context() {
        let s = stats(100.0, 98.0);
        let mut arm = AnchorContextArm::default();
        assert_eq!(arm.check(99.0, &s, 0.5), None);
        assert_eq!(arm.check(100.6, &s, 0.5), Some(AnchorSide::Above));
        arm.disarm();
        assert_eq!(arm.check(100.6, &s, 0.5), None);
        assert_eq!(arm.check(99.0, &s, 0.5), None);
        assert!(arm.is_armed());
        assert_eq!(arm.check(97.0, &s, 0.5), Some(AnchorSide::Below));
    }
}
