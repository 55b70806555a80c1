//! Volatility-adaptive threshold scaling
//!
//! Keeps a rolling window of 1-minute returns. When enough returns have been
//! seen, the sample standard deviation relative to a configured baseline
//! widens or narrows the spike/move thresholds within a clamped band.

use std::collections::VecDeque;

use crate::config::VolatilityConfig;
use crate::indicators::sample_std_dev;

/// Hard cap on the number of 1-minute returns retained
pub const MAX_WINDOW_MINUTES: usize = 240;

/// Thresholds after volatility scaling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveThresholds {
    pub spike_1m: f64,
    pub move_5m: f64,
    pub move_30m: f64,
    pub vol_factor: f64,
}

impl EffectiveThresholds {
    /// Base thresholds with a neutral factor
    pub fn unscaled(spike_1m: f64, move_5m: f64, move_30m: f64) -> Self {
        Self {
            spike_1m,
            move_5m,
            move_30m,
            vol_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VolatilityTracker {
    returns: VecDeque<f64>,
    capacity: usize,
    baseline_std_pct: f64,
    min_multiplier: f64,
    max_multiplier: f64,
}

impl VolatilityTracker {
    pub fn new(config: &VolatilityConfig) -> Self {
        let capacity = config.window_minutes.clamp(1, MAX_WINDOW_MINUTES);
        Self {
            returns: VecDeque::with_capacity(capacity),
            capacity,
            baseline_std_pct: config.baseline_std_pct,
            min_multiplier: config.min_multiplier,
            max_multiplier: config.max_multiplier,
        }
    }

    /// Apply new settings, keeping the most recent returns that still fit
    pub fn reconfigure(&mut self, config: &VolatilityConfig) {
        self.capacity = config.window_minutes.clamp(1, MAX_WINDOW_MINUTES);
        self.baseline_std_pct = config.baseline_std_pct;
        self.min_multiplier = config.min_multiplier;
        self.max_multiplier = config.max_multiplier;
        while self.returns.len() > self.capacity {
            self.returns.pop_front();
        }
    }

    pub fn update_window(&mut self, ret: f64) {
        if !ret.is_finite() {
            return;
        }
        if self.returns.len() == self.capacity {
            self.returns.pop_front();
        }
        self.returns.push_back(ret);
    }

    pub fn len(&self) -> usize {
        self.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.returns.is_empty()
    }

    /// At least 10 returns, or 10% of the window when the window is small
    pub fn is_ready(&self) -> bool {
        let tenth = (self.capacity as f64 * 0.1).ceil() as usize;
        self.returns.len() >= 10.min(tenth.max(2))
    }

    /// Clamped scaling factor; 1.0 until ready or when degenerate
    pub fn factor(&self) -> f64 {
        if !self.is_ready() {
            return 1.0;
        }
        let Some(std_dev) = sample_std_dev(self.returns.iter()) else {
            return 1.0;
        };
        let raw = std_dev / self.baseline_std_pct;
        if !raw.is_finite() {
            return 1.0;
        }
        raw.clamp(self.min_multiplier, self.max_multiplier)
    }

    pub fn effective_thresholds(&self, base_1m: f64, base_5m: f64, base_30m: f64) -> EffectiveThresholds {
        let factor = self.factor();
        let sqrt_factor = factor.sqrt();

        EffectiveThresholds {
            spike_1m: scaled_or_base(base_1m, factor),
            move_5m: scaled_or_base(base_5m, sqrt_factor),
            move_30m: scaled_or_base(base_30m, sqrt_factor),
            vol_factor: factor,
        }
    }
}

fn scaled_or_base(base: f64, factor: f64) -> f64 {
    let scaled = base * factor;
    if scaled.is_finite() && scaled > 0.0 {
        scaled
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tracker() -> VolatilityTracker {
        VolatilityTracker::new(&VolatilityConfig::default())
    }

    #[test]
    fn test_neutral_until_ready() {
        let mut vt = tracker();
        for _ in 0..5 {
            vt.update_window(1.0);
            vt.update_window(-1.0);
        }
        // 10 returns with the default 60-minute window: ready at 6
        assert!(vt.is_ready());

        let mut vt = tracker();
        for r in [1.0, -1.0, 1.0] {
            vt.update_window(r);
        }
        assert!(!vt.is_ready());
        let t = vt.effective_thresholds(0.5, 1.0, 2.0);
        assert_relative_eq!(t.vol_factor, 1.0);
        assert_relative_eq!(t.spike_1m, 0.5);
        assert_relative_eq!(t.move_30m, 2.0);
    }

    #[test]
    fn test_factor_clamped_high() {
        let mut vt = tracker();
        for i in 0..30 {
            vt.update_window(if i % 2 == 0 { 2.0 } else { -2.0 });
        }
        let t = vt.effective_thresholds(0.5, 1.0, 2.0);
        assert_relative_eq!(t.vol_factor, 1.6);
        assert_relative_eq!(t.spike_1m, 0.8, epsilon = 1e-12);
        assert_relative_eq!(t.move_5m, 1.6_f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(t.move_30m, 2.0 * 1.6_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_factor_clamped_low() {
        let mut vt = tracker();
        for _ in 0..30 {
            vt.update_window(0.0);
        }
        // zero dispersion clamps to the minimum multiplier
        let t = vt.effective_thresholds(0.5, 1.0, 2.0);
        assert_relative_eq!(t.vol_factor, 0.7);
        assert_relative_eq!(t.spike_1m, 0.35, epsilon = 1e-12);
    }

    #[test]
    fn test_window_capped() {
        let mut vt = VolatilityTracker::new(&VolatilityConfig {
            window_minutes: 1_000,
            ..VolatilityConfig::default()
        });
        for _ in 0..500 {
            vt.update_window(0.1);
        }
        assert_eq!(vt.len(), MAX_WINDOW_MINUTES);
    }

    #[test]
    fn test_non_finite_returns_ignored() {
        let mut vt = tracker();
        vt.update_window(f64::NAN);
        vt.update_window(f64::INFINITY);
        assert!(vt.is_empty());
    }
}
