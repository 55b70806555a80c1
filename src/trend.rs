//! Trend detection with debounced change notification

use tracing::debug;

use crate::config::TrendConfig;
use crate::{Millis, TrendState};

/// Up needs the long return past the threshold and a non-negative short
/// return; Down mirrors it. Anything else is Sideways.
pub fn determine_trend(ret_long: f64, ret_short: f64, threshold: f64) -> TrendState {
    if ret_long >= threshold && ret_short >= 0.0 {
        TrendState::Up
    } else if ret_long <= -threshold && ret_short <= 0.0 {
        TrendState::Down
    } else {
        TrendState::Sideways
    }
}

/// A trend transition worth notifying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrendChange {
    pub from: TrendState,
    pub to: TrendState,
}

#[derive(Debug, Clone, Default)]
pub struct TrendDetector {
    current: TrendState,
    previous: TrendState,
    last_notified: Option<Millis>,
    history_ready: bool,
    threshold_pct: f64,
    change_cooldown_ms: Millis,
}

impl TrendDetector {
    pub fn new(config: &TrendConfig) -> Self {
        Self {
            threshold_pct: config.threshold_pct,
            change_cooldown_ms: config.change_cooldown_ms,
            ..Self::default()
        }
    }

    pub fn reconfigure(&mut self, config: &TrendConfig) {
        self.threshold_pct = config.threshold_pct;
        self.change_cooldown_ms = config.change_cooldown_ms;
    }

    pub fn current(&self) -> TrendState {
        self.current
    }

    pub fn previous(&self) -> TrendState {
        self.previous
    }

    /// True once both look-back returns have been backed by real history
    pub fn history_ready(&self) -> bool {
        self.history_ready
    }

    /// Recompute the trend; without both returns the state is left alone
    pub fn update(&mut self, ret_long: Option<f64>, ret_short: Option<f64>) {
        match (ret_long, ret_short) {
            (Some(long), Some(short)) => {
                self.current = determine_trend(long, short, self.threshold_pct);
                self.history_ready = true;
            }
            _ => self.history_ready = false,
        }
    }

    /// Report a transition when it differs from the last evaluated state and
    /// the cooldown has elapsed. `previous` always catches up afterwards.
    pub fn check_trend_change(&mut self, now: Millis) -> Option<TrendChange> {
        let from = self.previous;
        let to = self.current;
        self.previous = self.current;

        if from == to || !self.history_ready {
            return None;
        }

        if let Some(last) = self.last_notified {
            if now.saturating_sub(last) < self.change_cooldown_ms {
                debug!(%from, %to, "Trend change inside cooldown, not notified");
                return None;
            }
        }

        self.last_notified = Some(now);
        Some(TrendChange { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MINUTE_MS;

    #[test]
    fn test_determine_trend() {
        assert_eq!(determine_trend(1.5, 0.1, 1.3), TrendState::Up);
        assert_eq!(determine_trend(1.3, 0.0, 1.3), TrendState::Up);
        assert_eq!(determine_trend(1.5, -0.1, 1.3), TrendState::Sideways);
        assert_eq!(determine_trend(-1.4, -0.2, 1.3), TrendState::Down);
        assert_eq!(determine_trend(-1.4, 0.2, 1.3), TrendState::Sideways);
        assert_eq!(determine_trend(0.5, 0.5, 1.3), TrendState::Sideways);
    }

    #[test]
    fn test_change_notified_once() {
        let mut td = TrendDetector::new(&TrendConfig::default());
        td.update(Some(2.0), Some(0.5));
        let change = td.check_trend_change(0).unwrap();
        assert_eq!(change.from, TrendState::Sideways);
        assert_eq!(change.to, TrendState::Up);

        td.update(Some(2.0), Some(0.5));
        assert!(td.check_trend_change(MINUTE_MS).is_none());
    }

    #[test]
    fn test_change_inside_cooldown_is_swallowed() {
        let mut td = TrendDetector::new(&TrendConfig::default());
        td.update(Some(2.0), Some(0.5));
        assert!(td.check_trend_change(0).is_some());

        td.update(Some(0.0), Some(0.0));
        assert!(td.check_trend_change(MINUTE_MS).is_none());
        // previous caught up, so the swallowed change is not replayed
        assert_eq!(td.previous(), TrendState::Sideways);
        assert!(td.check_trend_change(20 * MINUTE_MS).is_none());

        td.update(Some(-2.0), Some(-0.5));
        let change = td.check_trend_change(21 * MINUTE_MS).unwrap();
        assert_eq!(change.to, TrendState::Down);
    }

    #[test]
    fn test_no_change_without_history() {
        let mut td = TrendDetector::new(&TrendConfig::default());
        td.update(Some(2.0), None);
        assert_eq!(td.current(), TrendState::Sideways);
        assert!(td.check_trend_change(0).is_none());
    }
}
