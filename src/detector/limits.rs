//! Per-kind cooldown and rolling hourly cap
//!
//! Cooldowns run from the last emission attempt. The hourly cap counts
//! delivered alerts over a rolling hour, plus alerts still awaiting their
//! delivery report so a burst cannot overshoot the cap.

use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::config::Settings;
use crate::{AlertKind, Millis, HOUR_MS};

/// Cooldown and cap for one alert kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitRule {
    pub cooldown_ms: Millis,
    /// `None` for no hourly cap
    pub max_per_hour: Option<u32>,
}

impl LimitRule {
    pub fn new(cooldown_ms: Millis, max_per_hour: u32) -> Self {
        Self {
            cooldown_ms,
            max_per_hour: Some(max_per_hour),
        }
    }

    pub fn cooldown_only(cooldown_ms: Millis) -> Self {
        Self {
            cooldown_ms,
            max_per_hour: None,
        }
    }
}

/// Why an alert was held back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    Cooldown { remaining_ms: Millis },
    HourlyCap { count: u32, max: u32 },
}

#[derive(Debug, Clone, Default)]
struct KindLimit {
    last_attempt: Option<Millis>,
    /// Emission times of delivered alerts inside the rolling hour
    delivered: VecDeque<Millis>,
    reserved: u32,
}

impl KindLimit {
    fn prune(&mut self, now: Millis) {
        while let Some(&front) = self.delivered.front() {
            if now.saturating_sub(front) >= HOUR_MS {
                self.delivered.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlertLimiter {
    rules: HashMap<AlertKind, LimitRule>,
    state: HashMap<AlertKind, KindLimit>,
    suppressed: u64,
}

impl AlertLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules for the timeframe kinds and the anchor band retries
    pub fn from_settings(settings: &Settings) -> Self {
        let mut limiter = Self::new();
        limiter.apply_settings(settings);
        limiter
    }

    /// Replace the rules; runtime counters are kept
    pub fn apply_settings(&mut self, settings: &Settings) {
        let t = &settings.timeframes;
        self.set_rule(AlertKind::Spike1m, LimitRule::new(t.cooldown_1m_ms, t.max_per_hour_1m));
        self.set_rule(AlertKind::Move5m, LimitRule::new(t.cooldown_5m_ms, t.max_per_hour_5m));
        self.set_rule(AlertKind::Move30m, LimitRule::new(t.cooldown_30m_ms, t.max_per_hour_30m));
        self.set_rule(
            AlertKind::Confluence,
            LimitRule::new(t.cooldown_confluence_ms, t.max_per_hour_confluence),
        );

        let retry = LimitRule::cooldown_only(settings.anchor.retry_cooldown_ms);
        self.set_rule(AlertKind::AnchorTakeProfit, retry);
        self.set_rule(AlertKind::AnchorMaxLoss, retry);
    }

    pub fn set_rule(&mut self, kind: AlertKind, rule: LimitRule) {
        self.rules.insert(kind, rule);
    }

    pub fn rule(&self, kind: AlertKind) -> Option<LimitRule> {
        self.rules.get(&kind).copied()
    }

    /// Kinds without a rule always pass
    pub fn check(&mut self, kind: AlertKind, now: Millis) -> Result<(), Suppression> {
        let Some(rule) = self.rules.get(&kind).copied() else {
            return Ok(());
        };
        let state = self.state.entry(kind).or_default();
        state.prune(now);

        if let Some(last) = state.last_attempt {
            let elapsed = now.saturating_sub(last);
            if elapsed < rule.cooldown_ms {
                return Err(Suppression::Cooldown {
                    remaining_ms: rule.cooldown_ms - elapsed,
                });
            }
        }

        if let Some(max) = rule.max_per_hour {
            let count = state.delivered.len() as u32 + state.reserved;
            if count >= max {
                return Err(Suppression::HourlyCap { count, max });
            }
        }

        Ok(())
    }

    /// Mark an emission attempt; the alert holds a cap slot until reported
    pub fn reserve(&mut self, kind: AlertKind, now: Millis) {
        let state = self.state.entry(kind).or_default();
        state.last_attempt = Some(now);
        state.reserved += 1;
    }

    /// Start the cooldown without taking a cap slot
    pub fn start_cooldown(&mut self, kind: AlertKind, now: Millis) {
        if self.rules.contains_key(&kind) {
            self.state.entry(kind).or_default().last_attempt = Some(now);
        }
    }

    /// `check` then `reserve`
    pub fn try_acquire(&mut self, kind: AlertKind, now: Millis) -> Result<(), Suppression> {
        match self.check(kind, now) {
            Ok(()) => {
                self.reserve(kind, now);
                Ok(())
            }
            Err(reason) => {
                debug!(kind = ?kind, reason = ?reason, "Alert suppressed by limiter");
                self.suppressed += 1;
                Err(reason)
            }
        }
    }

    /// Settle a reservation. Delivered alerts count toward the hourly cap from
    /// their emission time; failed ones only keep the cooldown.
    pub fn record_delivery(&mut self, kind: AlertKind, emitted_at: Millis, delivered: bool) {
        let Some(state) = self.state.get_mut(&kind) else {
            return;
        };
        state.reserved = state.reserved.saturating_sub(1);
        if delivered {
            let idx = state.delivered.partition_point(|&t| t <= emitted_at);
            state.delivered.insert(idx, emitted_at);
        }
    }

    pub fn delivered_in_last_hour(&mut self, kind: AlertKind, now: Millis) -> usize {
        let state = self.state.entry(kind).or_default();
        state.prune(now);
        state.delivered.len()
    }

    /// Alerts held back since start
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    pub fn last_attempt(&self, kind: AlertKind) -> Option<Millis> {
        self.state.get(&kind).and_then(|s| s.last_attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MINUTE_MS;

    fn limiter() -> AlertLimiter {
        let mut l = AlertLimiter::new();
        l.set_rule(AlertKind::Spike1m, LimitRule::new(5 * MINUTE_MS, 3));
        l
    }

    #[test]
    fn test_cooldown_from_last_attempt() {
        let mut l = limiter();
        assert!(l.try_acquire(AlertKind::Spike1m, 0).is_ok());
        l.record_delivery(AlertKind::Spike1m, 0, false);

        // failed delivery still holds the cooldown
        assert_eq!(
            l.check(AlertKind::Spike1m, MINUTE_MS),
            Err(Suppression::Cooldown {
                remaining_ms: 4 * MINUTE_MS
            })
        );
        assert!(l.check(AlertKind::Spike1m, 5 * MINUTE_MS).is_ok());
    }

    #[test]
    fn test_rolling_hourly_cap() {
        let mut l = AlertLimiter::new();
        l.set_rule(AlertKind::Move5m, LimitRule::new(MINUTE_MS, 2));

        for t in [0, 10 * MINUTE_MS] {
            assert!(l.try_acquire(AlertKind::Move5m, t).is_ok());
            l.record_delivery(AlertKind::Move5m, t, true);
        }
        assert!(matches!(
            l.check(AlertKind::Move5m, 20 * MINUTE_MS),
            Err(Suppression::HourlyCap { count: 2, max: 2 })
        ));
        // the first delivery rolls out of the hour
        assert!(l.check(AlertKind::Move5m, HOUR_MS).is_ok());
        assert_eq!(l.delivered_in_last_hour(AlertKind::Move5m, HOUR_MS), 1);
    }

    #[test]
    fn test_failed_delivery_releases_cap_slot() {
        let mut l = AlertLimiter::new();
        l.set_rule(AlertKind::Move30m, LimitRule::new(0, 1));

        assert!(l.try_acquire(AlertKind::Move30m, 0).is_ok());
        // pending reservation counts against the cap
        assert!(l.check(AlertKind::Move30m, 1).is_err());

        l.record_delivery(AlertKind::Move30m, 0, false);
        assert!(l.check(AlertKind::Move30m, 1).is_ok());
        assert_eq!(l.delivered_in_last_hour(AlertKind::Move30m, 1), 0);
    }

    #[test]
    fn test_started_cooldown_holds_no_cap_slot() {
        let mut l = AlertLimiter::new();
        l.set_rule(AlertKind::Spike1m, LimitRule::new(5 * MINUTE_MS, 1));

        l.start_cooldown(AlertKind::Spike1m, 0);
        assert!(matches!(
            l.check(AlertKind::Spike1m, MINUTE_MS),
            Err(Suppression::Cooldown { .. })
        ));
        assert!(l.try_acquire(AlertKind::Spike1m, 5 * MINUTE_MS).is_ok());

        l.start_cooldown(AlertKind::Compression, 0);
        assert_eq!(l.last_attempt(AlertKind::Compression), None);
    }

    #[test]
    fn test_unruled_kind_passes() {
        let mut l = limiter();
        for t in 0..5 {
            assert!(l.try_acquire(AlertKind::Compression, t).is_ok());
        }
        assert!(l.try_acquire(AlertKind::Spike1m, 0).is_ok());
        assert!(l.try_acquire(AlertKind::Spike1m, 1).is_err());
        assert_eq!(l.suppressed(), 1);
    }

    #[test]
    fn test_rules_from_settings() {
        let settings = Settings::default();
        let l = AlertLimiter::from_settings(&settings);
        assert_eq!(
            l.rule(AlertKind::Spike1m),
            Some(LimitRule::new(5 * MINUTE_MS, 6))
        );
        assert_eq!(
            l.rule(AlertKind::AnchorMaxLoss),
            Some(LimitRule::cooldown_only(MINUTE_MS))
        );
        assert_eq!(l.rule(AlertKind::BreakoutUp), None);
    }
}
