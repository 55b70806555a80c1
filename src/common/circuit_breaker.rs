//! Circuit breaker for the auto-anchor candle fetch
//!
//! Repeated fetch failures open the breaker and pause fetching; after the
//! open period one trial fetch is allowed. Time is engine time, so the
//! breaker behaves identically under replay.
//!
//! States:
//! - Closed: fetches go ahead
//! - Open: fetches are skipped
//! - HalfOpen: a trial fetch decides between Closed and Open

use tracing::{info, warn};

use crate::config::AutoAnchorConfig;
use crate::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Time spent open before a trial fetch
    pub open_ms: Millis,
}

impl BreakerConfig {
    pub fn from_auto_anchor(config: &AutoAnchorConfig) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold.max(1),
            open_ms: config.breaker_open_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchBreaker {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Millis>,
    config: BreakerConfig,
}

impl FetchBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            opened_at: None,
            config,
        }
    }

    pub fn set_config(&mut self, config: BreakerConfig) {
        self.config = config;
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Whether a fetch may start at `now`
    pub fn can_attempt(&mut self, now: Millis) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map_or(Millis::MAX, |t| now.saturating_sub(t));
                if elapsed >= self.config.open_ms {
                    info!("Fetch breaker half-open, allowing a trial fetch");
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            info!("Fetch breaker closed after successful fetch");
        }
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self, now: Millis) {
        match self.state {
            BreakerState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    warn!(failures = self.failure_count, "Fetch breaker opened");
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                warn!("Trial fetch failed, fetch breaker re-opened");
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
            }
            BreakerState::Open => {
                self.opened_at = Some(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> FetchBreaker {
        FetchBreaker::new(BreakerConfig {
            failure_threshold: 2,
            open_ms: 1_000,
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut b = breaker();
        assert!(b.can_attempt(0));
        b.record_failure(0);
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure(10);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_attempt(500));
    }

    #[test]
    fn test_half_open_trial() {
        let mut b = breaker();
        b.record_failure(0);
        b.record_failure(0);

        assert!(b.can_attempt(1_000));
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_failure(1_000);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_attempt(1_500));

        assert!(b.can_attempt(2_000));
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn test_success_resets_count() {
        let mut b = breaker();
        b.record_failure(0);
        b.record_success();
        b.record_failure(1);
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 1);
    }

    #[test]
    fn test_config_from_settings() {
        let cfg = BreakerConfig::from_auto_anchor(&AutoAnchorConfig::default());
        assert_eq!(cfg.failure_threshold, 3);
        assert_eq!(cfg.open_ms, crate::HOUR_MS);
    }
}
