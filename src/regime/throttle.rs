//! Secondary alert throttling and coalescing

use std::collections::HashMap;
use tracing::debug;

use crate::config::ThrottleConfig;
use crate::{AlertDraft, AlertKind, Millis};

/// Cooldowns between secondary alerts: a global spacing, a pairwise matrix
/// keyed on (previous kind, next kind), and per-kind fallbacks.
#[derive(Debug, Clone)]
pub struct ThrottleMatrix {
    global_ms: Millis,
    pairs: HashMap<(AlertKind, AlertKind), Millis>,
    kind_cooldowns: HashMap<AlertKind, Millis>,
    default_kind_ms: Millis,
}

impl ThrottleMatrix {
    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self {
            global_ms: config.global_secondary_cooldown_ms,
            pairs: config
                .pair_rules
                .iter()
                .map(|r| ((r.previous, r.next), r.cooldown_ms))
                .collect(),
            kind_cooldowns: config
                .kind_cooldowns
                .iter()
                .map(|k| (k.kind, k.cooldown_ms))
                .collect(),
            default_kind_ms: config.default_kind_cooldown_ms,
        }
    }

    pub fn global_ms(&self) -> Millis {
        self.global_ms
    }

    pub fn pair_cooldown(&self, previous: AlertKind, next: AlertKind) -> Option<Millis> {
        self.pairs.get(&(previous, next)).copied()
    }

    pub fn kind_cooldown(&self, kind: AlertKind) -> Millis {
        self.kind_cooldowns
            .get(&kind)
            .copied()
            .unwrap_or(self.default_kind_ms)
    }
}

/// Which throttle rule blocked a secondary alert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleBlock {
    Global { remaining_ms: Millis },
    Pair { previous: AlertKind, remaining_ms: Millis },
    Kind { remaining_ms: Millis },
}

#[derive(Debug, Clone, Default)]
pub struct ThrottleState {
    last_kind: Option<AlertKind>,
    last_fire: Option<Millis>,
    last_fire_by_kind: HashMap<AlertKind, Millis>,
}

impl ThrottleState {
    pub fn last_kind(&self) -> Option<AlertKind> {
        self.last_kind
    }

    pub fn last_fire(&self) -> Option<Millis> {
        self.last_fire
    }

    /// Read-only: a blocked alert leaves the state untouched
    pub fn check(&self, matrix: &ThrottleMatrix, kind: AlertKind, now: Millis) -> Result<(), ThrottleBlock> {
        if let Some(last) = self.last_fire {
            let elapsed = now.saturating_sub(last);
            if elapsed < matrix.global_ms() {
                return Err(ThrottleBlock::Global {
                    remaining_ms: matrix.global_ms() - elapsed,
                });
            }

            if let Some(previous) = self.last_kind {
                if let Some(cooldown) = matrix.pair_cooldown(previous, kind) {
                    if elapsed < cooldown {
                        return Err(ThrottleBlock::Pair {
                            previous,
                            remaining_ms: cooldown - elapsed,
                        });
                    }
                    return Ok(());
                }
            }
        }

        if let Some(&last_same) = self.last_fire_by_kind.get(&kind) {
            let elapsed = now.saturating_sub(last_same);
            let cooldown = matrix.kind_cooldown(kind);
            if elapsed < cooldown {
                return Err(ThrottleBlock::Kind {
                    remaining_ms: cooldown - elapsed,
                });
            }
        }

        Ok(())
    }

    pub fn record(&mut self, kind: AlertKind, now: Millis) {
        self.last_kind = Some(kind);
        self.last_fire = Some(now);
        self.last_fire_by_kind.insert(kind, now);
    }
}

/// A secondary alert waiting out the coalescing window
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAlert {
    pub kind: AlertKind,
    pub priority: u8,
    pub draft: AlertDraft,
    pub created_at: Millis,
}

/// Result of offering an alert to the coalescer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    Replaced { previous: AlertKind },
    Dropped { pending: AlertKind },
}

/// Single pending slot; a higher-priority alert replaces the pending one but
/// keeps its creation time, so the window never extends.
#[derive(Debug, Clone)]
pub struct Coalescer {
    window_ms: Millis,
    pending: Option<PendingAlert>,
}

impl Coalescer {
    pub fn new(window_ms: Millis) -> Self {
        Self {
            window_ms,
            pending: None,
        }
    }

    pub fn set_window(&mut self, window_ms: Millis) {
        self.window_ms = window_ms;
    }

    pub fn pending(&self) -> Option<&PendingAlert> {
        self.pending.as_ref()
    }

    pub fn offer(&mut self, draft: AlertDraft, now: Millis) -> Offer {
        let kind = draft.kind;
        let priority = kind.priority();

        match self.pending.as_mut() {
            None => {
                self.pending = Some(PendingAlert {
                    kind,
                    priority,
                    draft,
                    created_at: now,
                });
                Offer::Queued
            }
            Some(pending) if priority > pending.priority => {
                let previous = pending.kind;
                debug!(new = ?kind, replaced = ?previous, "Coalescer kept higher priority alert");
                pending.kind = kind;
                pending.priority = priority;
                pending.draft = draft;
                Offer::Replaced { previous }
            }
            Some(pending) => {
                debug!(new = ?kind, pending = ?pending.kind, "Coalescer dropped lower priority alert");
                Offer::Dropped {
                    pending: pending.kind,
                }
            }
        }
    }

    /// Pending alert whose window has elapsed
    pub fn take_expired(&mut self, now: Millis) -> Option<PendingAlert> {
        let expired = self
            .pending
            .as_ref()
            .is_some_and(|p| now.saturating_sub(p.created_at) >= self.window_ms);
        if expired {
            self.pending.take()
        } else {
            None
        }
    }

    pub fn take(&mut self) -> Option<PendingAlert> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MINUTE_MS;

    fn draft(kind: AlertKind) -> AlertDraft {
        AlertDraft::new(kind, kind.label(), "")
    }

    #[test]
    fn test_global_cooldown() {
        let matrix = ThrottleMatrix::from_config(&ThrottleConfig::default());
        let mut state = ThrottleState::default();
        state.record(AlertKind::Compression, 0);

        assert!(matches!(
            state.check(&matrix, AlertKind::TrendChange, MINUTE_MS),
            Err(ThrottleBlock::Global { .. })
        ));
        assert!(state.check(&matrix, AlertKind::TrendChange, 2 * MINUTE_MS).is_ok());
    }

    #[test]
    fn test_pair_rule_overrides_kind_fallback() {
        let matrix = ThrottleMatrix::from_config(&ThrottleConfig::default());
        let mut state = ThrottleState::default();
        state.record(AlertKind::AnchorContext, 0);

        // AnchorContext → MeanTouch is 5 minutes
        assert!(matches!(
            state.check(&matrix, AlertKind::MeanTouch, 3 * MINUTE_MS),
            Err(ThrottleBlock::Pair {
                previous: AlertKind::AnchorContext,
                ..
            })
        ));
        assert!(state.check(&matrix, AlertKind::MeanTouch, 5 * MINUTE_MS).is_ok());
    }

    #[test]
    fn test_kind_fallback_without_pair_rule() {
        let matrix = ThrottleMatrix::from_config(&ThrottleConfig::default());
        let mut state = ThrottleState::default();
        state.record(AlertKind::Compression, 0);
        state.record(AlertKind::TrendChange, 5 * MINUTE_MS);

        // no (TrendChange, Compression) pair; Compression waits its 30 minutes
        assert!(matches!(
            state.check(&matrix, AlertKind::Compression, 20 * MINUTE_MS),
            Err(ThrottleBlock::Kind { .. })
        ));
        assert!(state.check(&matrix, AlertKind::Compression, 30 * MINUTE_MS).is_ok());
    }

    #[test]
    fn test_coalescing_priority() {
        let mut c = Coalescer::new(30_000);
        assert_eq!(c.offer(draft(AlertKind::Compression), 0), Offer::Queued);
        assert_eq!(
            c.offer(draft(AlertKind::TrendChange), 5_000),
            Offer::Replaced {
                previous: AlertKind::Compression
            }
        );
        assert_eq!(
            c.offer(draft(AlertKind::MeanTouch), 10_000),
            Offer::Dropped {
                pending: AlertKind::TrendChange
            }
        );

        assert!(c.take_expired(29_999).is_none());
        let flushed = c.take_expired(30_000).unwrap();
        assert_eq!(flushed.kind, AlertKind::TrendChange);
        assert_eq!(flushed.created_at, 0);
        assert!(c.pending().is_none());
    }

    #[test]
    fn test_equal_priority_does_not_replace() {
        let mut c = Coalescer::new(30_000);
        c.offer(draft(AlertKind::MeanTouch), 0);
        assert!(matches!(
            c.offer(draft(AlertKind::MeanTouch), 1_000),
            Offer::Dropped { .. }
        ));
    }
}
