//! Wall-clock-anchored countdown.
//!
//! The clock stores the absolute instant at which the session ends instead of
//! a decrementing counter. Remaining time is always `end - now`, so missed
//! ticks, process suspension, or device sleep never introduce drift.

use std::cell::Cell;

use serde::{Deserialize, Serialize};

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A hand-driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: Cell<u64>,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: Cell::new(now_ms),
        }
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.set(now_ms);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.now_ms
            .set(self.now_ms.get().saturating_add(secs.saturating_mul(1000)));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

impl<C: Clock + ?Sized> Clock for std::rc::Rc<C> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// Result of a single clock observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTick {
    /// Whole seconds left, rounded up.
    pub remaining_secs: u32,
    /// True exactly once per anchoring, on the first observation at zero.
    pub expired: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClock {
    /// Absolute end instant; `None` while stopped or frozen.
    end_epoch_ms: Option<u64>,
    /// Set once the zero crossing has been signalled for this anchoring.
    #[serde(default)]
    expiry_signalled: bool,
}

impl SessionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchor the countdown so that `remaining_secs` are left at `now_ms`.
    /// Returns the new end instant.
    pub fn start(&mut self, remaining_secs: u32, now_ms: u64) -> u64 {
        let end = now_ms.saturating_add(u64::from(remaining_secs) * 1000);
        self.end_epoch_ms = Some(end);
        self.expiry_signalled = false;
        end
    }

    /// Observe the clock. Returns `None` when not anchored.
    pub fn tick(&mut self, now_ms: u64) -> Option<ClockTick> {
        let remaining_secs = self.remaining_at(now_ms)?;
        let expired = remaining_secs == 0 && !self.expiry_signalled;
        if expired {
            self.expiry_signalled = true;
        }
        Some(ClockTick {
            remaining_secs,
            expired,
        })
    }

    /// Freeze the countdown, returning the remaining seconds at `now_ms`.
    pub fn pause(&mut self, now_ms: u64) -> Option<u32> {
        let remaining = self.remaining_at(now_ms)?;
        self.stop();
        Some(remaining)
    }

    /// Discard the anchor.
    pub fn stop(&mut self) {
        self.end_epoch_ms = None;
        self.expiry_signalled = false;
    }

    /// `max(0, ceil(end - now))` in seconds, without side effects.
    pub fn remaining_at(&self, now_ms: u64) -> Option<u32> {
        let end = self.end_epoch_ms?;
        let left_ms = end.saturating_sub(now_ms);
        Some(u32::try_from(left_ms.div_ceil(1000)).unwrap_or(u32::MAX))
    }

    pub fn end_epoch_ms(&self) -> Option<u64> {
        self.end_epoch_ms
    }

    pub fn is_anchored(&self) -> bool {
        self.end_epoch_ms.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_anchors_end_instant() {
        let mut clock = SessionClock::new();
        let end = clock.start(1500, 10_000);
        assert_eq!(end, 10_000 + 1_500_000);
        assert_eq!(clock.remaining_at(10_000), Some(1500));
    }

    #[test]
    fn remaining_rounds_up_partial_seconds() {
        let mut clock = SessionClock::new();
        clock.start(10, 0);
        assert_eq!(clock.remaining_at(1), Some(10));
        assert_eq!(clock.remaining_at(999), Some(10));
        assert_eq!(clock.remaining_at(1000), Some(9));
        assert_eq!(clock.remaining_at(9_001), Some(1));
        assert_eq!(clock.remaining_at(10_000), Some(0));
        assert_eq!(clock.remaining_at(50_000), Some(0));
    }

    #[test]
    fn expiry_signals_once() {
        let mut clock = SessionClock::new();
        clock.start(2, 0);
        assert!(!clock.tick(1_000).unwrap().expired);
        let first = clock.tick(2_000).unwrap();
        assert_eq!(first.remaining_secs, 0);
        assert!(first.expired);
        assert!(!clock.tick(3_000).unwrap().expired);

        // Re-anchoring re-arms the signal.
        clock.start(1, 3_000);
        assert!(clock.tick(4_000).unwrap().expired);
    }

    #[test]
    fn pause_freezes_and_unanchors() {
        let mut clock = SessionClock::new();
        clock.start(1500, 0);
        assert_eq!(clock.pause(600_000), Some(900));
        assert!(!clock.is_anchored());
        assert_eq!(clock.tick(900_000), None);
    }

    #[test]
    fn gap_after_pause_does_not_reduce_remaining() {
        let mut clock = SessionClock::new();
        clock.start(1500, 0);
        let frozen = clock.pause(600_000).unwrap();
        let resume_at = 1_200_000;
        let end = clock.start(frozen, resume_at);
        assert_eq!(end, resume_at + 900_000);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(5);
        clock.advance_secs(2);
        assert_eq!(clock.now_ms(), 2_005);
    }
}
