//! Session state machine.
//!
//! Owns the phase, the wall-clock anchor, the per-run metadata and the
//! completion guard. Nothing here performs side effects; every command returns
//! the [`Transition`] it took so the caller can hand it to the side-effect
//! coordinator.
//!
//! ## State Transitions
//!
//! ```text
//! Idle ──start──> Running ──pause──> Paused
//!                  │   ^               │
//!                  │   └────resume─────┘
//!                  └──clock-expired──> Completed ──start──> Running
//! any ──reset──> Idle
//! ```
//!
//! The caller supplies `now_ms` to every command; the machine never reads
//! the clock itself.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::clock::SessionClock;
use super::phase::{CompletionGuard, Phase, PhaseKind, SessionMeta, Transition};
use crate::events::{Event, Origin};

/// Values used when a run starts without explicit parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDefaults {
    pub duration_secs: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sound: Option<String>,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            duration_secs: 25 * 60,
            name: None,
            sound: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMachine {
    phase: Phase,
    clock: SessionClock,
    defaults: SessionDefaults,
    /// Currently selected ambient sound; survives across runs.
    #[serde(default)]
    sound: Option<String>,
    #[serde(default)]
    meta: Option<SessionMeta>,
    #[serde(default)]
    guard: CompletionGuard,
}

impl SessionMachine {
    /// Create a machine in `Idle`.
    pub fn new(defaults: SessionDefaults) -> Self {
        let sound = defaults.sound.clone();
        Self {
            phase: Phase::Idle,
            clock: SessionClock::new(),
            defaults,
            sound,
            meta: None,
            guard: CompletionGuard::default(),
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn kind(&self) -> PhaseKind {
        self.phase.kind()
    }

    pub fn defaults(&self) -> &SessionDefaults {
        &self.defaults
    }

    pub fn meta(&self) -> Option<&SessionMeta> {
        self.meta.as_ref()
    }

    pub fn session_name(&self) -> Option<&str> {
        self.meta
            .as_ref()
            .and_then(|m| m.name.as_deref())
            .or(self.defaults.name.as_deref())
    }

    pub fn sound(&self) -> Option<&str> {
        self.sound.as_deref()
    }

    pub fn completion_guard(&self) -> &CompletionGuard {
        &self.guard
    }

    pub fn completion_guard_mut(&mut self) -> &mut CompletionGuard {
        &mut self.guard
    }

    /// The duration captured when the current run started.
    pub fn planned_duration_secs(&self) -> Option<u32> {
        self.phase.total_secs()
    }

    /// Total duration of the current run, or the default when idle.
    pub fn total_duration_secs(&self) -> u32 {
        self.phase
            .total_secs()
            .unwrap_or(self.defaults.duration_secs)
    }

    pub fn remaining_secs(&self, now_ms: u64) -> u32 {
        match self.phase {
            Phase::Idle => self.defaults.duration_secs,
            Phase::Running { .. } => self.clock.remaining_at(now_ms).unwrap_or(0),
            Phase::Paused { remaining_secs, .. } => remaining_secs,
            Phase::Completed { .. } => 0,
        }
    }

    /// 0.0 .. 1.0 progress within the current run.
    pub fn progress(&self, now_ms: u64) -> f64 {
        let total = self.total_duration_secs();
        if total == 0 || self.phase == Phase::Idle {
            return 0.0;
        }
        1.0 - (f64::from(self.remaining_secs(now_ms)) / f64::from(total))
    }

    /// Build a full state snapshot event.
    pub fn snapshot(&self, now_ms: u64) -> Event {
        Event::StateSnapshot {
            phase: self.kind(),
            remaining_secs: self.remaining_secs(now_ms),
            total_secs: self.total_duration_secs(),
            progress: self.progress(now_ms),
            name: self.session_name().map(str::to_owned),
            session_id: self.meta.as_ref().map(|m| m.session_id),
            end_epoch_ms: self.clock.end_epoch_ms(),
            completion_logged: self.guard.is_set(),
            at: Utc::now(),
        }
    }

    /// Describe a transition this machine just took.
    pub fn describe(&self, transition: &Transition, origin: Origin) -> Event {
        let at = Utc::now();
        match (transition.from, transition.to) {
            (PhaseKind::Idle | PhaseKind::Completed, PhaseKind::Running) => {
                Event::SessionStarted {
                    session_id: self.meta.as_ref().map(|m| m.session_id).unwrap_or_default(),
                    name: self.session_name().map(str::to_owned),
                    duration_secs: transition.remaining_secs,
                    at,
                }
            }
            (PhaseKind::Paused, PhaseKind::Running) => Event::SessionResumed {
                remaining_secs: transition.remaining_secs,
                origin,
                at,
            },
            (PhaseKind::Running, PhaseKind::Paused) => Event::SessionPaused {
                remaining_secs: transition.remaining_secs,
                origin,
                at,
            },
            (_, PhaseKind::Completed) => Event::SessionCompleted {
                session_id: self.meta.as_ref().map(|m| m.session_id),
                duration_secs: self.total_duration_secs(),
                origin,
                at,
            },
            (_, PhaseKind::Idle) => Event::SessionReset { at },
            _ => Event::RemainingAdjusted {
                remaining_secs: transition.remaining_secs,
                at,
            },
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Replace the defaults. Takes effect at the next fresh run.
    pub fn set_defaults(&mut self, defaults: SessionDefaults) {
        if self.sound.is_none() {
            self.sound = defaults.sound.clone();
        }
        self.defaults = defaults;
    }

    /// Select the ambient sound for the next entry into `Running`.
    pub fn set_sound(&mut self, sound: Option<String>) {
        self.sound = sound;
    }

    /// Start a fresh run with the default duration and name.
    pub fn start(&mut self, now_ms: u64) -> Option<Transition> {
        let duration = self.defaults.duration_secs;
        let name = self.defaults.name.clone();
        self.start_with(duration, name, now_ms)
    }

    /// Start a fresh run from `Idle` or `Completed`.
    ///
    /// A zero duration is a no-op, as is starting while a run is active.
    pub fn start_with(
        &mut self,
        duration_secs: u32,
        name: Option<String>,
        now_ms: u64,
    ) -> Option<Transition> {
        let from = self.kind();
        if !matches!(from, PhaseKind::Idle | PhaseKind::Completed) {
            return None;
        }
        if duration_secs == 0 {
            debug!("start ignored: zero remaining");
            return None;
        }

        self.guard.clear();
        self.meta = Some(SessionMeta {
            session_id: Uuid::new_v4(),
            name,
            sound: self.sound.clone(),
            started_at: Utc::now(),
        });
        let end_epoch_ms = self.clock.start(duration_secs, now_ms);
        self.phase = Phase::Running {
            end_epoch_ms,
            total_secs: duration_secs,
        };
        debug!(?from, duration_secs, end_epoch_ms, "session started");
        Some(Transition {
            from,
            to: PhaseKind::Running,
            remaining_secs: duration_secs,
        })
    }

    /// Freeze a running session.
    ///
    /// Pausing at zero remaining completes the run instead, so a paused
    /// session always has time left.
    pub fn pause(&mut self, now_ms: u64) -> Option<Transition> {
        let Phase::Running { total_secs, .. } = self.phase else {
            return None;
        };
        let remaining = self.clock.pause(now_ms).unwrap_or(0);
        if remaining == 0 {
            return self.complete(PhaseKind::Running, total_secs);
        }
        self.enter_paused(remaining, total_secs)
    }

    /// Freeze a running session at an externally reported remaining time.
    pub fn pause_at(&mut self, remaining_secs: u32, _now_ms: u64) -> Option<Transition> {
        let Phase::Running { total_secs, .. } = self.phase else {
            return None;
        };
        self.clock.stop();
        self.enter_paused(remaining_secs.clamp(1, total_secs), total_secs)
    }

    /// Re-anchor a paused session from its frozen remaining time.
    pub fn resume(&mut self, now_ms: u64) -> Option<Transition> {
        let Phase::Paused { remaining_secs, .. } = self.phase else {
            return None;
        };
        self.resume_at(remaining_secs, now_ms)
    }

    /// Re-anchor a paused session with an explicit remaining time.
    pub fn resume_at(&mut self, remaining_secs: u32, now_ms: u64) -> Option<Transition> {
        let Phase::Paused { total_secs, .. } = self.phase else {
            return None;
        };
        let remaining_secs = remaining_secs.clamp(1, total_secs);
        let end_epoch_ms = self.clock.start(remaining_secs, now_ms);
        self.phase = Phase::Running {
            end_epoch_ms,
            total_secs,
        };
        debug!(remaining_secs, end_epoch_ms, "session resumed");
        Some(Transition {
            from: PhaseKind::Paused,
            to: PhaseKind::Running,
            remaining_secs,
        })
    }

    /// `Idle`/`Completed` start, `Running` pauses, `Paused` resumes.
    pub fn toggle(&mut self, now_ms: u64) -> Option<Transition> {
        match self.kind() {
            PhaseKind::Idle | PhaseKind::Completed => self.start(now_ms),
            PhaseKind::Running => self.pause(now_ms),
            PhaseKind::Paused => self.resume(now_ms),
        }
    }

    /// Observe the clock. Returns the completion transition on the one tick
    /// that crosses zero.
    pub fn tick(&mut self, now_ms: u64) -> Option<Transition> {
        let Phase::Running { total_secs, .. } = self.phase else {
            return None;
        };
        let tick = self.clock.tick(now_ms)?;
        if !tick.expired {
            return None;
        }
        self.complete(PhaseKind::Running, total_secs)
    }

    /// Force completion, e.g. on an external "expired" report.
    ///
    /// Only an active run can complete; a finished one returns `None`, so
    /// completion is entered once per run.
    pub fn expire(&mut self, _now_ms: u64) -> Option<Transition> {
        match self.phase {
            Phase::Running { total_secs, .. } | Phase::Paused { total_secs, .. } => {
                let from = self.kind();
                self.complete(from, total_secs)
            }
            Phase::Completed { .. } | Phase::Idle => None,
        }
    }

    /// Move the remaining time without changing phase.
    pub fn adjust_remaining(&mut self, remaining_secs: u32, now_ms: u64) -> Option<Transition> {
        match self.phase {
            Phase::Running { total_secs, .. } => {
                let remaining_secs = remaining_secs.clamp(1, total_secs);
                let end_epoch_ms = self.clock.start(remaining_secs, now_ms);
                self.phase = Phase::Running {
                    end_epoch_ms,
                    total_secs,
                };
                Some(Transition {
                    from: PhaseKind::Running,
                    to: PhaseKind::Running,
                    remaining_secs,
                })
            }
            Phase::Paused { total_secs, .. } => {
                let remaining_secs = remaining_secs.clamp(1, total_secs);
                self.phase = Phase::Paused {
                    remaining_secs,
                    total_secs,
                };
                Some(Transition {
                    from: PhaseKind::Paused,
                    to: PhaseKind::Paused,
                    remaining_secs,
                })
            }
            _ => None,
        }
    }

    /// Return to `Idle` from any phase. Always succeeds.
    pub fn reset(&mut self) -> Transition {
        let from = self.kind();
        self.clock.stop();
        self.meta = None;
        self.guard.clear();
        self.phase = Phase::Idle;
        debug!(?from, "session reset");
        Transition {
            from,
            to: PhaseKind::Idle,
            remaining_secs: self.defaults.duration_secs,
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn enter_paused(&mut self, remaining_secs: u32, total_secs: u32) -> Option<Transition> {
        self.phase = Phase::Paused {
            remaining_secs,
            total_secs,
        };
        debug!(remaining_secs, "session paused");
        Some(Transition {
            from: PhaseKind::Running,
            to: PhaseKind::Paused,
            remaining_secs,
        })
    }

    fn complete(&mut self, from: PhaseKind, total_secs: u32) -> Option<Transition> {
        self.clock.stop();
        self.phase = Phase::Completed { total_secs };
        debug!(?from, total_secs, "session completed");
        Some(Transition {
            from,
            to: PhaseKind::Completed,
            remaining_secs: 0,
        })
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new(SessionDefaults::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    fn machine(duration_secs: u32) -> SessionMachine {
        SessionMachine::new(SessionDefaults {
            duration_secs,
            name: Some("Deep Work".into()),
            sound: Some("rain".into()),
        })
    }

    #[test]
    fn start_pause_resume() {
        let mut m = machine(1500);
        assert_eq!(m.kind(), PhaseKind::Idle);

        let t = m.start(T0).unwrap();
        assert_eq!((t.from, t.to), (PhaseKind::Idle, PhaseKind::Running));
        assert_eq!(
            m.phase(),
            Phase::Running {
                end_epoch_ms: T0 + 1_500_000,
                total_secs: 1500
            }
        );

        let t = m.pause(T0 + 600_000).unwrap();
        assert_eq!(t.to, PhaseKind::Paused);
        assert_eq!(t.remaining_secs, 900);

        let t = m.resume(T0 + 1_200_000).unwrap();
        assert_eq!(t.to, PhaseKind::Running);
        assert_eq!(
            m.phase(),
            Phase::Running {
                end_epoch_ms: T0 + 1_200_000 + 900_000,
                total_secs: 1500
            }
        );
    }

    #[test]
    fn start_is_noop_while_active_or_zero() {
        let mut m = machine(0);
        assert!(m.start(T0).is_none());
        assert_eq!(m.kind(), PhaseKind::Idle);

        let mut m = machine(60);
        m.start(T0).unwrap();
        assert!(m.start(T0 + 1_000).is_none());
        m.pause(T0 + 2_000).unwrap();
        assert!(m.start(T0 + 3_000).is_none());
    }

    #[test]
    fn tick_completes_exactly_once() {
        let mut m = machine(1500);
        m.start(T0).unwrap();
        assert!(m.tick(T0 + 1_499_000).is_none());
        let t = m.tick(T0 + 1_500_000).unwrap();
        assert_eq!(t.to, PhaseKind::Completed);
        assert!(m.tick(T0 + 1_501_000).is_none());
        assert_eq!(m.phase(), Phase::Completed { total_secs: 1500 });
    }

    #[test]
    fn tick_after_long_sleep_completes() {
        let mut m = machine(60);
        m.start(T0).unwrap();
        let t = m.tick(T0 + 86_400_000).unwrap();
        assert_eq!(t.to, PhaseKind::Completed);
    }

    #[test]
    fn completed_restart_recaptures_duration() {
        let mut m = machine(60);
        m.start(T0).unwrap();
        m.tick(T0 + 60_000).unwrap();
        let first_id = m.meta().unwrap().session_id;
        m.completion_guard_mut().try_latch();

        m.set_defaults(SessionDefaults {
            duration_secs: 90,
            name: None,
            sound: None,
        });
        let t = m.start(T0 + 70_000).unwrap();
        assert_eq!((t.from, t.to), (PhaseKind::Completed, PhaseKind::Running));
        assert_eq!(m.planned_duration_secs(), Some(90));
        assert!(!m.completion_guard().is_set());
        assert_ne!(m.meta().unwrap().session_id, first_id);
    }

    #[test]
    fn toggle_follows_phase() {
        let mut m = machine(60);
        assert_eq!(m.toggle(T0).unwrap().to, PhaseKind::Running);
        assert_eq!(m.toggle(T0 + 10_000).unwrap().to, PhaseKind::Paused);
        assert_eq!(m.toggle(T0 + 20_000).unwrap().to, PhaseKind::Running);
        m.tick(T0 + 80_000).unwrap();
        assert_eq!(m.kind(), PhaseKind::Completed);
        assert_eq!(m.toggle(T0 + 90_000).unwrap().to, PhaseKind::Running);
    }

    #[test]
    fn pause_at_zero_completes() {
        let mut m = machine(10);
        m.start(T0).unwrap();
        let t = m.pause(T0 + 10_000).unwrap();
        assert_eq!(t.to, PhaseKind::Completed);
    }

    #[test]
    fn reset_from_every_phase() {
        for setup in 0..4 {
            let mut m = machine(120);
            match setup {
                1 => {
                    m.start(T0);
                }
                2 => {
                    m.start(T0);
                    m.pause(T0 + 5_000);
                }
                3 => {
                    m.start(T0);
                    m.tick(T0 + 120_000);
                    m.completion_guard_mut().try_latch();
                }
                _ => {}
            }
            let t = m.reset();
            assert_eq!(t.to, PhaseKind::Idle);
            assert_eq!(m.phase(), Phase::Idle);
            assert_eq!(m.remaining_secs(T0 + 500_000), 120);
            assert!(!m.completion_guard().is_set());
            assert!(m.meta().is_none());
            assert!(m.planned_duration_secs().is_none());
        }
    }

    #[test]
    fn adjust_clamps_to_total() {
        let mut m = machine(300);
        m.start(T0).unwrap();
        let t = m.adjust_remaining(9_999, T0).unwrap();
        assert_eq!(t.remaining_secs, 300);
        let t = m.adjust_remaining(0, T0).unwrap();
        assert_eq!(t.remaining_secs, 1);
        assert!(t.is_reentry());
    }

    #[test]
    fn expire_completes_only_active_runs() {
        let mut m = machine(30);
        assert!(m.expire(T0).is_none());
        m.start(T0).unwrap();
        assert_eq!(m.expire(T0 + 1_000).unwrap().to, PhaseKind::Completed);
        assert!(m.expire(T0 + 2_000).is_none());
        assert!(m.tick(T0 + 60_000).is_none());
    }

    #[test]
    fn progress_tracks_remaining() {
        let mut m = machine(100);
        assert_eq!(m.progress(T0), 0.0);
        m.start(T0).unwrap();
        assert!((m.progress(T0 + 25_000) - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_returns_valid_event() {
        let m = machine(1500);
        match m.snapshot(T0) {
            Event::StateSnapshot {
                phase,
                remaining_secs,
                total_secs,
                ..
            } => {
                assert_eq!(phase, PhaseKind::Idle);
                assert_eq!(remaining_secs, 1500);
                assert_eq!(total_secs, 1500);
            }
            _ => panic!("Expected StateSnapshot"),
        }
    }

    #[test]
    fn machine_survives_serde_roundtrip_mid_run() {
        let mut m = machine(1500);
        m.start(T0).unwrap();
        m.pause(T0 + 600_000).unwrap();
        let json = serde_json::to_string(&m).unwrap();
        let mut restored: SessionMachine = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.remaining_secs(T0 + 9_000_000), 900);
        assert_eq!(restored.resume(T0 + 9_000_000).unwrap().remaining_secs, 900);
    }
}
