//! The focus session engine.
//!
//! One [`FocusEngine`] is constructed at process start and passed by
//! reference to whatever drives it (the CLI, the [`crate::driver`] loop, a
//! GUI shell). Local intents, clock ticks, and bridge reports all funnel into
//! the same private `dispatch`, which runs the side-effect coordinator,
//! publishes the session mirror, and broadcasts the resulting [`Event`].
//!
//! ## Usage
//!
//! ```ignore
//! let mut engine = FocusEngine::new(machine, effects, bridge, SystemClock);
//! engine.start();
//! // Once per second:
//! engine.tick();
//! engine.poll_bridge();
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeIntent, BridgeReconciler, BridgeStore, Reconciliation, SessionMirror};
use crate::effects::{EffectContext, EffectLog, EffectState, SideEffectCoordinator};
use crate::events::{Event, Origin};
use crate::storage::Config;
use crate::timer::{Clock, SessionMachine, Transition};

const EVENT_CAPACITY: usize = 64;

/// Everything needed to rebuild an engine in a later process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineState {
    pub machine: SessionMachine,
    #[serde(default)]
    pub reconciler: BridgeReconciler,
    #[serde(default)]
    pub effects: EffectState,
}

/// Result of a transition that actually happened.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub transition: Transition,
    pub event: Event,
    pub effects: EffectLog,
}

pub struct FocusEngine<C, B> {
    machine: SessionMachine,
    reconciler: BridgeReconciler,
    effects: SideEffectCoordinator,
    bridge: B,
    clock: C,
    events: broadcast::Sender<Event>,
}

impl<C: Clock, B: BridgeStore> FocusEngine<C, B> {
    pub fn new(machine: SessionMachine, effects: SideEffectCoordinator, bridge: B, clock: C) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            machine,
            reconciler: BridgeReconciler::default(),
            effects,
            bridge,
            clock,
            events,
        }
    }

    /// Rebuild an engine from persisted state.
    pub fn from_state(
        state: EngineState,
        mut effects: SideEffectCoordinator,
        bridge: B,
        clock: C,
    ) -> Self {
        effects.restore_state(state.effects);
        let mut engine = Self::new(state.machine, effects, bridge, clock);
        engine.reconciler = state.reconciler;
        engine
    }

    pub fn to_state(&self) -> EngineState {
        EngineState {
            machine: self.machine.clone(),
            reconciler: self.reconciler.clone(),
            effects: self.effects.state().clone(),
        }
    }

    /// Apply session defaults, reconciliation policy, and channel switches.
    pub fn apply_config(&mut self, config: &Config) {
        self.machine.set_defaults(config.session_defaults());
        self.reconciler.set_policy(
            u64::from(config.bridge.grace_window_secs) * 1000,
            config.bridge.drift_tolerance_secs,
        );
        self.effects.set_settings(config.effect_settings());
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn machine(&self) -> &SessionMachine {
        &self.machine
    }

    pub fn reconciler(&self) -> &BridgeReconciler {
        &self.reconciler
    }

    pub fn effect_state(&self) -> &EffectState {
        self.effects.state()
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn remaining_secs(&self) -> u32 {
        self.machine.remaining_secs(self.clock.now_ms())
    }

    pub fn snapshot(&self) -> Event {
        self.machine.snapshot(self.clock.now_ms())
    }

    pub fn mirror(&self) -> SessionMirror {
        let now = self.clock.now_ms();
        let phase = self.machine.phase();
        SessionMirror {
            session_id: self.machine.meta().map(|m| m.session_id),
            phase: phase.kind(),
            remaining_secs: self.machine.remaining_secs(now),
            total_secs: self.machine.total_duration_secs(),
            end_epoch_ms: match phase {
                crate::timer::Phase::Running { end_epoch_ms, .. } => Some(end_epoch_ms),
                _ => None,
            },
            name: self.machine.session_name().map(str::to_owned),
            sound: self.machine.sound().map(str::to_owned),
            updated_at: chrono::Utc::now(),
        }
    }

    // ── Local intents ────────────────────────────────────────────────

    pub fn start(&mut self) -> Option<Outcome> {
        let now = self.clock.now_ms();
        let transition = self.machine.start(now);
        self.after_local_start(transition, now)
    }

    pub fn start_with(&mut self, duration_secs: u32, name: Option<String>) -> Option<Outcome> {
        let now = self.clock.now_ms();
        let transition = self.machine.start_with(duration_secs, name, now);
        self.after_local_start(transition, now)
    }

    pub fn pause(&mut self) -> Option<Outcome> {
        let transition = self.machine.pause(self.clock.now_ms());
        self.dispatch(transition, Origin::Local)
    }

    pub fn resume(&mut self) -> Option<Outcome> {
        let transition = self.machine.resume(self.clock.now_ms());
        self.dispatch(transition, Origin::Local)
    }

    pub fn toggle(&mut self) -> Option<Outcome> {
        if self.machine.phase().is_active() {
            let transition = self.machine.toggle(self.clock.now_ms());
            self.dispatch(transition, Origin::Local)
        } else {
            self.start()
        }
    }

    /// Return to `Idle`. Always succeeds.
    pub fn reset(&mut self) -> Outcome {
        let transition = self.machine.reset();
        self.run_transition(transition, Origin::Local)
    }

    /// Select the ambient sound; heard at the next entry into `Running`.
    pub fn set_sound(&mut self, sound: Option<String>) {
        self.machine.set_sound(sound);
        self.publish_mirror();
    }

    // ── Scheduled callbacks ──────────────────────────────────────────

    /// Observe the clock. Call at 1 Hz while a session is active.
    pub fn tick(&mut self) -> Option<Outcome> {
        let transition = self.machine.tick(self.clock.now_ms());
        self.dispatch(transition, Origin::Clock)
    }

    /// Read the shared store once and fold any newer report into local state.
    ///
    /// The clock is observed first: a run whose end instant has passed
    /// completes here and the snapshot is left for a later poll.
    pub fn poll_bridge(&mut self) -> Option<Outcome> {
        if !self.machine.phase().is_active() {
            return None;
        }
        if let Some(expired) = self.tick() {
            return Some(expired);
        }
        let snapshot = match self.bridge.load_snapshot() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "bridge poll skipped");
                return None;
            }
        };

        let now = self.clock.now_ms();
        let local_remaining = self.machine.remaining_secs(now);
        let intent = match self
            .reconciler
            .evaluate(&snapshot, self.machine.phase(), local_remaining, now)
        {
            Reconciliation::Applied(intent) => intent,
            other => {
                debug!(?other, last_update_time = snapshot.last_update_time, "bridge snapshot not applied");
                return None;
            }
        };
        info!(?intent, last_update_time = snapshot.last_update_time, "bridge snapshot applied");
        self.emit(Event::BridgeApplied {
            last_update_time: snapshot.last_update_time,
            intent,
            at: chrono::Utc::now(),
        });

        let transition = match intent? {
            BridgeIntent::Pause { remaining_secs } => self.machine.pause_at(remaining_secs, now),
            BridgeIntent::Resume { remaining_secs } => self.machine.resume_at(remaining_secs, now),
            BridgeIntent::Adjust { remaining_secs } => {
                self.machine.adjust_remaining(remaining_secs, now)
            }
            BridgeIntent::Expire => self.machine.expire(now),
        };
        self.dispatch(transition, Origin::Bridge)
    }

    /// The app returned to the foreground: catch up without waiting for the
    /// next scheduled tick.
    pub fn on_foreground(&mut self) -> Vec<Outcome> {
        self.tick()
            .into_iter()
            .chain(self.poll_bridge())
            .collect()
    }

    /// Push the current view to the shared store.
    pub fn publish_mirror(&self) {
        if let Err(e) = self.bridge.publish(&self.mirror()) {
            warn!(error = %e, "session mirror not published");
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn after_local_start(&mut self, transition: Option<Transition>, now: u64) -> Option<Outcome> {
        if transition.is_some() {
            let baseline = match self.bridge.load_snapshot() {
                Ok(snapshot) => snapshot.map(|s| s.last_update_time),
                Err(e) => {
                    debug!(error = %e, "no bridge baseline at start");
                    None
                }
            };
            self.reconciler.note_local_start(now, baseline);
        }
        self.dispatch(transition, Origin::Local)
    }

    fn dispatch(&mut self, transition: Option<Transition>, origin: Origin) -> Option<Outcome> {
        transition.map(|t| self.run_transition(t, origin))
    }

    fn run_transition(&mut self, transition: Transition, origin: Origin) -> Outcome {
        let name = self.machine.session_name().map(str::to_owned);
        let sound = self.machine.sound().map(str::to_owned);
        let ctx = EffectContext {
            session_name: name.as_deref(),
            sound: sound.as_deref(),
            planned_secs: self.machine.planned_duration_secs(),
        };
        let effects = self
            .effects
            .apply(&transition, ctx, self.machine.completion_guard_mut());

        let event = self.machine.describe(&transition, origin);
        info!(
            from = ?transition.from,
            to = ?transition.to,
            remaining_secs = transition.remaining_secs,
            ?origin,
            "session transition"
        );
        self.publish_mirror();
        self.emit(event.clone());
        Outcome {
            transition,
            event,
            effects,
        }
    }

    fn emit(&self, event: Event) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeSnapshot, MemoryBridgeStore};
    use crate::effects::{AudioCoordinator, EffectError, NotificationId, NotificationScheduler, StatsSink};
    use crate::timer::{ManualClock, PhaseKind, SessionDefaults};
    use std::cell::RefCell;
    use std::rc::Rc;

    const T0: u64 = 1_700_000_000_000;

    #[derive(Default)]
    struct Counts {
        scheduled: usize,
        recorded: Vec<u32>,
        audio: Vec<&'static str>,
    }

    struct Fake(Rc<RefCell<Counts>>);

    impl NotificationScheduler for Fake {
        fn schedule(&mut self, _after: u32, _name: &str) -> Result<NotificationId, EffectError> {
            self.0.borrow_mut().scheduled += 1;
            Ok(NotificationId("n".into()))
        }
        fn cancel(&mut self, _id: &NotificationId) -> Result<(), EffectError> {
            Ok(())
        }
    }

    impl AudioCoordinator for Fake {
        fn play(&mut self, _sound: &str) -> Result<(), EffectError> {
            self.0.borrow_mut().audio.push("play");
            Ok(())
        }
        fn pause(&mut self) -> Result<(), EffectError> {
            self.0.borrow_mut().audio.push("pause");
            Ok(())
        }
        fn resume(&mut self) -> Result<(), EffectError> {
            self.0.borrow_mut().audio.push("resume");
            Ok(())
        }
        fn stop(&mut self) -> Result<(), EffectError> {
            self.0.borrow_mut().audio.push("stop");
            Ok(())
        }
    }

    impl StatsSink for Fake {
        fn record(&mut self, duration_secs: u32, _name: Option<&str>) -> Result<(), EffectError> {
            self.0.borrow_mut().recorded.push(duration_secs);
            Ok(())
        }
    }

    fn engine(
        duration_secs: u32,
    ) -> (
        FocusEngine<Rc<ManualClock>, Rc<MemoryBridgeStore>>,
        Rc<ManualClock>,
        Rc<MemoryBridgeStore>,
        Rc<RefCell<Counts>>,
    ) {
        let counts = Rc::new(RefCell::new(Counts::default()));
        let clock = Rc::new(ManualClock::new(T0));
        let store = Rc::new(MemoryBridgeStore::new());
        let effects = SideEffectCoordinator::new(
            Box::new(Fake(counts.clone())),
            Box::new(Fake(counts.clone())),
            Box::new(Fake(counts.clone())),
        );
        let machine = SessionMachine::new(SessionDefaults {
            duration_secs,
            name: Some("Focus".into()),
            sound: Some("rain".into()),
        });
        let engine = FocusEngine::new(machine, effects, store.clone(), clock.clone());
        (engine, clock, store, counts)
    }

    #[test]
    fn events_are_broadcast_to_subscribers() {
        let (mut engine, clock, _, _) = engine(60);
        let mut rx = engine.subscribe();
        engine.start().unwrap();
        clock.advance_secs(60);
        engine.tick().unwrap();

        assert!(matches!(rx.try_recv().unwrap(), Event::SessionStarted { duration_secs: 60, .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::SessionCompleted {
                origin: Origin::Clock,
                ..
            }
        ));
    }

    #[test]
    fn transitions_publish_mirror() {
        let (mut engine, clock, store, _) = engine(60);
        engine.start().unwrap();
        clock.advance_secs(10);
        engine.pause().unwrap();
        let mirror = store.mirror().unwrap();
        assert_eq!(mirror.phase, PhaseKind::Paused);
        assert_eq!(mirror.remaining_secs, 50);
        assert_eq!(mirror.end_epoch_ms, None);
    }

    #[test]
    fn poll_is_skipped_while_idle() {
        let (mut engine, _, store, _) = engine(60);
        store.set_snapshot(BridgeSnapshot {
            is_paused: true,
            remaining_seconds: 10,
            last_update_time: 1.0,
        });
        assert!(engine.poll_bridge().is_none());
        assert_eq!(store.load_count(), 0);
    }

    #[test]
    fn unavailable_store_is_a_quiet_noop() {
        let (mut engine, _, store, _) = engine(60);
        engine.start().unwrap();
        store.set_unavailable(true);
        assert!(engine.poll_bridge().is_none());
        assert_eq!(engine.machine().kind(), PhaseKind::Running);
    }

    #[test]
    fn external_expiry_after_grace_completes_once() {
        let (mut engine, clock, store, counts) = engine(600);
        engine.start().unwrap();
        clock.advance_secs(5);
        store.set_snapshot(BridgeSnapshot {
            is_paused: false,
            remaining_seconds: 0,
            last_update_time: 10.0,
        });
        let outcome = engine.poll_bridge().unwrap();
        assert_eq!(outcome.transition.to, PhaseKind::Completed);

        store.set_snapshot(BridgeSnapshot {
            is_paused: false,
            remaining_seconds: 0,
            last_update_time: 11.0,
        });
        // Completed is not active, so the reconciler no longer polls.
        assert!(engine.poll_bridge().is_none());
        assert_eq!(counts.borrow().recorded, vec![600]);
    }

    #[test]
    fn foreground_catches_up_expired_clock() {
        let (mut engine, clock, _, counts) = engine(60);
        engine.start().unwrap();
        clock.advance_secs(3600);
        let outcomes = engine.on_foreground();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].transition.to, PhaseKind::Completed);
        assert_eq!(counts.borrow().recorded, vec![60]);
        assert_eq!(counts.borrow().audio, vec!["play", "stop"]);
    }

    #[test]
    fn state_roundtrip_keeps_guard_and_pending_notification() {
        let (mut engine, clock, store, counts) = engine(60);
        engine.start().unwrap();
        clock.advance_secs(60);
        engine.tick().unwrap();

        let json = serde_json::to_string(&engine.to_state()).unwrap();
        let state: EngineState = serde_json::from_str(&json).unwrap();
        let effects = SideEffectCoordinator::new(
            Box::new(Fake(counts.clone())),
            Box::new(Fake(counts.clone())),
            Box::new(Fake(counts.clone())),
        );
        let mut restored = FocusEngine::from_state(state, effects, store, clock);
        assert!(restored.machine().completion_guard().is_set());

        // A late tick in the next process does nothing new.
        assert!(restored.tick().is_none());
        assert_eq!(counts.borrow().recorded, vec![60]);
    }

    #[test]
    fn toggle_from_idle_starts_with_baseline() {
        let (mut engine, clock, store, _) = engine(60);
        store.set_snapshot(BridgeSnapshot {
            is_paused: true,
            remaining_seconds: 30,
            last_update_time: 99.0,
        });
        engine.toggle().unwrap();
        assert_eq!(engine.reconciler().last_applied(), Some(99.0));
        clock.advance_secs(3);
        assert!(engine.poll_bridge().is_none());
        assert_eq!(engine.machine().kind(), PhaseKind::Running);
    }
}
