//! Cooperative 1 Hz driver.
//!
//! Clock ticks, bridge polls, and signals from other parts of the process are
//! all handled on the one task that owns the engine, so they never
//! interleave within a transition. Run it with `block_on` on a current-thread
//! runtime; the engine is not `Send` and needs no locks.
//!
//! Polling is the portable baseline. A platform that can push bridge changes
//! should send [`DriverSignal::Foreground`] instead of shortening the interval.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::bridge::BridgeStore;
use crate::engine::FocusEngine;
use crate::timer::{Clock, PhaseKind};

/// Why the driver returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverExit {
    /// The session left Running/Paused; carries the phase it ended in.
    SessionEnded(PhaseKind),
    /// The shutdown future resolved.
    Shutdown,
}

/// Work handed to a running driver from outside its loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum DriverSignal {
    /// Catch up with the clock and bridge now.
    Foreground,
    Pause,
    Resume,
    Toggle,
    Reset,
    Sound { sound: Option<String> },
}

impl DriverSignal {
    /// Apply to `engine`; `true` when state changed.
    pub fn apply<C: Clock, B: BridgeStore>(self, engine: &mut FocusEngine<C, B>) -> bool {
        match self {
            DriverSignal::Foreground => !engine.on_foreground().is_empty(),
            DriverSignal::Pause => engine.pause().is_some(),
            DriverSignal::Resume => engine.resume().is_some(),
            DriverSignal::Toggle => engine.toggle().is_some(),
            DriverSignal::Reset => {
                engine.reset();
                true
            }
            DriverSignal::Sound { sound } => {
                engine.set_sound(sound);
                true
            }
        }
    }
}

/// Drive `engine` until its session ends or `shutdown` resolves.
///
/// Every `interval` the clock is ticked and the bridge polled. A message on
/// `signals` is applied immediately. `on_change` sees the engine after every
/// step that changed it. A closed `signals` channel is ignored.
pub async fn run<C, B, F, H>(
    engine: &mut FocusEngine<C, B>,
    interval: Duration,
    signals: mpsc::Receiver<DriverSignal>,
    shutdown: F,
    mut on_change: H,
) -> DriverExit
where
    C: Clock,
    B: BridgeStore,
    F: Future<Output = ()>,
    H: FnMut(&FocusEngine<C, B>),
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut signals = Some(signals);
    tokio::pin!(shutdown);

    loop {
        if !engine.machine().phase().is_active() {
            let phase = engine.machine().kind();
            info!(?phase, "driver finished");
            return DriverExit::SessionEnded(phase);
        }

        let changed = tokio::select! {
            _ = &mut shutdown => {
                debug!("driver shutdown requested");
                return DriverExit::Shutdown;
            }
            _ = ticker.tick() => {
                let ticked = engine.tick().is_some();
                engine.poll_bridge().is_some() || ticked
            }
            signal = recv_or_pending(&mut signals) => match signal {
                Some(signal) => {
                    debug!(?signal, "driver signal");
                    signal.apply(engine)
                }
                None => {
                    signals = None;
                    false
                }
            },
        };
        if changed {
            on_change(engine);
        }
    }
}

async fn recv_or_pending(rx: &mut Option<mpsc::Receiver<DriverSignal>>) -> Option<DriverSignal> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeSnapshot, MemoryBridgeStore};
    use crate::effects::{
        AudioCoordinator, EffectError, NotificationId, NotificationScheduler,
        SideEffectCoordinator, StatsSink,
    };
    use crate::timer::{ManualClock, SessionDefaults, SessionMachine};
    use std::rc::Rc;

    const T0: u64 = 1_700_000_000_000;

    struct Quiet;

    impl NotificationScheduler for Quiet {
        fn schedule(&mut self, _after: u32, _name: &str) -> Result<NotificationId, EffectError> {
            Ok(NotificationId("q".into()))
        }
        fn cancel(&mut self, _id: &NotificationId) -> Result<(), EffectError> {
            Ok(())
        }
    }

    impl AudioCoordinator for Quiet {
        fn play(&mut self, _sound: &str) -> Result<(), EffectError> {
            Ok(())
        }
        fn pause(&mut self) -> Result<(), EffectError> {
            Ok(())
        }
        fn resume(&mut self) -> Result<(), EffectError> {
            Ok(())
        }
        fn stop(&mut self) -> Result<(), EffectError> {
            Ok(())
        }
    }

    impl StatsSink for Quiet {
        fn record(&mut self, _secs: u32, _name: Option<&str>) -> Result<(), EffectError> {
            Ok(())
        }
    }

    fn engine(
        clock: Rc<ManualClock>,
        store: Rc<MemoryBridgeStore>,
    ) -> FocusEngine<Rc<ManualClock>, Rc<MemoryBridgeStore>> {
        let effects =
            SideEffectCoordinator::new(Box::new(Quiet), Box::new(Quiet), Box::new(Quiet));
        let machine = SessionMachine::new(SessionDefaults {
            duration_secs: 60,
            name: None,
            sound: None,
        });
        FocusEngine::new(machine, effects, store, clock)
    }

    #[tokio::test]
    async fn ends_when_clock_has_expired() {
        let clock = Rc::new(ManualClock::new(T0));
        let mut engine = engine(clock.clone(), Rc::new(MemoryBridgeStore::new()));
        engine.start().unwrap();
        clock.advance_secs(61);

        let (_tx, rx) = mpsc::channel(1);
        let mut saves = 0;
        let exit = run(
            &mut engine,
            Duration::from_secs(1),
            rx,
            std::future::pending(),
            |_: &FocusEngine<_, _>| saves += 1,
        )
        .await;
        assert_eq!(exit, DriverExit::SessionEnded(PhaseKind::Completed));
        assert_eq!(saves, 1);
    }

    #[tokio::test]
    async fn idle_engine_returns_immediately() {
        let clock = Rc::new(ManualClock::new(T0));
        let mut engine = engine(clock, Rc::new(MemoryBridgeStore::new()));
        let (_tx, rx) = mpsc::channel(1);
        let exit = run(&mut engine, Duration::from_secs(1), rx, std::future::pending(), |_: &FocusEngine<_, _>| {}).await;
        assert_eq!(exit, DriverExit::SessionEnded(PhaseKind::Idle));
    }

    #[tokio::test]
    async fn first_tick_polls_bridge_then_shutdown_stops() {
        let clock = Rc::new(ManualClock::new(T0));
        let store = Rc::new(MemoryBridgeStore::new());
        let mut engine = engine(clock.clone(), store.clone());
        engine.start().unwrap();
        clock.advance_secs(10);
        store.set_snapshot(BridgeSnapshot {
            is_paused: true,
            remaining_seconds: 42,
            last_update_time: 1.0,
        });

        // Closed signal channel must not spin the loop.
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let exit = run(
            &mut engine,
            Duration::from_secs(3600),
            rx,
            tokio::time::sleep(Duration::from_millis(50)),
            |_: &FocusEngine<_, _>| {},
        )
        .await;
        assert_eq!(exit, DriverExit::Shutdown);
        assert_eq!(engine.machine().kind(), PhaseKind::Paused);
        assert_eq!(engine.remaining_secs(), 42);
    }

    #[tokio::test]
    async fn signals_reach_the_engine_and_checkpoint() {
        let clock = Rc::new(ManualClock::new(T0));
        let mut engine = engine(clock.clone(), Rc::new(MemoryBridgeStore::new()));
        engine.start().unwrap();
        clock.advance_secs(5);

        let (tx, rx) = mpsc::channel(4);
        tx.send(DriverSignal::Pause).await.unwrap();
        // Already paused: no change, no checkpoint.
        tx.send(DriverSignal::Pause).await.unwrap();
        let mut checkpoints = Vec::new();
        let exit = run(
            &mut engine,
            Duration::from_secs(3600),
            rx,
            tokio::time::sleep(Duration::from_millis(50)),
            |e: &FocusEngine<_, _>| checkpoints.push(e.machine().kind()),
        )
        .await;
        assert_eq!(exit, DriverExit::Shutdown);
        assert_eq!(checkpoints, vec![PhaseKind::Paused]);
        assert_eq!(engine.remaining_secs(), 55);
    }

    #[tokio::test]
    async fn reset_signal_ends_the_run() {
        let clock = Rc::new(ManualClock::new(T0));
        let mut engine = engine(clock, Rc::new(MemoryBridgeStore::new()));
        engine.start().unwrap();

        let (tx, rx) = mpsc::channel(1);
        tx.send(DriverSignal::Reset).await.unwrap();
        let exit = run(&mut engine, Duration::from_secs(3600), rx, std::future::pending(), |_: &FocusEngine<_, _>| {}).await;
        assert_eq!(exit, DriverExit::SessionEnded(PhaseKind::Idle));
    }

    #[test]
    fn signal_wire_format() {
        let json = serde_json::to_string(&DriverSignal::Sound { sound: Some("rain".into()) }).unwrap();
        assert_eq!(json, r#"{"intent":"sound","sound":"rain"}"#);
        let parsed: DriverSignal = serde_json::from_str(r#"{"intent":"pause"}"#).unwrap();
        assert_eq!(parsed, DriverSignal::Pause);
    }
}
