//! Property tests for clock arithmetic and bridge staleness.

use focusroom_core::bridge::Reconciliation;
use focusroom_core::timer::CompletionGuard;
use focusroom_core::{BridgeReconciler, BridgeSnapshot, Phase, SessionDefaults, SessionMachine};
use proptest::prelude::*;

const T0: u64 = 1_700_000_000_000;

fn machine(duration_secs: u32) -> SessionMachine {
    SessionMachine::new(SessionDefaults {
        duration_secs,
        name: None,
        sound: None,
    })
}

proptest! {
    #[test]
    fn remaining_is_ceiling_of_time_to_end(d in 1u32..100_000, elapsed_ms in 0u64..200_000_000) {
        let mut m = machine(d);
        m.start(T0).unwrap();
        let end = T0 + u64::from(d) * 1000;
        let now = T0 + elapsed_ms;
        let expected = end.saturating_sub(now).div_ceil(1000);
        prop_assert_eq!(u64::from(m.remaining_secs(now)), expected);
    }

    #[test]
    fn pause_resume_gap_does_not_change_remaining(
        d in 2u32..10_000,
        run_secs in 0u32..10_000,
        gap_ms in 0u64..100_000_000,
    ) {
        prop_assume!(run_secs < d);
        let mut m = machine(d);
        m.start(T0).unwrap();
        let pause_at = T0 + u64::from(run_secs) * 1000;
        let paused = m.pause(pause_at).unwrap();
        let resume_at = pause_at + gap_ms;
        m.resume(resume_at).unwrap();
        prop_assert_eq!(m.remaining_secs(resume_at), paused.remaining_secs);
        prop_assert_eq!(m.remaining_secs(resume_at), d - run_secs);
    }

    #[test]
    fn non_increasing_timestamps_never_apply(
        first in 1.0f64..1e9,
        deltas in proptest::collection::vec(0.0f64..1e6, 1..20),
        paused in any::<bool>(),
        remaining in 1u32..5000,
    ) {
        let mut r = BridgeReconciler::default();
        let phase = Phase::Running { end_epoch_ms: T0 + 5_000_000, total_secs: 5000 };
        let now = T0 + 60_000;
        let snap = BridgeSnapshot { is_paused: paused, remaining_seconds: remaining, last_update_time: first };
        let applied = r.evaluate(&snap, phase, 5000, now);
        prop_assert!(matches!(applied, Reconciliation::Applied(_)));

        for delta in deltas {
            let older = BridgeSnapshot { last_update_time: first - delta, ..snap };
            prop_assert_eq!(
                r.evaluate(&older, phase, 5000, now),
                Reconciliation::Stale { last_applied: first }
            );
        }
    }

    #[test]
    fn completion_guard_latches_once(attempts in 1usize..50) {
        let mut guard = CompletionGuard::default();
        let wins = (0..attempts).filter(|_| guard.try_latch()).count();
        prop_assert_eq!(wins, 1);
    }
}
