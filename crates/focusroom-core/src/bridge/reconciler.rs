//! Folds externally reported session state into the local state machine.
//!
//! The reconciler only decides *what* a snapshot means; the engine applies
//! the resulting [`BridgeIntent`] through the same machine commands a local
//! user intent uses, so side effects have exactly one code path.
//!
//! Ordering is by the writer's monotonic `last_update_time`, never by wall
//! clock: a snapshot is consumed only if its timestamp is strictly greater
//! than the last one consumed.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::snapshot::BridgeSnapshot;
use crate::timer::Phase;

/// A local command derived from an external snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum BridgeIntent {
    Pause { remaining_secs: u32 },
    Resume { remaining_secs: u32 },
    Adjust { remaining_secs: u32 },
    Expire,
}

/// Outcome of evaluating one snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconciliation {
    /// No session is active; the snapshot was left unconsumed.
    Inactive,
    /// Timestamp not newer than the last consumed one.
    Stale { last_applied: f64 },
    /// Zero-remaining report inside the grace window after a local start.
    Suppressed,
    /// Consumed; the intent is `None` when local state already agrees.
    Applied(Option<BridgeIntent>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeReconciler {
    /// Timestamp of the last consumed snapshot.
    #[serde(default)]
    last_applied: Option<f64>,
    /// Wall-clock instant of the last local fresh start.
    #[serde(default)]
    last_local_start_ms: Option<u64>,
    #[serde(default = "default_grace_window_ms")]
    grace_window_ms: u64,
    #[serde(default = "default_drift_tolerance_secs")]
    drift_tolerance_secs: u32,
}

fn default_grace_window_ms() -> u64 {
    2_000
}

fn default_drift_tolerance_secs() -> u32 {
    1
}

impl Default for BridgeReconciler {
    fn default() -> Self {
        Self::new(default_grace_window_ms(), default_drift_tolerance_secs())
    }
}

impl BridgeReconciler {
    pub fn new(grace_window_ms: u64, drift_tolerance_secs: u32) -> Self {
        Self {
            last_applied: None,
            last_local_start_ms: None,
            grace_window_ms,
            drift_tolerance_secs,
        }
    }

    pub fn set_policy(&mut self, grace_window_ms: u64, drift_tolerance_secs: u32) {
        self.grace_window_ms = grace_window_ms;
        self.drift_tolerance_secs = drift_tolerance_secs;
    }

    pub fn last_applied(&self) -> Option<f64> {
        self.last_applied
    }

    /// Record a local fresh start.
    ///
    /// `baseline` is the timestamp currently in the store: whatever it holds
    /// describes an earlier run and must never be applied to this one.
    pub fn note_local_start(&mut self, now_ms: u64, baseline: Option<f64>) {
        self.last_local_start_ms = Some(now_ms);
        if let Some(baseline) = baseline {
            self.consume(baseline);
        }
    }

    /// Decide what `snapshot` means for the local `phase`.
    pub fn evaluate(
        &mut self,
        snapshot: &BridgeSnapshot,
        phase: Phase,
        local_remaining_secs: u32,
        now_ms: u64,
    ) -> Reconciliation {
        if !phase.is_active() {
            return Reconciliation::Inactive;
        }
        if let Some(last_applied) = self.last_applied {
            if snapshot.last_update_time <= last_applied {
                return Reconciliation::Stale { last_applied };
            }
        }
        self.consume(snapshot.last_update_time);

        if snapshot.remaining_seconds == 0 {
            if self.within_grace(now_ms) {
                debug!(
                    last_update_time = snapshot.last_update_time,
                    "zero-remaining report inside grace window ignored"
                );
                return Reconciliation::Suppressed;
            }
            return Reconciliation::Applied(Some(BridgeIntent::Expire));
        }

        let remaining_secs = snapshot.remaining_seconds;
        let intent = match (phase, snapshot.is_paused) {
            (Phase::Running { .. }, true) => Some(BridgeIntent::Pause { remaining_secs }),
            (Phase::Paused { .. }, false) => Some(BridgeIntent::Resume { remaining_secs }),
            (Phase::Running { .. }, false)
                if remaining_secs.abs_diff(local_remaining_secs) > self.drift_tolerance_secs =>
            {
                Some(BridgeIntent::Adjust { remaining_secs })
            }
            (Phase::Paused { .. }, true) if remaining_secs != local_remaining_secs => {
                Some(BridgeIntent::Adjust { remaining_secs })
            }
            _ => None,
        };
        Reconciliation::Applied(intent)
    }

    fn consume(&mut self, last_update_time: f64) {
        self.last_applied = Some(match self.last_applied {
            Some(prev) => prev.max(last_update_time),
            None => last_update_time,
        });
    }

    fn within_grace(&self, now_ms: u64) -> bool {
        self.last_local_start_ms
            .is_some_and(|start| now_ms.saturating_sub(start) < self.grace_window_ms)
    }
}
