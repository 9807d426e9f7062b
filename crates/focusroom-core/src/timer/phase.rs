use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The session's current state. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Running {
        end_epoch_ms: u64,
        total_secs: u32,
    },
    Paused {
        remaining_secs: u32,
        total_secs: u32,
    },
    Completed {
        total_secs: u32,
    },
}

impl Phase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Phase::Idle => PhaseKind::Idle,
            Phase::Running { .. } => PhaseKind::Running,
            Phase::Paused { .. } => PhaseKind::Paused,
            Phase::Completed { .. } => PhaseKind::Completed,
        }
    }

    /// Total duration of the current run, if any.
    pub fn total_secs(&self) -> Option<u32> {
        match *self {
            Phase::Idle => None,
            Phase::Running { total_secs, .. }
            | Phase::Paused { total_secs, .. }
            | Phase::Completed { total_secs } => Some(total_secs),
        }
    }

    /// Running or Paused.
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Running { .. } | Phase::Paused { .. })
    }
}

/// Fieldless mirror of [`Phase`] used in transition records and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Idle,
    Running,
    Paused,
    Completed,
}

/// Latch that makes completion side effects at-most-once per run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionGuard {
    did_log_completion: bool,
}

impl CompletionGuard {
    /// Set the latch. Returns `true` only for the call that set it.
    pub fn try_latch(&mut self) -> bool {
        if self.did_log_completion {
            return false;
        }
        self.did_log_completion = true;
        true
    }

    pub fn clear(&mut self) {
        self.did_log_completion = false;
    }

    pub fn is_set(&self) -> bool {
        self.did_log_completion
    }
}

/// Per-run identity captured at a fresh start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: Uuid,
    pub name: Option<String>,
    pub sound: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// One edge taken by the state machine.
///
/// `from == to` is legal for `Running` and `Paused` when a bridge report
/// rewrites the remaining time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: PhaseKind,
    pub to: PhaseKind,
    /// Remaining seconds immediately after the transition.
    pub remaining_secs: u32,
}

impl Transition {
    pub fn is_reentry(&self) -> bool {
        self.from == self.to
    }
}
