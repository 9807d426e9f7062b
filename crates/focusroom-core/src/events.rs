use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bridge::BridgeIntent;
use crate::timer::PhaseKind;

/// Where a transition was requested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// User or UI intent inside this process.
    Local,
    /// The session clock reaching zero.
    Clock,
    /// A snapshot written by an out-of-process surface.
    Bridge,
}

/// Every state change in the engine produces an Event.
/// Subscribers receive them through [`crate::FocusEngine::subscribe`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    SessionStarted {
        session_id: Uuid,
        name: Option<String>,
        duration_secs: u32,
        at: DateTime<Utc>,
    },
    SessionPaused {
        remaining_secs: u32,
        origin: Origin,
        at: DateTime<Utc>,
    },
    SessionResumed {
        remaining_secs: u32,
        origin: Origin,
        at: DateTime<Utc>,
    },
    SessionCompleted {
        session_id: Option<Uuid>,
        duration_secs: u32,
        origin: Origin,
        at: DateTime<Utc>,
    },
    SessionReset {
        at: DateTime<Utc>,
    },
    /// An external report moved the remaining time without a phase change.
    RemainingAdjusted {
        remaining_secs: u32,
        at: DateTime<Utc>,
    },
    /// A bridge snapshot was accepted by the reconciler.
    BridgeApplied {
        last_update_time: f64,
        intent: Option<BridgeIntent>,
        at: DateTime<Utc>,
    },
    StateSnapshot {
        phase: PhaseKind,
        remaining_secs: u32,
        total_secs: u32,
        progress: f64,
        name: Option<String>,
        session_id: Option<Uuid>,
        end_epoch_ms: Option<u64>,
        completion_logged: bool,
        at: DateTime<Utc>,
    },
}
